//! ---
//! iocman_section: "03-control-point-bus"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Control-point bus, point API and liveness probing."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
//! Worker liveness probing.
//!
//! Every worker refreshes `<prefix>:<worker>_time` with its wall-clock Unix
//! time. The probe reads that point and hands back the timestamp; turning it
//! into an age and a [`Liveness`] class is left to the caller so transport
//! concerns never leak into classification.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::point::qualified_name;
use crate::PointReader;

/// Why a liveness reading could not be obtained.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProbeFault {
    /// The bus did not answer within the probe timeout.
    #[error("liveness probe timed out after {0:?}")]
    Timeout(Duration),
    /// The liveness point does not exist or holds no timestamp.
    #[error("liveness point {0} not published")]
    NotPublished(String),
    /// The bus backend failed.
    #[error("liveness probe transport error: {0}")]
    TransportError(String),
}

/// Heartbeat classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Liveness {
    /// Timestamp refreshed within the stale threshold.
    Fresh,
    /// Timestamp readable but older than the threshold: was alive, now silent.
    Stale,
    /// No usable reading this sweep.
    Unknown,
}

impl Liveness {
    /// Classify a probed age against the stale threshold. `None` means the
    /// probe produced no reading.
    pub fn classify(age: Option<f64>, threshold: Duration) -> Self {
        match age {
            Some(age) if age > threshold.as_secs_f64() => Liveness::Stale,
            Some(_) => Liveness::Fresh,
            None => Liveness::Unknown,
        }
    }

    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Liveness::Fresh => "fresh",
            Liveness::Stale => "stale",
            Liveness::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of liveness timestamps.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Read the worker's last liveness timestamp (Unix seconds).
    async fn probe(&self, worker: &str, timeout: Duration) -> Result<f64, ProbeFault>;
}

/// Probe reading `<prefix>:<worker>_time` from any [`PointReader`].
#[derive(Clone)]
pub struct BusLivenessProbe {
    reader: Arc<dyn PointReader>,
    prefix: String,
}

impl BusLivenessProbe {
    /// Create a probe over `reader` for points under `prefix`.
    pub fn new(reader: Arc<dyn PointReader>, prefix: impl Into<String>) -> Self {
        Self {
            reader,
            prefix: prefix.into(),
        }
    }

    /// Name of the liveness point for `worker`.
    pub fn point_name(&self, worker: &str) -> String {
        qualified_name(&self.prefix, &format!("{worker}_time"))
    }
}

#[async_trait]
impl LivenessProbe for BusLivenessProbe {
    async fn probe(&self, worker: &str, timeout: Duration) -> Result<f64, ProbeFault> {
        let name = self.point_name(worker);
        let point = match tokio::time::timeout(timeout, self.reader.read(&name)).await {
            Err(_) => return Err(ProbeFault::Timeout(timeout)),
            Ok(Err(err)) => return Err(ProbeFault::TransportError(err.to_string())),
            Ok(Ok(None)) => return Err(ProbeFault::NotPublished(name)),
            Ok(Ok(Some(point))) => point,
        };
        match point.value.as_f64() {
            Some(timestamp) if timestamp.is_finite() => Ok(timestamp),
            _ => {
                debug!(point = %name, value = %point.value, "liveness point holds no timestamp");
                Err(ProbeFault::NotPublished(name))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::{AlarmSeverity, Point, PointValue};
    use crate::{InMemoryPointBus, PointBus};
    use iocman_common::time::{age_seconds, unix_now};

    struct SlowReader;

    #[async_trait]
    impl PointReader for SlowReader {
        async fn read(&self, _name: &str) -> crate::Result<Option<Point>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }

        fn describe(&self) -> String {
            "slow".into()
        }
    }

    #[test]
    fn classifies_against_threshold() {
        let threshold = Duration::from_secs(20);
        assert_eq!(Liveness::classify(Some(3.0), threshold), Liveness::Fresh);
        assert_eq!(Liveness::classify(Some(20.0), threshold), Liveness::Fresh);
        assert_eq!(Liveness::classify(Some(20.5), threshold), Liveness::Stale);
        assert_eq!(Liveness::classify(None, threshold), Liveness::Unknown);
    }

    #[tokio::test]
    async fn reads_timestamp_from_time_point() {
        let bus = InMemoryPointBus::new();
        bus.publish(
            "IOC:MAN:magnet1_time",
            PointValue::Float(1_700_000_000.5),
            AlarmSeverity::NoAlarm,
        )
        .await
        .unwrap();
        let probe = BusLivenessProbe::new(Arc::new(bus), "IOC:MAN");
        let ts = probe
            .probe("magnet1", Duration::from_secs(1))
            .await
            .expect("timestamp");
        assert_eq!(ts, 1_700_000_000.5);
    }

    #[tokio::test]
    async fn missing_or_textual_point_is_not_published() {
        let bus = InMemoryPointBus::new();
        bus.publish("P:flow_time", PointValue::Text("n/a".into()), AlarmSeverity::NoAlarm)
            .await
            .unwrap();
        let probe = BusLivenessProbe::new(Arc::new(bus), "P");
        assert_eq!(
            probe.probe("magnet1", Duration::from_secs(1)).await,
            Err(ProbeFault::NotPublished("P:magnet1_time".into()))
        );
        assert!(matches!(
            probe.probe("flow", Duration::from_secs(1)).await,
            Err(ProbeFault::NotPublished(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_reader_times_out() {
        let probe = BusLivenessProbe::new(Arc::new(SlowReader), "P");
        assert_eq!(
            probe.probe("magnet1", Duration::from_secs(2)).await,
            Err(ProbeFault::Timeout(Duration::from_secs(2)))
        );
    }

    #[tokio::test]
    async fn future_timestamps_give_zero_age() {
        let bus = InMemoryPointBus::new();
        bus.publish(
            "P:magnet1_time",
            PointValue::Float(unix_now() + 3600.0),
            AlarmSeverity::NoAlarm,
        )
        .await
        .unwrap();
        let probe = BusLivenessProbe::new(Arc::new(bus), "P");
        let timestamp = probe
            .probe("magnet1", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(age_seconds(unix_now(), timestamp), 0.0);
    }
}
