//! ---
//! iocman_section: "03-control-point-bus"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Control-point bus, point API and liveness probing."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::trace;

use crate::point::{AlarmSeverity, Point, PointValue, PointWrite};
use crate::{PointBus, PointReader, Result};

const WRITE_CHANNEL_CAPACITY: usize = 256;

/// In-process point table. Cloning yields another handle to the same table.
#[derive(Clone)]
pub struct InMemoryPointBus {
    points: Arc<RwLock<IndexMap<String, Point>>>,
    writes: broadcast::Sender<PointWrite>,
}

impl InMemoryPointBus {
    /// Create an empty table.
    pub fn new() -> Self {
        let (writes, _) = broadcast::channel(WRITE_CHANNEL_CAPACITY);
        Self {
            points: Arc::new(RwLock::new(IndexMap::new())),
            writes,
        }
    }

    /// Synchronous read, for tests and the API layer.
    pub fn get(&self, name: &str) -> Option<Point> {
        self.points.read().get(name).cloned()
    }

    /// Number of points held.
    pub fn len(&self) -> usize {
        self.points.read().len()
    }

    /// Whether no point has been published yet.
    pub fn is_empty(&self) -> bool {
        self.points.read().is_empty()
    }
}

impl Default for InMemoryPointBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PointReader for InMemoryPointBus {
    async fn read(&self, name: &str) -> Result<Option<Point>> {
        Ok(self.get(name))
    }

    fn describe(&self) -> String {
        "in_memory".to_owned()
    }
}

#[async_trait]
impl PointBus for InMemoryPointBus {
    async fn publish(&self, name: &str, value: PointValue, severity: AlarmSeverity) -> Result<()> {
        trace!(point = name, value = %value, ?severity, "publish");
        self.points
            .write()
            .insert(name.to_owned(), Point::now(value, severity));
        Ok(())
    }

    async fn write(&self, name: &str, value: PointValue) -> Result<Point> {
        let point = {
            let mut points = self.points.write();
            let severity = points.get(name).map(|p| p.severity).unwrap_or_default();
            let point = Point::now(value.clone(), severity);
            points.insert(name.to_owned(), point.clone());
            point
        };
        // No receivers is fine: nothing is listening for commands yet.
        let _ = self.writes.send(PointWrite {
            name: name.to_owned(),
            value,
        });
        Ok(point)
    }

    async fn list(&self) -> Result<Vec<(String, Point)>> {
        Ok(self
            .points
            .read()
            .iter()
            .map(|(name, point)| (name.clone(), point.clone()))
            .collect())
    }

    fn subscribe_writes(&self) -> broadcast::Receiver<PointWrite> {
        self.writes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_does_not_notify_but_write_does() {
        let bus = InMemoryPointBus::new();
        let mut writes = bus.subscribe_writes();

        bus.publish("IOC:MAN:magnet1_control", PointValue::Int(0), AlarmSeverity::Minor)
            .await
            .unwrap();
        assert!(writes.try_recv().is_err());

        let point = bus
            .write("IOC:MAN:magnet1_control", PointValue::Int(1))
            .await
            .unwrap();
        assert_eq!(point.severity, AlarmSeverity::Minor);
        let write = writes.try_recv().expect("write notified");
        assert_eq!(write.name, "IOC:MAN:magnet1_control");
        assert_eq!(write.value, PointValue::Int(1));
    }

    #[tokio::test]
    async fn list_keeps_first_publish_order() {
        let bus = InMemoryPointBus::new();
        for name in ["b", "a", "c"] {
            bus.publish(name, PointValue::Int(0), AlarmSeverity::NoAlarm)
                .await
                .unwrap();
        }
        bus.publish("b", PointValue::Int(5), AlarmSeverity::NoAlarm)
            .await
            .unwrap();
        let names: Vec<_> = bus.list().await.unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert_eq!(bus.get("b").unwrap().value, PointValue::Int(5));
    }

    #[tokio::test]
    async fn clones_share_the_table() {
        let bus = InMemoryPointBus::new();
        let other = bus.clone();
        other.write("x", PointValue::Float(1.5)).await.unwrap();
        assert!(bus.read("x").await.unwrap().is_some());
        assert!(bus.read("y").await.unwrap().is_none());
    }
}
