//! ---
//! iocman_section: "03-control-point-bus"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Control-point bus, point API and liveness probing."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Build the qualified point name `<prefix>:<suffix>`.
pub fn qualified_name(prefix: &str, suffix: &str) -> String {
    format!("{prefix}:{suffix}")
}

/// Scalar carried by a point. Enumerated points carry their index as `Int`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointValue {
    /// Integer or enum index.
    Int(i64),
    /// Floating point reading, e.g. a Unix timestamp.
    Float(f64),
    /// Free text.
    Text(String),
}

impl PointValue {
    /// Numeric view of the value. Text parses when it holds a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PointValue::Int(value) => Some(*value as f64),
            PointValue::Float(value) => Some(*value),
            PointValue::Text(text) => text.trim().parse().ok(),
        }
    }

    /// Integer view of the value. Floats are accepted only when integral.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PointValue::Int(value) => Some(*value),
            PointValue::Float(value) if value.fract() == 0.0 => Some(*value as i64),
            PointValue::Float(_) => None,
            PointValue::Text(text) => text.trim().parse().ok(),
        }
    }
}

impl fmt::Display for PointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointValue::Int(value) => write!(f, "{value}"),
            PointValue::Float(value) => write!(f, "{value}"),
            PointValue::Text(text) => f.write_str(text),
        }
    }
}

/// Alarm severity attached to a published point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmSeverity {
    /// Normal.
    #[default]
    NoAlarm,
    /// Attention, e.g. a worker deliberately stopped.
    Minor,
    /// Fault needing operator action.
    Major,
}

/// Current value of a point with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Current value.
    pub value: PointValue,
    /// Alarm severity.
    #[serde(default)]
    pub severity: AlarmSeverity,
    /// Time of the last publish or write.
    pub updated: DateTime<Utc>,
}

impl Point {
    /// A point stamped with the current time.
    pub fn now(value: PointValue, severity: AlarmSeverity) -> Self {
        Self {
            value,
            severity,
            updated: Utc::now(),
        }
    }
}

/// Notification delivered to write subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct PointWrite {
    /// Qualified point name.
    pub name: String,
    /// Value written.
    pub value: PointValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_values_follow_json_types() {
        let int: PointValue = serde_json::from_str("2").unwrap();
        let float: PointValue = serde_json::from_str("1712000000.25").unwrap();
        let text: PointValue = serde_json::from_str("\"Running\"").unwrap();
        assert_eq!(int, PointValue::Int(2));
        assert_eq!(float, PointValue::Float(1712000000.25));
        assert_eq!(text, PointValue::Text("Running".into()));
    }

    #[test]
    fn numeric_views() {
        assert_eq!(PointValue::Float(1.0).as_i64(), Some(1));
        assert_eq!(PointValue::Float(1.5).as_i64(), None);
        assert_eq!(PointValue::Text(" 12.5 ".into()).as_f64(), Some(12.5));
        assert_eq!(PointValue::Text("abc".into()).as_f64(), None);
    }

    #[test]
    fn severity_serializes_in_alarm_style() {
        let json = serde_json::to_string(&AlarmSeverity::NoAlarm).unwrap();
        assert_eq!(json, "\"NO_ALARM\"");
    }
}
