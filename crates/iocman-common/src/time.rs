//! ---
//! iocman_section: "01-core-functionality"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Shared primitives and utilities for the fleet runtime."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
use chrono::Utc;

/// Current wall-clock time as fractional Unix seconds, matching the format
/// workers write into their liveness points.
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Seconds elapsed between `timestamp` and `now`. Clock skew that puts the
/// timestamp in the future yields zero.
pub fn age_seconds(now: f64, timestamp: f64) -> f64 {
    (now - timestamp).max(0.0)
}

/// Truncate an age to whole seconds, saturating at `cap`.
pub fn whole_seconds(age: f64, cap: u32) -> u32 {
    if !age.is_finite() || age >= f64::from(cap) {
        cap
    } else {
        age.max(0.0) as u32
    }
}
