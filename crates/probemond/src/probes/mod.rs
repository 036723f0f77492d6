//! Probe classes shipped with the daemon.
//!
//! - `Stat`: republishes matching [`StatsHub`] samples as a `bundle`
//! - `Process`: CPU and memory of the running process

use std::time::Duration;

use probemon_core::{AttributeStore, ProbeClasses};
use serde_json::Value;

use crate::stats::StatsHub;

pub mod process;
pub mod stat;

pub use process::{ProcessFactory, ProcessMetrics, ProcessMonitor, PROCESS_CLASS};
pub use stat::{StatFactory, STAT_CLASS};

/// Smallest accepted publishing interval.
pub const MIN_INTERVAL_MS: u64 = 10;

/// Registers the built-in classes.
pub fn register_builtin(classes: &mut ProbeClasses, hub: &StatsHub) {
    classes
        .register(STAT_CLASS, StatFactory::new(hub.clone()))
        .register(PROCESS_CLASS, ProcessFactory::new(hub.clone()));
}

/// Reads `interval_ms` from a probe's attributes.
pub(crate) fn interval_of(attributes: &AttributeStore, default_ms: u64) -> Duration {
    let ms = attributes
        .get("interval_ms")
        .and_then(|v| v.as_u64())
        .unwrap_or(default_ms)
        .max(MIN_INTERVAL_MS);
    Duration::from_millis(ms)
}

/// Checks a requested `interval_ms` value.
pub(crate) fn validate_interval(value: Option<&Value>) -> Result<(), String> {
    match value {
        None => Ok(()),
        Some(v) => match v.as_u64() {
            Some(ms) if ms >= MIN_INTERVAL_MS => Ok(()),
            _ => Err(format!(
                "interval_ms must be an integer >= {MIN_INTERVAL_MS}, got {v}"
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_classes() {
        let mut classes = ProbeClasses::new();
        register_builtin(&mut classes, &StatsHub::new());
        assert_eq!(classes.names(), vec!["Process".to_string(), "Stat".to_string()]);
    }

    #[test]
    fn test_interval_validation() {
        assert!(validate_interval(None).is_ok());
        assert!(validate_interval(Some(&json!(250))).is_ok());
        assert!(validate_interval(Some(&json!(1))).is_err());
        assert!(validate_interval(Some(&json!("fast"))).is_err());
    }

    #[test]
    fn test_interval_floor() {
        let mut initial = probemon_core::Attributes::new();
        initial.insert("interval_ms".to_string(), json!(0));
        let store = AttributeStore::new(initial);
        assert_eq!(interval_of(&store, 1000), Duration::from_millis(MIN_INTERVAL_MS));
    }
}
