//! In-process statistics broadcaster.
//!
//! Components record counters and gauges on a [`StatsHub`]; the `Stat`
//! probe (see [`crate::probes::stat`]) filters and republishes them so
//! monitors anywhere in the mesh can watch them.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of the stats channel.
const STATS_BUFFER: usize = 1024;

/// How a value should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatKind {
    /// Increment of a running count
    Counter,
    /// Point-in-time measurement
    Gauge,
    /// Elapsed time in milliseconds
    Timer,
}

/// One statistic sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stat {
    pub module: String,
    pub name: String,
    pub value: f64,
    pub kind: StatKind,
}

impl Stat {
    /// Returns `module.name`, the string patterns match against.
    pub fn path(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }
}

/// Cheap-to-clone broadcaster of [`Stat`] samples.
#[derive(Debug, Clone)]
pub struct StatsHub {
    sender: broadcast::Sender<Stat>,
}

impl StatsHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(STATS_BUFFER);
        Self { sender }
    }

    /// Publishes a sample. Samples with no subscriber are dropped.
    pub fn emit(&self, module: &str, name: &str, value: f64, kind: StatKind) {
        let _ = self.sender.send(Stat {
            module: module.to_string(),
            name: name.to_string(),
            value,
            kind,
        });
    }

    /// Records a counter increment of one.
    pub fn increment(&self, module: &str, name: &str) {
        self.emit(module, name, 1.0, StatKind::Counter);
    }

    /// Records a gauge value.
    pub fn gauge(&self, module: &str, name: &str, value: f64) {
        self.emit(module, name, value, StatKind::Gauge);
    }

    /// Subscribes to future samples.
    pub fn subscribe(&self) -> broadcast::Receiver<Stat> {
        self.sender.subscribe()
    }
}

impl Default for StatsHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let hub = StatsHub::new();
        let mut rx = hub.subscribe();

        hub.increment("router", "connections");
        hub.gauge("process", "memory_mb", 12.0);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.path(), "router.connections");
        assert_eq!(first.kind, StatKind::Counter);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.value, 12.0);
        assert_eq!(second.kind, StatKind::Gauge);
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        StatsHub::new().increment("router", "connections");
    }
}
