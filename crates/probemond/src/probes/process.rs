//! The `Process` probe: resource usage of the running process.
//!
//! Samples memory and CPU with `sysinfo` every `interval_ms` and publishes
//! them as attributes and as `process.*` gauges on the stats hub.

use std::process;
use std::sync::{Arc, Mutex, PoisonError};

use probemon_core::{
    async_trait, AttributeStore, Attributes, ProbeBehavior, ProbeError, ProbeFactory, ProbeInit,
    ProbeResult, WritableAttributes,
};
use serde::Serialize;
use serde_json::{json, Value};
use sysinfo::{Pid, System};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{interval_of, validate_interval};
use crate::stats::StatsHub;

pub const PROCESS_CLASS: &str = "Process";

const DEFAULT_INTERVAL_MS: u64 = 5000;

/// Memory usage warning threshold in MB.
pub const HIGH_MEMORY_THRESHOLD_MB: u64 = 512;

/// One resource usage sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessMetrics {
    pub pid: u32,

    /// Resident memory in bytes
    pub memory_bytes: u64,

    /// Resident memory in megabytes (convenience)
    pub memory_mb: u64,

    /// CPU usage as percentage (0.0 - 100.0+)
    pub cpu_percent: f32,

    /// Seconds since the process started
    pub uptime_secs: u64,
}

impl ProcessMetrics {
    fn to_attributes(&self) -> Attributes {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Attributes::new(),
        }
    }
}

/// Samples resource usage of the current process.
///
/// CPU usage is relative to the previous refresh, so the first sample
/// usually reports 0.
pub struct ProcessMonitor {
    system: System,
    pid: Pid,
}

impl ProcessMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(process::id()),
        }
    }

    /// Refreshes process information and returns current metrics.
    pub fn refresh(&mut self) -> ProcessMetrics {
        // refresh_all() is required for the CPU percentage to be computed
        self.system.refresh_all();

        let (memory_bytes, cpu_percent, uptime_secs) = self
            .system
            .process(self.pid)
            .map(|p| (p.memory(), p.cpu_usage(), p.run_time()))
            .unwrap_or((0, 0.0, 0));

        ProcessMetrics {
            pid: self.pid.as_u32(),
            memory_bytes,
            memory_mb: memory_bytes / 1024 / 1024,
            cpu_percent,
            uptime_secs,
        }
    }
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates `Process` probes.
pub struct ProcessFactory {
    hub: StatsHub,
}

impl ProcessFactory {
    pub fn new(hub: StatsHub) -> Self {
        Self { hub }
    }
}

impl ProbeFactory for ProcessFactory {
    fn writable_attributes(&self) -> WritableAttributes {
        WritableAttributes::only(["interval_ms"])
    }

    fn create(&self, init: ProbeInit) -> ProbeResult<Box<dyn ProbeBehavior>> {
        validate_interval(init.init_params.get("interval_ms")).map_err(ProbeError::InvalidParams)?;

        let mut defaults = Attributes::new();
        defaults.insert(
            "interval_ms".to_string(),
            json!(interval_of(&init.attributes, DEFAULT_INTERVAL_MS).as_millis() as u64),
        );
        init.attributes.set_silent(defaults);

        Ok(Box::new(ProcessProbe {
            sampler: Sampler {
                attributes: init.attributes,
                hub: self.hub.clone(),
                monitor: Arc::new(Mutex::new(ProcessMonitor::new())),
            },
            cancel: CancellationToken::new(),
        }))
    }
}

#[derive(Clone)]
struct Sampler {
    attributes: AttributeStore,
    hub: StatsHub,
    monitor: Arc<Mutex<ProcessMonitor>>,
}

impl Sampler {
    fn sample(&self) -> ProcessMetrics {
        let metrics = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .refresh();

        if metrics.memory_mb > HIGH_MEMORY_THRESHOLD_MB {
            warn!(
                memory_mb = metrics.memory_mb,
                threshold_mb = HIGH_MEMORY_THRESHOLD_MB,
                "HIGH MEMORY: process memory usage above threshold"
            );
        }

        self.attributes.set(metrics.to_attributes());
        self.hub.gauge("process", "memory_mb", metrics.memory_mb as f64);
        self.hub
            .gauge("process", "cpu_percent", f64::from(metrics.cpu_percent));
        metrics
    }
}

struct ProcessProbe {
    sampler: Sampler,
    cancel: CancellationToken,
}

#[async_trait]
impl ProbeBehavior for ProcessProbe {
    async fn initialize(&self) -> ProbeResult<()> {
        self.sampler.sample();
        tokio::spawn(run(self.sampler.clone(), self.cancel.clone()));
        Ok(())
    }

    async fn control(&self, name: &str, _params: Value) -> ProbeResult<Value> {
        match name {
            "refresh" => serde_json::to_value(self.sampler.sample())
                .map_err(|e| ProbeError::ControlFailed(e.to_string())),
            _ => Err(ProbeError::NoControl(name.to_string())),
        }
    }

    fn validate(&self, changes: &Attributes) -> Result<(), String> {
        validate_interval(changes.get("interval_ms"))
    }

    fn release(&self) {
        self.cancel.cancel();
    }
}

async fn run(sampler: Sampler, cancel: CancellationToken) {
    let mut period = interval_of(&sampler.attributes, DEFAULT_INTERVAL_MS);
    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = tick.tick() => {
                sampler.sample();

                let next = interval_of(&sampler.attributes, DEFAULT_INTERVAL_MS);
                if next != period {
                    period = next;
                    tick = interval_at(Instant::now() + period, period);
                    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                }
            }
        }
    }

    debug!("Process probe worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use probemon_core::{ProbeId, ID_ATTRIBUTE};

    fn init() -> ProbeInit {
        let mut initial = Attributes::new();
        initial.insert(ID_ATTRIBUTE.to_string(), json!("p1"));
        ProbeInit {
            id: ProbeId::new("p1"),
            init_params: Attributes::new(),
            attributes: AttributeStore::new(initial),
        }
    }

    #[test]
    fn test_monitor_refresh_returns_metrics() {
        let mut monitor = ProcessMonitor::new();
        let metrics = monitor.refresh();

        assert_eq!(metrics.pid, process::id());
        assert!(metrics.memory_bytes > 0);
        assert!(metrics.cpu_percent >= 0.0);
    }

    #[tokio::test]
    async fn test_initialize_publishes_first_sample() {
        let factory = ProcessFactory::new(StatsHub::new());
        let init = init();
        let attributes = init.attributes.clone();

        let probe = factory.create(init).unwrap();
        probe.initialize().await.unwrap();

        assert_eq!(attributes.get("pid"), Some(json!(process::id())));
        assert_eq!(attributes.get("interval_ms"), Some(json!(DEFAULT_INTERVAL_MS)));
        probe.release();
    }

    #[tokio::test]
    async fn test_refresh_control() {
        let factory = ProcessFactory::new(StatsHub::new());
        let probe = factory.create(init()).unwrap();

        let result = probe.control("refresh", Value::Null).await.unwrap();
        assert_eq!(result["pid"], json!(process::id()));

        let err = probe.control("nope", Value::Null).await.unwrap_err();
        assert_eq!(err.code(), Some("NO_CONTROL"));
    }
}
