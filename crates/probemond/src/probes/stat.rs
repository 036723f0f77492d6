//! The `Stat` probe: filtered statistics bundles.
//!
//! `initParams { pattern, interval_ms }`. Samples from the [`StatsHub`]
//! whose `module.name` matches `pattern` are buffered and published as the
//! `bundle` attribute once per interval. Empty intervals publish nothing.

use std::time::Duration;

use chrono::Utc;
use probemon_core::{
    async_trait, compile, AttributeStore, Attributes, PatternMatcher, ProbeBehavior, ProbeError,
    ProbeFactory, ProbeInit, ProbeResult, WritableAttributes,
};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{interval_of, validate_interval};
use crate::stats::{Stat, StatsHub};

pub const STAT_CLASS: &str = "Stat";

const DEFAULT_PATTERN: &str = "*";
const DEFAULT_INTERVAL_MS: u64 = 1000;

/// Creates `Stat` probes bound to one hub.
pub struct StatFactory {
    hub: StatsHub,
}

impl StatFactory {
    pub fn new(hub: StatsHub) -> Self {
        Self { hub }
    }
}

impl ProbeFactory for StatFactory {
    fn writable_attributes(&self) -> WritableAttributes {
        WritableAttributes::only(["pattern", "interval_ms"])
    }

    fn create(&self, init: ProbeInit) -> ProbeResult<Box<dyn ProbeBehavior>> {
        let pattern = pattern_of(&init.attributes);
        compile(&pattern).map_err(|e| ProbeError::InvalidParams(e.to_string()))?;
        validate_interval(init.init_params.get("interval_ms")).map_err(ProbeError::InvalidParams)?;

        let mut defaults = Attributes::new();
        defaults.insert("pattern".to_string(), Value::String(pattern));
        defaults.insert(
            "interval_ms".to_string(),
            json!(interval_of(&init.attributes, DEFAULT_INTERVAL_MS).as_millis() as u64),
        );
        defaults.insert("bundle".to_string(), Value::Array(Vec::new()));
        init.attributes.set_silent(defaults);

        Ok(Box::new(StatProbe {
            attributes: init.attributes,
            hub: self.hub.clone(),
            cancel: CancellationToken::new(),
        }))
    }
}

struct StatProbe {
    attributes: AttributeStore,
    hub: StatsHub,
    cancel: CancellationToken,
}

#[async_trait]
impl ProbeBehavior for StatProbe {
    async fn initialize(&self) -> ProbeResult<()> {
        let stats = self.hub.subscribe();
        tokio::spawn(run(self.attributes.clone(), stats, self.cancel.clone()));
        Ok(())
    }

    fn validate(&self, changes: &Attributes) -> Result<(), String> {
        if let Some(pattern) = changes.get("pattern") {
            let pattern = pattern
                .as_str()
                .ok_or_else(|| format!("pattern must be a string, got {pattern}"))?;
            compile(pattern).map_err(|e| e.to_string())?;
        }
        validate_interval(changes.get("interval_ms"))
    }

    fn release(&self) {
        self.cancel.cancel();
    }
}

fn pattern_of(attributes: &AttributeStore) -> String {
    attributes
        .get("pattern")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| DEFAULT_PATTERN.to_string())
}

/// Returns a matcher for the current `pattern`, reusing `current` when the
/// attribute has not changed.
fn refresh_matcher(attributes: &AttributeStore, current: Option<PatternMatcher>) -> Option<PatternMatcher> {
    let pattern = pattern_of(attributes);
    match current {
        Some(matcher) if matcher.source() == pattern => Some(matcher),
        _ => compile(&pattern).ok(),
    }
}

async fn run(
    attributes: AttributeStore,
    mut stats: tokio::sync::broadcast::Receiver<Stat>,
    cancel: CancellationToken,
) {
    let mut period = interval_of(&attributes, DEFAULT_INTERVAL_MS);
    let mut ticker = make_ticker(period);
    let mut matcher = refresh_matcher(&attributes, None);
    let mut bundle: Vec<Value> = Vec::new();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = ticker.tick() => {
                if !bundle.is_empty() {
                    let mut changes = Attributes::new();
                    changes.insert("bundle".to_string(), Value::Array(std::mem::take(&mut bundle)));
                    changes.insert("timestamp".to_string(), Value::String(Utc::now().to_rfc3339()));
                    attributes.set(changes);
                }

                let next = interval_of(&attributes, DEFAULT_INTERVAL_MS);
                if next != period {
                    period = next;
                    ticker = make_ticker(period);
                }
            }

            received = stats.recv() => match received {
                Ok(stat) => {
                    matcher = refresh_matcher(&attributes, matcher);
                    if matcher.as_ref().is_some_and(|m| m.is_match(&stat.path())) {
                        if let Ok(value) = serde_json::to_value(&stat) {
                            bundle.push(value);
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Stat probe lagged behind the stats hub");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    debug!("Stat probe worker stopped");
}

fn make_ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use probemon_core::{ProbeId, ID_ATTRIBUTE};

    fn init(params: Value) -> ProbeInit {
        let init_params = match params {
            Value::Object(map) => map,
            _ => Attributes::new(),
        };
        let mut initial = init_params.clone();
        initial.insert(ID_ATTRIBUTE.to_string(), json!("s1"));
        ProbeInit {
            id: ProbeId::new("s1"),
            init_params,
            attributes: AttributeStore::new(initial),
        }
    }

    #[tokio::test]
    async fn test_publishes_matching_stats() {
        let hub = StatsHub::new();
        let factory = StatFactory::new(hub.clone());
        let init = init(json!({"pattern": "router.*", "interval_ms": 20}));
        let attributes = init.attributes.clone();
        let mut changes = attributes.subscribe();

        let probe = factory.create(init).unwrap();
        probe.initialize().await.unwrap();

        hub.increment("router", "connections");
        hub.gauge("process", "memory_mb", 3.0);

        let diff = tokio::time::timeout(Duration::from_secs(2), changes.recv())
            .await
            .unwrap()
            .unwrap();
        let bundle = diff.get("bundle").unwrap().as_array().unwrap();
        assert_eq!(bundle.len(), 1);
        assert_eq!(bundle[0]["module"], json!("router"));
        assert_eq!(bundle[0]["name"], json!("connections"));

        probe.release();
    }

    #[test]
    fn test_defaults_seeded() {
        let factory = StatFactory::new(StatsHub::new());
        let init = init(json!({}));
        let attributes = init.attributes.clone();
        let _probe = factory.create(init).unwrap();

        assert_eq!(attributes.get("pattern"), Some(json!("*")));
        assert_eq!(attributes.get("interval_ms"), Some(json!(1000)));
        assert_eq!(attributes.get("bundle"), Some(json!([])));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let factory = StatFactory::new(StatsHub::new());
        let result = factory.create(init(json!({"pattern": "/(unclosed/"})));
        assert!(matches!(result, Err(ProbeError::InvalidParams(_))));
    }

    #[test]
    fn test_validate_changes() {
        let factory = StatFactory::new(StatsHub::new());
        let probe = factory.create(init(json!({}))).unwrap();

        let mut good = Attributes::new();
        good.insert("pattern".to_string(), json!("process.*"));
        assert!(probe.validate(&good).is_ok());

        let mut bad = Attributes::new();
        bad.insert("pattern".to_string(), json!(5));
        assert!(probe.validate(&bad).is_err());
    }
}
