//! The probe base type and the contract probe implementations satisfy.
//!
//! A [`Probe`] owns a versioned [`AttributeStore`] and dispatches named
//! control invocations. Application behavior plugs in through
//! [`ProbeBehavior`]; the base type supplies the `set` and `ping` controls,
//! writable-attribute enforcement and panic isolation.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::attributes::{AttributeStore, Attributes, WritableAttributes};
use crate::error::{ProbeError, ProbeResult};
use crate::key::ProbeId;

/// Control handled by the base type: writes writable attributes.
pub const SET_CONTROL: &str = "set";

/// Control handled by the base type: answers `"pong"`.
pub const PING_CONTROL: &str = "ping";

// ============================================================================
// Probe Behavior
// ============================================================================

/// Application behavior of a probe class.
///
/// Every method has a default so that a class only implements what it uses.
#[async_trait]
pub trait ProbeBehavior: Send + Sync + 'static {
    /// Completes asynchronous initialization.
    ///
    /// The probe is not handed to any caller until this resolves. An error
    /// releases the instance and fails every pending connect.
    async fn initialize(&self) -> ProbeResult<()> {
        Ok(())
    }

    /// Handles the control named `name`.
    ///
    /// Unknown names must answer `ProbeError::NoControl`.
    async fn control(&self, name: &str, _params: Value) -> ProbeResult<Value> {
        Err(ProbeError::NoControl(name.to_string()))
    }

    /// Validates an attribute assignment requested through `set`.
    fn validate(&self, _changes: &Attributes) -> Result<(), String> {
        Ok(())
    }

    /// Frees external resources (timers, file handles, listeners).
    fn release(&self) {}
}

/// Context handed to a probe class when an instance is created.
#[derive(Debug, Clone)]
pub struct ProbeInit {
    /// Id assigned to the new instance
    pub id: ProbeId,
    /// Deep copy of the requested init parameters
    pub init_params: Attributes,
    /// The instance's attribute store (seeded with init params and id)
    pub attributes: AttributeStore,
}

// ============================================================================
// Probe
// ============================================================================

/// A running probe: attributes plus control dispatch.
pub struct Probe {
    id: ProbeId,
    class: String,
    writable: WritableAttributes,
    attributes: AttributeStore,
    behavior: Arc<dyn ProbeBehavior>,
}

impl Probe {
    /// Assembles a probe from its parts.
    pub fn new(
        id: ProbeId,
        class: impl Into<String>,
        writable: WritableAttributes,
        attributes: AttributeStore,
        behavior: Arc<dyn ProbeBehavior>,
    ) -> Self {
        Self {
            id,
            class: class.into(),
            writable,
            attributes,
            behavior,
        }
    }

    /// Returns the probe id.
    pub fn id(&self) -> &ProbeId {
        &self.id
    }

    /// Returns the registered class name.
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Returns the attributes monitors may write.
    pub fn writable(&self) -> &WritableAttributes {
        &self.writable
    }

    /// Returns the attribute store.
    pub fn attributes(&self) -> &AttributeStore {
        &self.attributes
    }

    /// Dispatches a control invocation.
    ///
    /// The handler runs on a later scheduler tick, so local callers observe
    /// the same ordering as remote ones. A panicking handler is converted to
    /// `ProbeError::ControlFailed`.
    pub async fn on_control(&self, name: &str, params: Value) -> ProbeResult<Value> {
        tokio::task::yield_now().await;

        match name {
            PING_CONTROL => Ok(Value::from("pong")),
            SET_CONTROL => self.set_control(params).map(|_| Value::Null),
            _ => {
                let behavior = Arc::clone(&self.behavior);
                let control = name.to_string();
                let handle = tokio::spawn(async move { behavior.control(&control, params).await });

                match handle.await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => {
                        warn!(probe_id = %self.id, control = name, "Control handler panicked");
                        Err(ProbeError::ControlFailed(format!(
                            "control '{name}' panicked"
                        )))
                    }
                    Err(e) => Err(ProbeError::ControlFailed(e.to_string())),
                }
            }
        }
    }

    /// Default writable-attribute setter.
    ///
    /// # Errors
    ///
    /// - `ProbeError::InvalidParams` if `params` is not an object
    /// - `ProbeError::NotWritable` if any key is outside the writable set
    /// - `ProbeError::Validation` if the behavior rejects the assignment
    pub fn set_control(&self, params: Value) -> ProbeResult<Attributes> {
        let changes = match params {
            Value::Object(map) => map,
            other => {
                return Err(ProbeError::InvalidParams(format!(
                    "set expects an object, got {other}"
                )))
            }
        };

        let rejected: Vec<String> = changes
            .keys()
            .filter(|key| !self.writable.allows(key))
            .cloned()
            .collect();
        if !rejected.is_empty() {
            return Err(ProbeError::NotWritable {
                attributes: rejected,
            });
        }

        self.behavior
            .validate(&changes)
            .map_err(ProbeError::Validation)?;

        let diff = self.attributes.set(changes);
        debug!(probe_id = %self.id, changed = diff.len(), "Attributes set");
        Ok(diff)
    }

    /// Runs the behavior's release hook.
    pub fn release(&self) {
        self.behavior.release();
    }
}

impl std::fmt::Debug for Probe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Probe")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Counter;

    #[async_trait]
    impl ProbeBehavior for Counter {
        async fn control(&self, name: &str, params: Value) -> ProbeResult<Value> {
            match name {
                "echo" => Ok(params),
                "explode" => panic!("boom"),
                _ => Err(ProbeError::NoControl(name.to_string())),
            }
        }

        fn validate(&self, changes: &Attributes) -> Result<(), String> {
            match changes.get("count") {
                Some(v) if !v.is_number() => Err("count must be a number".to_string()),
                _ => Ok(()),
            }
        }
    }

    fn probe(writable: WritableAttributes) -> Probe {
        let mut initial = Attributes::new();
        initial.insert("id".to_string(), json!("p1"));
        initial.insert("count".to_string(), json!(0));
        Probe::new(
            ProbeId::new("p1"),
            "Counter",
            writable,
            AttributeStore::new(initial),
            Arc::new(Counter),
        )
    }

    #[tokio::test]
    async fn test_ping_answers_pong() {
        let probe = probe(WritableAttributes::None);
        assert_eq!(probe.on_control("ping", Value::Null).await.unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_custom_control() {
        let probe = probe(WritableAttributes::None);
        let result = probe.on_control("echo", json!({"x": 1})).await.unwrap();
        assert_eq!(result, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_unknown_control() {
        let probe = probe(WritableAttributes::None);
        let err = probe.on_control("nope", Value::Null).await.unwrap_err();
        assert_eq!(err.code(), Some("NO_CONTROL"));
    }

    #[tokio::test]
    async fn test_panicking_control_becomes_error() {
        let probe = probe(WritableAttributes::None);
        let err = probe.on_control("explode", Value::Null).await.unwrap_err();
        assert!(matches!(err, ProbeError::ControlFailed(_)));
    }

    #[tokio::test]
    async fn test_set_rejects_unwritable_and_leaves_state() {
        let probe = probe(WritableAttributes::only(["count"]));
        let before = probe.attributes().snapshot();

        let err = probe
            .on_control("set", json!({"count": 1, "color": "red"}))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ProbeError::NotWritable {
                attributes: vec!["color".to_string()]
            }
        );
        assert_eq!(probe.attributes().snapshot(), before);
    }

    #[tokio::test]
    async fn test_set_validation_error() {
        let probe = probe(WritableAttributes::All);
        let err = probe
            .on_control("set", json!({"count": "many"}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("VALIDATION_ERROR"));
        assert_eq!(probe.attributes().get("count"), Some(json!(0)));
    }

    #[tokio::test]
    async fn test_set_never_writes_id() {
        let probe = probe(WritableAttributes::All);
        let err = probe.on_control("set", json!({"id": "other"})).await.unwrap_err();
        assert!(matches!(err, ProbeError::NotWritable { .. }));
    }

    #[tokio::test]
    async fn test_set_applies_and_publishes() {
        let probe = probe(WritableAttributes::All);
        let mut rx = probe.attributes().subscribe();

        probe.on_control("set", json!({"count": 5})).await.unwrap();

        assert_eq!(probe.attributes().get("count"), Some(json!(5)));
        assert_eq!(rx.recv().await.unwrap().get("count"), Some(&json!(5)));
    }
}
