//! Probe identification: ids, canonical keys and monitor parameters.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::attributes::Attributes;
use crate::error::{ProbeError, ProbeResult};

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Process-unique identifier of a running probe.
///
/// Assigned at instantiation; random so that ids relayed through gateways
/// never collide with ids of the relaying process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProbeId(String);

impl ProbeId {
    /// Creates a ProbeId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProbeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Canonical key identifying a sharable probe instance.
///
/// Built from `probeName` when given, otherwise from `probeClass` followed by
/// `:key=value` for each init parameter in sorted key order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProbeKey(String);

impl ProbeKey {
    /// Builds the canonical key for a monitor request.
    ///
    /// # Errors
    ///
    /// `ProbeError::InvalidParams` if neither a probe name nor a class is given.
    pub fn build(params: &MonitorParams) -> ProbeResult<Self> {
        if let Some(name) = params.probe_name.as_deref() {
            return Ok(Self(name.to_string()));
        }

        let class = params.probe_class.as_deref().ok_or_else(|| {
            ProbeError::InvalidParams("probeClass or probeName required".to_string())
        })?;

        let mut names: Vec<&String> = params.init_params.keys().collect();
        names.sort();

        let mut key = class.to_string();
        for name in names {
            if let Some(value) = params.init_params.get(name) {
                key.push(':');
                key.push_str(name);
                key.push('=');
                key.push_str(&render_value(value));
            }
        }
        Ok(Self(key))
    }

    /// Builds the key used for remote proxies, scoped by the requested route.
    pub fn build_routed(params: &MonitorParams) -> ProbeResult<Self> {
        let base = Self::build(params)?;
        Ok(Self(format!(
            "{}@{}/{}/{}",
            base.0,
            params.host_name.as_deref().unwrap_or(""),
            params.app_name.as_deref().unwrap_or(""),
            params.app_instance.as_deref().unwrap_or(""),
        )))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProbeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ============================================================================
// Monitor Parameters
// ============================================================================

/// Identification of the probe a monitor wants to attach to.
///
/// Serialized in camelCase; this is the payload of `probe:connect`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorParams {
    /// Registered probe class to instantiate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_class: Option<String>,

    /// Name of an already-configured probe (takes precedence over the class)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_name: Option<String>,

    /// Construction parameters; also the probe's initial attributes
    #[serde(default, skip_serializing_if = "Attributes::is_empty")]
    pub init_params: Attributes,

    /// Host running the probe (unspecified = this host)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,

    /// Application running the probe (unspecified = any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,

    /// Application instance running the probe (unspecified = any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_instance: Option<String>,
}

impl MonitorParams {
    /// Targets a probe class.
    pub fn class(probe_class: impl Into<String>) -> Self {
        Self {
            probe_class: Some(probe_class.into()),
            ..Default::default()
        }
    }

    /// Targets a named probe.
    pub fn named(probe_name: impl Into<String>) -> Self {
        Self {
            probe_name: Some(probe_name.into()),
            ..Default::default()
        }
    }

    /// Adds an init parameter.
    #[must_use]
    pub fn init_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.init_params.insert(key.into(), value.into());
        self
    }

    /// Sets the target host.
    #[must_use]
    pub fn host(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = Some(host_name.into());
        self
    }

    /// Sets the target application.
    #[must_use]
    pub fn app(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    /// Sets the target application instance.
    #[must_use]
    pub fn instance(mut self, app_instance: impl Into<String>) -> Self {
        self.app_instance = Some(app_instance.into());
        self
    }

    /// Returns a human label for logs and errors (name, else class).
    pub fn label(&self) -> &str {
        self.probe_name
            .as_deref()
            .or(self.probe_class.as_deref())
            .unwrap_or("<unnamed>")
    }
}
