//! Frames and typed payloads exchanged between peers.
//!
//! Every logical operation is an [`Frame::Event`] carrying a name, a JSON
//! payload and an optional ack id. A request that expects an answer sets
//! `ack`; the peer replies with exactly one [`Frame::Ack`] for that id.

use probemon_core::{Attributes, MonitorParams, ProbeError, ProbeId, ProbeResult, WritableAttributes};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::version::ProtocolVersion;

// ============================================================================
// Event Names
// ============================================================================

/// Identity exchange at handshake (both directions).
pub const CONNECTION_INFO: &str = "connection:info";
/// Liveness probe.
pub const CONNECTION_PING: &str = "connection:ping";
/// Liveness answer.
pub const CONNECTION_PONG: &str = "connection:pong";
/// Attach to (instantiate or reuse) a probe on the peer.
pub const PROBE_CONNECT: &str = "probe:connect";
/// Release a probe previously attached.
pub const PROBE_DISCONNECT: &str = "probe:disconnect";
/// Invoke a named control on a probe.
pub const PROBE_CONTROL: &str = "probe:control";
/// Prefix of the per-probe change channel.
pub const PROBE_CHANGE_PREFIX: &str = "probe:change:";

/// Returns the change channel name for a probe.
pub fn probe_change_event(probe_id: &ProbeId) -> String {
    format!("{PROBE_CHANGE_PREFIX}{probe_id}")
}

// ============================================================================
// Frames
// ============================================================================

/// One line on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// A named event, optionally expecting an ack
    Event {
        name: String,
        #[serde(default)]
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<u64>,
    },

    /// The single answer to an event that carried an ack id
    Ack {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
}

impl Frame {
    /// Creates a fire-and-forget event.
    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        Self::Event {
            name: name.into(),
            payload,
            ack: None,
        }
    }

    /// Creates an event that expects an ack with id `ack`.
    pub fn request(name: impl Into<String>, payload: Value, ack: u64) -> Self {
        Self::Event {
            name: name.into(),
            payload,
            ack: Some(ack),
        }
    }

    /// Creates an ack from an operation outcome.
    pub fn ack(id: u64, outcome: ProbeResult<Value>) -> Self {
        match outcome {
            Ok(result) => Self::Ack {
                id,
                result: Some(result),
                error: None,
            },
            Err(e) => Self::Ack {
                id,
                result: None,
                error: Some(WireError::from(&e)),
            },
        }
    }

    /// Returns the event name, if this is an event.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Event { name, .. } => Some(name),
            Self::Ack { .. } => None,
        }
    }
}

/// Converts the fields of an ack back into an operation outcome.
pub fn ack_outcome(result: Option<Value>, error: Option<WireError>) -> ProbeResult<Value> {
    match error {
        Some(e) => Err(e.into_probe_error()),
        None => Ok(result.unwrap_or(Value::Null)),
    }
}

/// Error as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    /// Variant detail (or a human message for foreign errors)
    pub message: String,
    /// Stable error code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl WireError {
    /// Rebuilds the original error variant.
    pub fn into_probe_error(self) -> ProbeError {
        ProbeError::from_code(self.code.as_deref(), self.message)
    }
}

impl From<&ProbeError> for WireError {
    fn from(e: &ProbeError) -> Self {
        Self {
            message: e.detail(),
            code: e.code().map(str::to_string),
        }
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Identity and capabilities a process advertises at handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    pub host_name: String,
    pub app_name: String,
    pub app_instance: String,
    pub pid: u32,
    #[serde(default)]
    pub probe_classes: Vec<String>,
    #[serde(default)]
    pub gateway: bool,
    #[serde(default)]
    pub firewall: bool,
}

/// `probe:connect` request.
pub type ProbeConnectRequest = MonitorParams;

/// `probe:connect` response: the probe id, what is writable, and the
/// probe's full current attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeConnectResponse {
    pub probe_id: ProbeId,
    #[serde(default)]
    pub writable_attributes: WritableAttributes,
    #[serde(flatten)]
    pub attributes: Attributes,
}

/// `probe:disconnect` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeDisconnectRequest {
    pub probe_id: ProbeId,
}

/// `probe:control` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeControlRequest {
    pub probe_id: ProbeId,
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization() {
        let frame = Frame::request(PROBE_CONNECT, json!({"probeClass": "Echo"}), 7);
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"event\""));
        assert!(json.contains("\"name\":\"probe:connect\""));
        assert!(json.contains("\"ack\":7"));
    }

    #[test]
    fn test_fire_and_forget_has_no_ack() {
        let frame = Frame::event(CONNECTION_PING, Value::Null);
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("ack"));
    }

    #[test]
    fn test_error_ack_preserves_code() {
        let frame = Frame::ack(3, Err(ProbeError::Firewalled));
        let json = serde_json::to_string(&frame).unwrap();
        let parsed: Frame = serde_json::from_str(&json).unwrap();

        match parsed {
            Frame::Ack { id, result, error } => {
                assert_eq!(id, 3);
                assert_eq!(ack_outcome(result, error), Err(ProbeError::Firewalled));
            }
            other => panic!("Expected Ack, got {other:?}"),
        }
    }

    #[test]
    fn test_null_result_ack() {
        assert_eq!(ack_outcome(None, None), Ok(Value::Null));
    }

    #[test]
    fn test_connect_response_flattens_attributes() {
        let mut attributes = Attributes::new();
        attributes.insert("id".to_string(), json!("abc"));
        attributes.insert("count".to_string(), json!(2));
        let response = ProbeConnectResponse {
            probe_id: ProbeId::new("abc"),
            writable_attributes: WritableAttributes::All,
            attributes,
        };

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({"probeId": "abc", "writableAttributes": "*", "id": "abc", "count": 2})
        );

        let parsed: ProbeConnectResponse = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, response);
    }

    #[test]
    fn test_change_event_name() {
        assert_eq!(probe_change_event(&ProbeId::new("p9")), "probe:change:p9");
    }
}
