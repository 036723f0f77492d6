//! Error taxonomy shared by probes, monitors, connections and the router.
//!
//! Every variant carries a stable wire code so a failure raised on one
//! process can be rebuilt verbatim on the other side of a connection (or
//! several gateway hops away).

use thiserror::Error;

/// Errors surfaced to monitor and probe callers.
///
/// `Clone` because a single failure is often delivered to several coalesced
/// waiters (concurrent starts of the same probe, concurrent host scans).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    /// One or more attributes are outside the probe's writable set
    #[error("Attributes not writable: {}", .attributes.join(", "))]
    NotWritable { attributes: Vec<String> },

    /// The probe rejected the attribute assignment
    #[error("Validation failed: {0}")]
    Validation(String),

    /// No control handler with this name
    #[error("No control named '{0}'")]
    NoControl(String),

    /// A control handler failed or panicked
    #[error("Control failed: {0}")]
    ControlFailed(String),

    /// Probe construction or asynchronous initialization failed
    #[error("Probe initialization failed: {0}")]
    Init(String),

    /// The probe class is not registered in the resolving process
    #[error("Probe class \"{0}\" not available in this process")]
    ClassNotAvailable(String),

    /// The addressed probe id is not running here
    #[error("Probe {0} is not running")]
    ProbeNotRunning(String),

    /// Host discovery exhausted the port window without a match
    #[error("No route to host: {0}")]
    NoRouteToHost(String),

    /// Every port in the service window is taken
    #[error("All ports in use (base port {base}, {count} ports)")]
    AllPortsInUse { base: u16, count: u16 },

    /// The connection refuses inbound probe requests
    #[error("Connection is firewalled")]
    Firewalled,

    /// The request targets another process but this hop does not relay
    #[error("Not a gateway to remote monitors")]
    NotAGateway,

    /// A remote target was requested without a host name
    #[error("No host name specified and no local match for {0}")]
    NoHostName(String),

    /// The monitor is not bound to a probe
    #[error("Probe not connected")]
    NotConnected,

    /// Transport or handshake failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed request parameters
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// An error received from a peer whose code is not one of ours
    #[error("{message}")]
    Remote {
        code: Option<String>,
        message: String,
    },
}

impl ProbeError {
    /// Returns the stable wire code for this error.
    pub fn code(&self) -> Option<&str> {
        Some(match self {
            Self::NotWritable { .. } => "NOT_WRITABLE",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NoControl(_) => "NO_CONTROL",
            Self::ControlFailed(_) => "CONTROL_ERROR",
            Self::Init(_) => "INIT_ERROR",
            Self::ClassNotAvailable(_) => "PROBE_CLASS_NOT_AVAILABLE",
            Self::ProbeNotRunning(_) => "PROBE_NOT_RUNNING",
            Self::NoRouteToHost(_) => "NO_ROUTE_TO_HOST",
            Self::AllPortsInUse { .. } => "ALL_PORTS_IN_USE",
            Self::Firewalled => "FIREWALLED",
            Self::NotAGateway => "NOT_A_GATEWAY",
            Self::NoHostName(_) => "NO_HOSTNAME",
            Self::NotConnected => "PROBE_NOT_CONNECTED",
            Self::Connection(_) => "CONNECTION_ERROR",
            Self::InvalidParams(_) => "INVALID_PARAMS",
            Self::Remote { code, .. } => return code.as_deref(),
        })
    }

    /// Returns the detail carried by the variant, used as the wire message.
    ///
    /// For most variants this is the inner string so that
    /// `from_code(code, detail)` rebuilds an equal error.
    pub fn detail(&self) -> String {
        match self {
            Self::NotWritable { attributes } => attributes.join(","),
            Self::Validation(s)
            | Self::NoControl(s)
            | Self::ControlFailed(s)
            | Self::Init(s)
            | Self::ClassNotAvailable(s)
            | Self::ProbeNotRunning(s)
            | Self::NoRouteToHost(s)
            | Self::NoHostName(s)
            | Self::Connection(s)
            | Self::InvalidParams(s) => s.clone(),
            Self::AllPortsInUse { base, count } => format!("{base}:{count}"),
            Self::Firewalled | Self::NotAGateway | Self::NotConnected => self.to_string(),
            Self::Remote { message, .. } => message.clone(),
        }
    }

    /// Rebuilds an error from its wire code and detail.
    ///
    /// Unknown codes (or a missing code) become [`ProbeError::Remote`].
    pub fn from_code(code: Option<&str>, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match code {
            Some("NOT_WRITABLE") => Self::NotWritable {
                attributes: detail
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            },
            Some("VALIDATION_ERROR") => Self::Validation(detail),
            Some("NO_CONTROL") => Self::NoControl(detail),
            Some("CONTROL_ERROR") => Self::ControlFailed(detail),
            Some("INIT_ERROR") => Self::Init(detail),
            Some("PROBE_CLASS_NOT_AVAILABLE") => Self::ClassNotAvailable(detail),
            Some("PROBE_NOT_RUNNING") => Self::ProbeNotRunning(detail),
            Some("NO_ROUTE_TO_HOST") => Self::NoRouteToHost(detail),
            Some("ALL_PORTS_IN_USE") => {
                let mut parts = detail.splitn(2, ':');
                let base = parts.next().and_then(|p| p.parse().ok());
                let count = parts.next().and_then(|p| p.parse().ok());
                match (base, count) {
                    (Some(base), Some(count)) => Self::AllPortsInUse { base, count },
                    _ => Self::Remote {
                        code: Some("ALL_PORTS_IN_USE".to_string()),
                        message: detail,
                    },
                }
            }
            Some("FIREWALLED") => Self::Firewalled,
            Some("NOT_A_GATEWAY") => Self::NotAGateway,
            Some("NO_HOSTNAME") => Self::NoHostName(detail),
            Some("PROBE_NOT_CONNECTED") => Self::NotConnected,
            Some("CONNECTION_ERROR") => Self::Connection(detail),
            Some("INVALID_PARAMS") => Self::InvalidParams(detail),
            other => Self::Remote {
                code: other.map(str::to_string),
                message: detail,
            },
        }
    }
}

/// Result type for probe operations.
pub type ProbeResult<T> = Result<T, ProbeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_rebuild_same_variant() {
        let errors = vec![
            ProbeError::NotWritable {
                attributes: vec!["a".to_string(), "b".to_string()],
            },
            ProbeError::NoControl("frob".to_string()),
            ProbeError::Firewalled,
            ProbeError::AllPortsInUse {
                base: 42000,
                count: 20,
            },
            ProbeError::NotConnected,
        ];

        for err in errors {
            let rebuilt = ProbeError::from_code(err.code(), err.detail());
            assert_eq!(rebuilt, err);
        }
    }

    #[test]
    fn test_unknown_code_is_remote() {
        let err = ProbeError::from_code(Some("SOMETHING_ELSE"), "boom");
        assert_eq!(err.code(), Some("SOMETHING_ELSE"));
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_not_connected_message() {
        assert_eq!(ProbeError::NotConnected.to_string(), "Probe not connected");
    }

    #[test]
    fn test_all_ports_display() {
        let err = ProbeError::AllPortsInUse {
            base: 42000,
            count: 20,
        };
        assert!(err.to_string().contains("base port 42000"));
        assert!(err.to_string().contains("20 ports"));
    }
}
