//! Runtime configuration.
//!
//! Loaded from TOML; every field has a default so an empty file (or no
//! file) is a valid configuration.
//!
//! ```toml
//! app_name = "billing"
//! service_base_port = 42000
//! ports_to_scan = 20
//! allow_external_connections = false
//! release_grace_ms = 10000
//!
//! [[auto_start]]
//! name = "router-stats"
//! probe_class = "Stat"
//! init_params = { pattern = "router.*", interval_ms = 1000 }
//!
//! [gateway]
//! host = "gw.internal"
//! port = 42000
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use probemon_core::{Attributes, MonitorParams};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default first port of the service window.
pub const DEFAULT_SERVICE_BASE_PORT: u16 = 42000;

/// Default width of the service window.
pub const DEFAULT_PORTS_TO_SCAN: u16 = 20;

/// Default grace window before an unreferenced probe is released.
pub const DEFAULT_RELEASE_GRACE_MS: u64 = 10_000;

/// Default dial timeout for outbound connections.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "PROBEMON_CONFIG";

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A probe connected at boot and kept alive for the life of the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoStartProbe {
    /// Name monitors use to reach this probe (`probeName`)
    pub name: String,
    /// Registered class to instantiate
    pub probe_class: String,
    /// Construction parameters
    #[serde(default)]
    pub init_params: Attributes,
}

impl AutoStartProbe {
    /// Returns the monitor parameters that start this probe.
    pub fn monitor_params(&self) -> MonitorParams {
        MonitorParams {
            probe_class: Some(self.probe_class.clone()),
            probe_name: Some(self.name.clone()),
            init_params: self.init_params.clone(),
            ..Default::default()
        }
    }
}

/// Address of the default gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

/// probemon process configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbemonConfig {
    /// Application name advertised to peers
    pub app_name: String,

    /// Application instance advertised to peers (random when unset)
    pub app_instance: Option<String>,

    /// First port of the listening and scanning window
    pub service_base_port: u16,

    /// Width of the port window
    pub ports_to_scan: u16,

    /// Bind all interfaces instead of loopback only
    pub allow_external_connections: bool,

    /// Default firewall flag for accepted connections
    pub firewall: bool,

    /// Grace window before releasing an unreferenced probe
    pub release_grace_ms: u64,

    /// Dial timeout for outbound connections
    pub connect_timeout_ms: u64,

    /// Probes connected at boot
    pub auto_start: Vec<AutoStartProbe>,

    /// Default gateway to dial at boot
    pub gateway: Option<GatewayConfig>,
}

impl Default for ProbemonConfig {
    fn default() -> Self {
        Self {
            app_name: "probemon".to_string(),
            app_instance: None,
            service_base_port: DEFAULT_SERVICE_BASE_PORT,
            ports_to_scan: DEFAULT_PORTS_TO_SCAN,
            allow_external_connections: false,
            firewall: false,
            release_grace_ms: DEFAULT_RELEASE_GRACE_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            auto_start: Vec::new(),
            gateway: None,
        }
    }
}

impl ProbemonConfig {
    /// Parses configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::from_toml(&text)
    }

    /// Loads from `path`, else from `$PROBEMON_CONFIG`, else defaults, then
    /// applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `PROBEMON_APP_NAME` and `PROBEMON_BASE_PORT`.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(name) = env::var("PROBEMON_APP_NAME") {
            self.app_name = name;
        }
        if let Ok(port) = env::var("PROBEMON_BASE_PORT") {
            self.service_base_port = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("PROBEMON_BASE_PORT={port}")))?;
        }
        Ok(())
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports_to_scan == 0 {
            return Err(ConfigError::Invalid("ports_to_scan must be > 0".to_string()));
        }
        if u32::from(self.service_base_port) + u32::from(self.ports_to_scan) > u32::from(u16::MAX) + 1 {
            return Err(ConfigError::Invalid(format!(
                "port window {}+{} exceeds 65535",
                self.service_base_port, self.ports_to_scan
            )));
        }
        if self.app_name.is_empty() {
            return Err(ConfigError::Invalid("app_name must not be empty".to_string()));
        }
        Ok(())
    }

    /// Returns the ports of the service window, in order.
    pub fn service_ports(&self) -> impl Iterator<Item = u16> {
        let base = self.service_base_port;
        (0..self.ports_to_scan).filter_map(move |offset| base.checked_add(offset))
    }

    /// Returns the release grace window.
    pub fn release_grace(&self) -> Duration {
        Duration::from_millis(self.release_grace_ms)
    }

    /// Returns the dial timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ProbemonConfig::default();
        assert_eq!(config.service_base_port, 42000);
        assert_eq!(config.ports_to_scan, 20);
        assert!(!config.allow_external_connections);
        assert_eq!(config.release_grace(), Duration::from_secs(10));
        assert_eq!(config.service_ports().count(), 20);
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(ProbemonConfig::from_toml("").unwrap(), ProbemonConfig::default());
    }

    #[test]
    fn test_auto_start_and_gateway() {
        let config = ProbemonConfig::from_toml(
            r#"
            app_name = "billing"
            release_grace_ms = 250

            [[auto_start]]
            name = "router-stats"
            probe_class = "Stat"
            init_params = { pattern = "router.*", interval_ms = 1000 }

            [gateway]
            host = "gw.internal"
            port = 42001
            "#,
        )
        .unwrap();

        assert_eq!(config.app_name, "billing");
        assert_eq!(config.release_grace(), Duration::from_millis(250));

        let auto = config.auto_start.first().unwrap();
        let params = auto.monitor_params();
        assert_eq!(params.probe_name.as_deref(), Some("router-stats"));
        assert_eq!(params.init_params.get("pattern"), Some(&json!("router.*")));

        let gateway = config.gateway.unwrap();
        assert_eq!(gateway.host, "gw.internal");
        assert_eq!(gateway.port, 42001);
    }

    #[test]
    fn test_rejects_zero_ports() {
        let err = ProbemonConfig::from_toml("ports_to_scan = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_overflowing_window() {
        let err =
            ProbemonConfig::from_toml("service_base_port = 65530\nports_to_scan = 20").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "app_name = \"from-file\"").unwrap();

        let config = ProbemonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.app_name, "from-file");
    }

    #[test]
    fn test_missing_file() {
        let err = ProbemonConfig::from_file(Path::new("/nonexistent/probemon.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
