//! Process identity used for routing decisions and the handshake.

use std::process;

use probemon_core::MonitorParams;
use probemon_protocol::{ConnectionInfo, ProtocolVersion};
use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::config::ProbemonConfig;

/// Host names that always refer to the local machine.
const LOOPBACK_ALIASES: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

/// Who this process is, as seen by peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub host_name: String,
    pub app_name: String,
    pub app_instance: String,
    pub pid: u32,
}

impl ProcessIdentity {
    /// Builds the identity of the running process.
    pub fn current(config: &ProbemonConfig) -> Self {
        Self {
            host_name: System::host_name().unwrap_or_else(|| "localhost".to_string()),
            app_name: config.app_name.clone(),
            app_instance: config
                .app_instance
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            pid: process::id(),
        }
    }

    /// Returns true if `host` names this machine.
    pub fn is_local_host(&self, host: &str) -> bool {
        host.eq_ignore_ascii_case(&self.host_name)
            || LOOPBACK_ALIASES
                .iter()
                .any(|alias| host.eq_ignore_ascii_case(alias))
    }

    /// Returns true if every specified target field matches this process.
    ///
    /// Unspecified fields match anything.
    pub fn matches(&self, params: &MonitorParams) -> bool {
        params
            .host_name
            .as_deref()
            .map_or(true, |host| self.is_local_host(host))
            && params
                .app_name
                .as_deref()
                .map_or(true, |app| app == self.app_name)
            && params
                .app_instance
                .as_deref()
                .map_or(true, |instance| instance == self.app_instance)
    }

    /// Returns true if `info` describes this very process.
    pub fn is_same_process(&self, info: &ConnectionInfo) -> bool {
        info.pid == self.pid
            && info.app_instance == self.app_instance
            && self.is_local_host(&info.host_name)
    }

    /// Builds the handshake payload.
    pub fn connection_info(
        &self,
        probe_classes: Vec<String>,
        gateway: bool,
        firewall: bool,
    ) -> ConnectionInfo {
        ConnectionInfo {
            protocol_version: ProtocolVersion::CURRENT,
            host_name: self.host_name.clone(),
            app_name: self.app_name.clone(),
            app_instance: self.app_instance.clone(),
            pid: self.pid,
            probe_classes,
            gateway,
            firewall,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ProcessIdentity {
        ProcessIdentity {
            host_name: "alpha".to_string(),
            app_name: "billing".to_string(),
            app_instance: "i-1".to_string(),
            pid: 4242,
        }
    }

    #[test]
    fn test_unspecified_target_is_local() {
        assert!(identity().matches(&MonitorParams::class("Echo")));
    }

    #[test]
    fn test_loopback_aliases_are_local() {
        let id = identity();
        assert!(id.matches(&MonitorParams::class("Echo").host("localhost")));
        assert!(id.matches(&MonitorParams::class("Echo").host("127.0.0.1")));
        assert!(id.matches(&MonitorParams::class("Echo").host("ALPHA")));
    }

    #[test]
    fn test_remote_targets() {
        let id = identity();
        assert!(!id.matches(&MonitorParams::class("Echo").host("beta")));
        assert!(!id.matches(&MonitorParams::class("Echo").app("shipping")));
        assert!(!id.matches(&MonitorParams::class("Echo").instance("i-2")));
    }

    #[test]
    fn test_same_process_detection() {
        let id = identity();
        let mut info = id.connection_info(Vec::new(), false, false);
        assert!(id.is_same_process(&info));

        info.pid = 1;
        assert!(!id.is_same_process(&info));
    }

    #[test]
    fn test_current_uses_configured_instance() {
        let config = ProbemonConfig {
            app_instance: Some("fixed".to_string()),
            ..Default::default()
        };
        let id = ProcessIdentity::current(&config);
        assert_eq!(id.app_instance, "fixed");
        assert_eq!(id.pid, process::id());
        assert!(!id.host_name.is_empty());
    }
}
