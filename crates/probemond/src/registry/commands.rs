//! Registry actor commands and events.
//!
//! - `RegistryCommand`: messages sent to the actor (public and internal)
//! - `RegistryEvent`: lifecycle notifications published to subscribers
//! - `RunningProbeInfo`: introspection view of one running probe

use std::sync::Arc;

use probemon_core::{MonitorParams, Probe, ProbeId, ProbeKey, ProbeResult};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Reply channel for a connect request.
pub type ConnectReply = oneshot::Sender<ProbeResult<Arc<Probe>>>;

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Take one reference to the probe for `key`, starting it if needed.
    ///
    /// # Errors
    /// - `ProbeError::ClassNotAvailable` if the class is not registered
    /// - any error raised by the class while constructing or initializing
    Connect {
        key: ProbeKey,
        params: MonitorParams,
        respond_to: ConnectReply,
    },

    /// Drop one reference to a running probe. Unknown ids succeed.
    Disconnect {
        probe_id: ProbeId,
        respond_to: oneshot::Sender<ProbeResult<()>>,
    },

    /// Internal: construction of the probe for `key` settled.
    Started {
        key: ProbeKey,
        result: ProbeResult<Arc<Probe>>,
    },

    /// Internal: a grace timer expired; release if still unreferenced.
    ReleaseIfIdle { key: ProbeKey, probe_id: ProbeId },

    /// Look up a running probe by id.
    GetProbe {
        probe_id: ProbeId,
        respond_to: oneshot::Sender<Option<Arc<Probe>>>,
    },

    /// Returns true if a probe is running (or starting) under `key`.
    IsRunning {
        key: ProbeKey,
        respond_to: oneshot::Sender<bool>,
    },

    /// List running probes.
    List {
        respond_to: oneshot::Sender<Vec<RunningProbeInfo>>,
    },

    /// Release every running probe regardless of references.
    Shutdown { respond_to: oneshot::Sender<usize> },
}

// ============================================================================
// Registry Events
// ============================================================================

/// Lifecycle events published by the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// A probe finished initialization and is visible by key and id
    Started {
        probe_id: ProbeId,
        key: ProbeKey,
        class: String,
    },

    /// A probe was removed from the registry and released
    Released { probe_id: ProbeId, key: ProbeKey },
}

/// Introspection view of one running probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningProbeInfo {
    pub id: ProbeId,
    pub key: ProbeKey,
    pub class: String,
    pub ref_count: usize,
}
