//! Client interface for the registry actor.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A stopped actor surfaces as `ProbeError::Init` or an empty answer

use std::sync::Arc;

use probemon_core::{MonitorParams, Probe, ProbeError, ProbeId, ProbeKey, ProbeResult};
use tokio::sync::{broadcast, mpsc, oneshot};

use super::commands::{RegistryCommand, RegistryEvent, RunningProbeInfo};

fn stopped() -> ProbeError {
    ProbeError::Init("probe registry has stopped".to_string())
}

/// Cheap-to-clone handle to the local probe registry.
#[derive(Clone)]
pub struct ProbeRegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl ProbeRegistryHandle {
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<RegistryEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Takes one reference to the probe identified by `params`, starting it
    /// on first use.
    ///
    /// Resolves only after the probe's initialization has settled.
    ///
    /// # Errors
    ///
    /// - `ProbeError::InvalidParams` if neither class nor name is given
    /// - `ProbeError::ClassNotAvailable` if the class is not registered
    /// - whatever the class raised while constructing
    pub async fn connect(&self, params: MonitorParams) -> ProbeResult<Arc<Probe>> {
        let key = ProbeKey::build(&params)?;
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Connect {
                key,
                params,
                respond_to: tx,
            })
            .await
            .map_err(|_| stopped())?;

        rx.await.map_err(|_| stopped())?
    }

    /// Drops one reference. The probe is released once no reference has
    /// existed for the grace window.
    pub async fn disconnect(&self, probe_id: ProbeId) -> ProbeResult<()> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Disconnect {
                probe_id,
                respond_to: tx,
            })
            .await
            .map_err(|_| stopped())?;

        rx.await.map_err(|_| stopped())?
    }

    /// Returns the running probe with this id.
    pub async fn get(&self, probe_id: &ProbeId) -> Option<Arc<Probe>> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::GetProbe {
                probe_id: probe_id.clone(),
                respond_to: tx,
            })
            .await
            .ok()?;

        rx.await.ok()?
    }

    /// Returns true if a probe is running or starting under `key`.
    pub async fn is_running(&self, key: &ProbeKey) -> bool {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::IsRunning {
                key: key.clone(),
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return false;
        }

        rx.await.unwrap_or(false)
    }

    /// Lists running probes, sorted by key.
    pub async fn list(&self) -> Vec<RunningProbeInfo> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::List { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// Releases every running probe. Returns how many were released.
    pub async fn shutdown(&self) -> usize {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::Shutdown { respond_to: tx })
            .await
            .is_err()
        {
            return 0;
        }

        rx.await.unwrap_or(0)
    }

    /// Subscribes to probe lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Returns true if the actor is still accepting commands.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_handle() -> (ProbeRegistryHandle, mpsc::Receiver<RegistryCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(10);
        let (event_tx, _) = broadcast::channel(10);
        (ProbeRegistryHandle::new(cmd_tx, event_tx), cmd_rx)
    }

    #[tokio::test]
    async fn test_connect_builds_key() {
        let (handle, mut rx) = create_test_handle();

        let cmd_handler = tokio::spawn(async move {
            if let Some(RegistryCommand::Connect {
                key, respond_to, ..
            }) = rx.recv().await
            {
                assert_eq!(key.as_str(), "Echo:a=1:b=2");
                let _ = respond_to.send(Err(ProbeError::ClassNotAvailable("Echo".to_string())));
                return true;
            }
            false
        });

        let params = MonitorParams::class("Echo")
            .init_param("b", 2)
            .init_param("a", 1);
        let err = handle.connect(params).await.unwrap_err();
        assert_eq!(err.code(), Some("PROBE_CLASS_NOT_AVAILABLE"));
        assert!(cmd_handler.await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_rejects_missing_identification() {
        let (handle, _rx) = create_test_handle();
        let err = handle.connect(MonitorParams::default()).await.unwrap_err();
        assert!(matches!(err, ProbeError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_channel_closed() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        assert!(!handle.is_connected());
        assert!(handle.connect(MonitorParams::class("Echo")).await.is_err());
        assert!(handle.get(&ProbeId::new("x")).await.is_none());
        assert!(handle.list().await.is_empty());
        assert_eq!(handle.shutdown().await, 0);
    }
}
