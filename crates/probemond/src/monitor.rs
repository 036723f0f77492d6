//! Client-side mirrors of probes.
//!
//! A [`Monitor`] attaches to one probe through the [`Router`], mirrors its
//! attributes, relays control calls and forwards local writes of writable
//! attributes back to the probe.
//!
//! Event order for one monitor:
//!
//! ```text
//! connect() ──▶ Connect ──▶ Change(full state) ──▶ Change(diff) ... ──▶ Disconnect(kind)
//! ```
//!
//! Local writes are client-authoritative: a failed forward is logged and
//! returned, but the local value is kept.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use probemon_core::{
    AttributeStore, Attributes, MonitorParams, ProbeError, ProbeId, ProbeResult, SET_CONTROL,
};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::router::{ProbeRef, Router};

/// Event channel capacity
const EVENT_BUFFER: usize = 100;

/// Why a monitor stopped being bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    ManualDisconnect,
    ConnectFailed,
    RemoteDisconnect,
}

impl DisconnectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManualDisconnect => "manual_disconnect",
            Self::ConnectFailed => "connect_failed",
            Self::RemoteDisconnect => "remote_disconnect",
        }
    }
}

/// Events observed on a monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Connect,
    /// Attributes that changed, with their new values
    Change(Attributes),
    Disconnect(DisconnectKind),
}

struct Binding {
    probe: ProbeRef,
    /// Probe-side values as last seen, for write batching
    last_known: Attributes,
    sync: CancellationToken,
}

struct MonitorInner {
    router: Router,
    params: MonitorParams,
    mirror: AttributeStore,
    binding: Mutex<Option<Binding>>,
    events: broadcast::Sender<MonitorEvent>,
}

/// Mirror of one probe. Cheap to clone.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

impl Monitor {
    pub fn new(router: &Router, params: MonitorParams) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(MonitorInner {
                router: router.clone(),
                params,
                mirror: AttributeStore::new(Attributes::new()),
                binding: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn params(&self) -> &MonitorParams {
        &self.inner.params
    }

    /// Subscribes to connect, change and disconnect events.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.inner.events.subscribe()
    }

    /// Attaches to the probe. A no-op when already connected.
    ///
    /// # Errors
    ///
    /// Whatever the router's resolution failed with; a `Disconnect`
    /// event with `ConnectFailed` is emitted as well.
    pub async fn connect(&self) -> ProbeResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        let probe = match self.inner.router.connect_monitor(&self.inner.params).await {
            Ok(probe) => probe,
            Err(e) => {
                warn!(probe = %self.inner.params.label(), error = %e, "Monitor connect failed");
                self.inner.emit(MonitorEvent::Disconnect(DisconnectKind::ConnectFailed));
                return Err(e);
            }
        };

        let (snapshot, changes) = probe.attributes().subscribe_with_snapshot();
        let sync = CancellationToken::new();
        let raced = {
            let mut binding = self.inner.binding();
            if binding.is_some() {
                true
            } else {
                self.inner.mirror.set_silent(snapshot.clone());
                *binding = Some(Binding {
                    probe: probe.clone(),
                    last_known: snapshot,
                    sync: sync.clone(),
                });
                false
            }
        };
        if raced {
            // A concurrent connect won.
            let _ = self.inner.router.disconnect_monitor(&probe).await;
            return Ok(());
        }

        info!(
            probe = %self.inner.params.label(),
            probe_id = %probe.id(),
            remote = probe.is_remote(),
            "Monitor connected"
        );

        self.inner.emit(MonitorEvent::Connect);
        self.inner
            .emit(MonitorEvent::Change(self.inner.mirror.snapshot()));

        tokio::spawn(sync_changes(
            Arc::downgrade(&self.inner),
            probe.id().clone(),
            probe.attributes().clone(),
            changes,
            sync,
            probe.lost(),
        ));
        Ok(())
    }

    /// Writes attributes locally and forwards the writable ones that differ
    /// from the probe's last known values.
    ///
    /// # Errors
    ///
    /// The probe's `set` failure. The local values are kept regardless.
    pub async fn set(&self, changes: Attributes) -> ProbeResult<()> {
        let applied = self.inner.mirror.set(changes);
        if !applied.is_empty() {
            self.inner.emit(MonitorEvent::Change(applied));
        }

        let (probe, batch) = {
            let binding = self.inner.binding();
            let Some(binding) = binding.as_ref() else {
                return Ok(());
            };
            let current = self.inner.mirror.snapshot();
            let batch: Attributes = current
                .into_iter()
                .filter(|(key, value)| {
                    binding.probe.writable().allows(key)
                        && binding.last_known.get(key) != Some(value)
                })
                .collect();
            (binding.probe.clone(), batch)
        };

        if batch.is_empty() {
            return Ok(());
        }

        match probe.control(SET_CONTROL, Value::Object(batch.clone())).await {
            Ok(_) => {
                if let Some(binding) = self.inner.binding().as_mut() {
                    binding.last_known.extend(batch);
                }
                Ok(())
            }
            Err(e) => {
                warn!(probe_id = %probe.id(), error = %e, "Forwarding attribute write failed");
                Err(e)
            }
        }
    }

    /// Invokes a control on the bound probe.
    pub async fn control(&self, name: &str, params: Value) -> ProbeResult<Value> {
        let probe = self
            .inner
            .binding()
            .as_ref()
            .map(|binding| binding.probe.clone())
            .ok_or(ProbeError::NotConnected)?;
        probe.control(name, params).await
    }

    /// Detaches from the probe and releases the reference.
    pub async fn disconnect(&self) -> ProbeResult<()> {
        let Some(binding) = self.inner.binding().take() else {
            return Ok(());
        };
        binding.sync.cancel();

        let released = self.inner.router.disconnect_monitor(&binding.probe).await;
        info!(probe_id = %binding.probe.id(), "Monitor disconnected");
        self.inner
            .emit(MonitorEvent::Disconnect(DisconnectKind::ManualDisconnect));
        released
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.mirror.get(key)
    }

    /// Snapshot of the mirrored attributes.
    pub fn attributes(&self) -> Attributes {
        self.inner.mirror.snapshot()
    }

    pub fn probe_id(&self) -> Option<ProbeId> {
        self.inner
            .binding()
            .as_ref()
            .map(|binding| binding.probe.id().clone())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.binding().is_some()
    }
}

impl MonitorInner {
    fn binding(&self) -> MutexGuard<'_, Option<Binding>> {
        self.binding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: MonitorEvent) {
        let _ = self.events.send(event);
    }

    fn apply_remote(&self, diff: Attributes) {
        if let Some(binding) = self.binding().as_mut() {
            binding.last_known.extend(diff.clone());
        }
        let applied = self.mirror.set(diff);
        if !applied.is_empty() {
            self.emit(MonitorEvent::Change(applied));
        }
    }

    fn handle_lost(&self, probe_id: &ProbeId) {
        let lost = {
            let mut binding = self.binding();
            if binding.as_ref().is_some_and(|b| b.probe.id() == probe_id) {
                binding.take()
            } else {
                None
            }
        };
        if let Some(binding) = lost {
            binding.sync.cancel();
            info!(probe_id = %binding.probe.id(), "Monitor lost its remote probe");
            self.emit(MonitorEvent::Disconnect(DisconnectKind::RemoteDisconnect));
        }
    }
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        let binding = self
            .binding
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(binding) = binding else {
            return;
        };
        binding.sync.cancel();

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let router = self.router.clone();
            runtime.spawn(async move {
                let _ = router.disconnect_monitor(&binding.probe).await;
            });
        }
    }
}

async fn sync_changes(
    monitor: Weak<MonitorInner>,
    probe_id: ProbeId,
    source: AttributeStore,
    mut changes: broadcast::Receiver<Attributes>,
    sync: CancellationToken,
    lost: Option<CancellationToken>,
) {
    let lost = lost.unwrap_or_else(CancellationToken::new);

    loop {
        tokio::select! {
            biased;

            _ = sync.cancelled() => break,

            _ = lost.cancelled() => {
                if let Some(inner) = monitor.upgrade() {
                    inner.handle_lost(&probe_id);
                }
                break;
            }

            received = changes.recv() => {
                let Some(inner) = monitor.upgrade() else { break };
                match received {
                    Ok(diff) => inner.apply_remote(diff),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Monitor lagged, resyncing from snapshot");
                        inner.apply_remote(source.snapshot());
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
}
