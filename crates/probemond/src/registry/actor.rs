//! Registry actor - owns the local probe instances and their references.
//!
//! # Ownership
//!
//! The actor owns:
//! - `by_key`: one entry per canonical probe key, starting or running
//! - `key_by_id`: index for probe id → key lookups (running probes only)
//!
//! A probe becomes visible through `key_by_id` only once its construction
//! has settled, so no caller can observe a half-initialized instance.
//! Construction runs on its own task and reports back with
//! `RegistryCommand::Started`; connects arriving meanwhile queue on the
//! starting entry.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Panics inside probe classes are caught and surfaced as errors
//! - Reply send failures are ignored (the caller went away)

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use probemon_core::{
    AttributeStore, MonitorParams, Probe, ProbeBehavior, ProbeClasses, ProbeError, ProbeFactory,
    ProbeId, ProbeInit, ProbeKey, ProbeResult, ID_ATTRIBUTE,
};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::commands::{ConnectReply, RegistryCommand, RegistryEvent, RunningProbeInfo};

enum Entry {
    Starting {
        waiters: Vec<ConnectReply>,
    },
    Running {
        probe: Arc<Probe>,
        ref_count: usize,
    },
}

/// The registry actor.
pub struct RegistryActor {
    receiver: mpsc::Receiver<RegistryCommand>,

    /// Sender back into our own queue for init tasks and grace timers.
    /// Weak so that the actor stops once every handle is dropped.
    loopback: mpsc::WeakSender<RegistryCommand>,

    classes: ProbeClasses,
    grace: Duration,

    by_key: HashMap<ProbeKey, Entry>,
    key_by_id: HashMap<ProbeId, ProbeKey>,

    event_publisher: broadcast::Sender<RegistryEvent>,
}

impl RegistryActor {
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        loopback: mpsc::WeakSender<RegistryCommand>,
        classes: ProbeClasses,
        grace: Duration,
        event_publisher: broadcast::Sender<RegistryEvent>,
    ) -> Self {
        Self {
            receiver,
            loopback,
            classes,
            grace,
            by_key: HashMap::new(),
            key_by_id: HashMap::new(),
            event_publisher,
        }
    }

    /// Runs the actor loop until every handle is dropped.
    pub async fn run(mut self) {
        info!(
            classes = ?self.classes.names(),
            grace_ms = self.grace.as_millis() as u64,
            "Probe registry starting"
        );

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        let released = self.handle_shutdown();
        info!(released, "Probe registry stopped");
    }

    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Connect {
                key,
                params,
                respond_to,
            } => self.handle_connect(key, params, respond_to),
            RegistryCommand::Disconnect {
                probe_id,
                respond_to,
            } => {
                self.handle_disconnect(&probe_id);
                let _ = respond_to.send(Ok(()));
            }
            RegistryCommand::Started { key, result } => self.handle_started(key, result),
            RegistryCommand::ReleaseIfIdle { key, probe_id } => {
                self.handle_release_if_idle(&key, &probe_id)
            }
            RegistryCommand::GetProbe {
                probe_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.running_by_id(&probe_id));
            }
            RegistryCommand::IsRunning { key, respond_to } => {
                let _ = respond_to.send(self.by_key.contains_key(&key));
            }
            RegistryCommand::List { respond_to } => {
                let _ = respond_to.send(self.handle_list());
            }
            RegistryCommand::Shutdown { respond_to } => {
                let _ = respond_to.send(self.handle_shutdown());
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_connect(&mut self, key: ProbeKey, params: MonitorParams, respond_to: ConnectReply) {
        match self.by_key.get_mut(&key) {
            Some(Entry::Running { probe, ref_count }) => {
                if respond_to.send(Ok(Arc::clone(probe))).is_ok() {
                    *ref_count += 1;
                    debug!(probe_id = %probe.id(), %key, ref_count = *ref_count, "Probe reference added");
                }
                return;
            }
            Some(Entry::Starting { waiters }) => {
                waiters.push(respond_to);
                return;
            }
            None => {}
        }

        let Some((class, factory)) = params
            .probe_class
            .as_deref()
            .and_then(|class| self.classes.get(class).map(|f| (class.to_string(), f)))
        else {
            let _ = respond_to.send(Err(ProbeError::ClassNotAvailable(
                params.label().to_string(),
            )));
            return;
        };

        let id = ProbeId::generate();
        debug!(probe_id = %id, %key, %class, "Starting probe");
        self.by_key.insert(
            key.clone(),
            Entry::Starting {
                waiters: vec![respond_to],
            },
        );

        let loopback = self.loopback.clone();
        let init_params = params.init_params;
        tokio::spawn(async move {
            let result = start_probe(id, class, factory, init_params).await;
            if let Some(tx) = loopback.upgrade() {
                let _ = tx.send(RegistryCommand::Started { key, result }).await;
            }
        });
    }

    fn handle_started(&mut self, key: ProbeKey, result: ProbeResult<Arc<Probe>>) {
        let Some(Entry::Starting { waiters }) = self.by_key.remove(&key) else {
            warn!(%key, "Start result for unknown probe key");
            return;
        };

        let probe = match result {
            Ok(probe) => probe,
            Err(e) => {
                warn!(%key, error = %e, "Probe failed to start");
                for waiter in waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
                return;
            }
        };

        // Only callers still waiting take a reference.
        let mut ref_count = 0;
        for waiter in waiters {
            if waiter.send(Ok(Arc::clone(&probe))).is_ok() {
                ref_count += 1;
            }
        }

        info!(probe_id = %probe.id(), %key, class = probe.class(), ref_count, "Probe started");
        let _ = self.event_publisher.send(RegistryEvent::Started {
            probe_id: probe.id().clone(),
            key: key.clone(),
            class: probe.class().to_string(),
        });

        self.key_by_id.insert(probe.id().clone(), key.clone());
        let probe_id = probe.id().clone();
        self.by_key.insert(key.clone(), Entry::Running { probe, ref_count });

        if ref_count == 0 {
            self.schedule_release(key, probe_id);
        }
    }

    fn handle_disconnect(&mut self, probe_id: &ProbeId) {
        let Some(key) = self.key_by_id.get(probe_id).cloned() else {
            debug!(%probe_id, "Disconnect for unknown probe ignored");
            return;
        };

        if let Some(Entry::Running { ref_count, .. }) = self.by_key.get_mut(&key) {
            *ref_count = ref_count.saturating_sub(1);
            debug!(%probe_id, %key, ref_count = *ref_count, "Probe reference dropped");
            if *ref_count == 0 {
                self.schedule_release(key, probe_id.clone());
            }
        }
    }

    /// Arms the grace timer. The re-check happens when it fires, so a
    /// reference taken in between keeps the probe alive.
    fn schedule_release(&mut self, key: ProbeKey, probe_id: ProbeId) {
        if self.grace.is_zero() {
            self.handle_release_if_idle(&key, &probe_id);
            return;
        }

        let loopback = self.loopback.clone();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(tx) = loopback.upgrade() {
                let _ = tx
                    .send(RegistryCommand::ReleaseIfIdle { key, probe_id })
                    .await;
            }
        });
    }

    fn handle_release_if_idle(&mut self, key: &ProbeKey, probe_id: &ProbeId) {
        let idle = matches!(
            self.by_key.get(key),
            Some(Entry::Running { probe, ref_count: 0 }) if probe.id() == probe_id
        );
        if !idle {
            return;
        }

        if let Some(Entry::Running { probe, .. }) = self.by_key.remove(key) {
            self.key_by_id.remove(probe_id);
            self.release(key, &probe);
        }
    }

    fn handle_list(&self) -> Vec<RunningProbeInfo> {
        let mut list: Vec<RunningProbeInfo> = self
            .by_key
            .iter()
            .filter_map(|(key, entry)| match entry {
                Entry::Running { probe, ref_count } => Some(RunningProbeInfo {
                    id: probe.id().clone(),
                    key: key.clone(),
                    class: probe.class().to_string(),
                    ref_count: *ref_count,
                }),
                Entry::Starting { .. } => None,
            })
            .collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        list
    }

    fn handle_shutdown(&mut self) -> usize {
        let mut released = 0;
        for (key, entry) in self.by_key.drain().collect::<Vec<_>>() {
            if let Entry::Running { probe, .. } = entry {
                self.release(&key, &probe);
                released += 1;
            }
        }
        self.key_by_id.clear();
        released
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn running_by_id(&self, probe_id: &ProbeId) -> Option<Arc<Probe>> {
        let key = self.key_by_id.get(probe_id)?;
        match self.by_key.get(key)? {
            Entry::Running { probe, .. } => Some(Arc::clone(probe)),
            Entry::Starting { .. } => None,
        }
    }

    fn release(&self, key: &ProbeKey, probe: &Probe) {
        if catch_unwind(AssertUnwindSafe(|| probe.release())).is_err() {
            warn!(probe_id = %probe.id(), %key, "Probe release panicked");
        }
        info!(probe_id = %probe.id(), %key, "Probe released");
        let _ = self.event_publisher.send(RegistryEvent::Released {
            probe_id: probe.id().clone(),
            key: key.clone(),
        });
    }
}

/// Constructs and initializes a probe instance.
///
/// Runs on its own task so that a panicking class cannot take the actor
/// down. A failed initialization releases the instance before reporting.
async fn start_probe(
    id: ProbeId,
    class: String,
    factory: Arc<dyn ProbeFactory>,
    init_params: probemon_core::Attributes,
) -> ProbeResult<Arc<Probe>> {
    let mut initial = init_params.clone();
    initial.insert(ID_ATTRIBUTE.to_string(), Value::String(id.to_string()));
    let attributes = AttributeStore::new(initial);
    let writable = factory.writable_attributes();

    let init = ProbeInit {
        id: id.clone(),
        init_params,
        attributes: attributes.clone(),
    };

    let construct = tokio::spawn(async move {
        let behavior: Arc<dyn ProbeBehavior> = Arc::from(factory.create(init)?);
        if let Err(e) = behavior.initialize().await {
            let _ = catch_unwind(AssertUnwindSafe(|| behavior.release()));
            return Err(e);
        }
        Ok(behavior)
    });

    match construct.await {
        Ok(Ok(behavior)) => Ok(Arc::new(Probe::new(id, class, writable, attributes, behavior))),
        Ok(Err(e)) => Err(e),
        Err(e) if e.is_panic() => Err(ProbeError::Init(format!("{class} panicked during construction"))),
        Err(e) => Err(ProbeError::Init(e.to_string())),
    }
}
