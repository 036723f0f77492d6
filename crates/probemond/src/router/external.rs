//! Proxies for probes living in other processes.
//!
//! Every connection keeps a [`RemoteProbeCache`]: one [`RemoteProbe`] per
//! remote probe id, reference counted across local users, plus the routed
//! keys being resolved right now so that concurrent connects for the same
//! target share one `probe:connect` round-trip.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use probemon_core::{
    AttributeStore, MonitorParams, ProbeError, ProbeId, ProbeKey, ProbeResult, WritableAttributes,
};
use probemon_protocol::{
    probe_change_event, ProbeConnectResponse, ProbeControlRequest, ProbeDisconnectRequest,
    PROBE_CONNECT, PROBE_CONTROL, PROBE_DISCONNECT,
};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Router;
use crate::connection::{Connection, WeakConnection};

type Waiter = oneshot::Sender<ProbeResult<Arc<RemoteProbe>>>;

fn closed() -> ProbeError {
    ProbeError::Connection("connection closed".to_string())
}

// ============================================================================
// Remote Probe
// ============================================================================

/// Local stand-in for a probe of another process.
///
/// Its attribute store is kept current by the connection's
/// `probe:change:<id>` handler.
pub struct RemoteProbe {
    id: ProbeId,
    key: ProbeKey,
    writable: WritableAttributes,
    attributes: AttributeStore,
    connection: WeakConnection,
    lost: CancellationToken,
}

impl RemoteProbe {
    pub fn id(&self) -> &ProbeId {
        &self.id
    }

    /// Routed key this proxy was resolved for.
    pub fn key(&self) -> &ProbeKey {
        &self.key
    }

    pub fn writable(&self) -> &WritableAttributes {
        &self.writable
    }

    pub fn attributes(&self) -> &AttributeStore {
        &self.attributes
    }

    pub fn connection(&self) -> Option<Connection> {
        self.connection.upgrade()
    }

    /// Cancelled when the carrying connection disconnects.
    pub fn lost(&self) -> &CancellationToken {
        &self.lost
    }

    /// Sends `probe:control` and waits for the answer.
    pub async fn control(&self, name: &str, params: Value) -> ProbeResult<Value> {
        let conn = self
            .connection()
            .filter(|c| !c.is_disconnected())
            .ok_or(ProbeError::NotConnected)?;
        let request = ProbeControlRequest {
            probe_id: self.id.clone(),
            name: name.to_string(),
            params,
        };
        let payload =
            serde_json::to_value(request).map_err(|e| ProbeError::ControlFailed(e.to_string()))?;
        conn.request(PROBE_CONTROL, payload).await
    }
}

impl fmt::Debug for RemoteProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteProbe")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Cache
// ============================================================================

struct CachedProbe {
    probe: Arc<RemoteProbe>,
    ref_count: usize,
}

#[derive(Default)]
struct CacheState {
    by_id: HashMap<ProbeId, CachedProbe>,
    ids_by_key: HashMap<ProbeKey, ProbeId>,
    pending_by_key: HashMap<ProbeKey, Vec<Waiter>>,
}

/// Per-connection table of remote probe proxies.
#[derive(Default)]
pub(crate) struct RemoteProbeCache {
    state: Mutex<CacheState>,
}

impl RemoteProbeCache {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    /// Local references held on a remote probe.
    pub(crate) fn ref_count(&self, probe_id: &ProbeId) -> Option<usize> {
        self.lock().by_id.get(probe_id).map(|entry| entry.ref_count)
    }

    /// Forgets every proxy and fails every in-flight resolution.
    pub(crate) fn clear(&self) {
        let waiters: Vec<Waiter> = {
            let mut state = self.lock();
            state.by_id.clear();
            state.ids_by_key.clear();
            state.pending_by_key.drain().flat_map(|(_, w)| w).collect()
        };
        for waiter in waiters {
            let _ = waiter.send(Err(closed()));
        }
    }
}

// ============================================================================
// Router operations
// ============================================================================

impl Router {
    /// Resolves `params` through `conn`, sharing proxies and in-flight
    /// resolutions per routed key. Takes one local reference.
    pub async fn connect_external(
        &self,
        conn: &Connection,
        params: MonitorParams,
    ) -> ProbeResult<Arc<RemoteProbe>> {
        let key = ProbeKey::build_routed(&params)?;
        let (tx, rx) = oneshot::channel();

        let initiator = {
            let mut cache = conn.remote_probes().lock();
            if let Some(id) = cache.ids_by_key.get(&key).cloned() {
                if let Some(entry) = cache.by_id.get_mut(&id) {
                    entry.ref_count += 1;
                    return Ok(Arc::clone(&entry.probe));
                }
            }
            match cache.pending_by_key.get_mut(&key) {
                Some(waiters) => {
                    waiters.push(tx);
                    false
                }
                None => {
                    cache.pending_by_key.insert(key.clone(), vec![tx]);
                    true
                }
            }
        };

        if initiator {
            debug!(connection = conn.id(), %key, "Resolving remote probe");
            tokio::spawn(resolve(self.clone(), conn.clone(), key, params));
        }

        rx.await.map_err(|_| closed())?
    }

    /// Drops one local reference; the last one sends `probe:disconnect`.
    pub async fn disconnect_external(&self, conn: &Connection, probe_id: &ProbeId) -> ProbeResult<()> {
        {
            let mut cache = conn.remote_probes().lock();
            match cache.by_id.get_mut(probe_id) {
                None => return Ok(()),
                Some(entry) => {
                    entry.ref_count = entry.ref_count.saturating_sub(1);
                    if entry.ref_count > 0 {
                        return Ok(());
                    }
                }
            }
            cache.by_id.remove(probe_id);
            cache.ids_by_key.retain(|_, id| id != probe_id);
        }

        send_disconnect(conn, probe_id).await
    }
}

async fn send_disconnect(conn: &Connection, probe_id: &ProbeId) -> ProbeResult<()> {
    conn.remove_event(&probe_change_event(probe_id));
    if conn.is_disconnected() {
        return Ok(());
    }

    debug!(connection = conn.id(), %probe_id, "Releasing remote probe");
    let request = ProbeDisconnectRequest {
        probe_id: probe_id.clone(),
    };
    let payload = serde_json::to_value(request).map_err(|e| ProbeError::Connection(e.to_string()))?;
    conn.request(PROBE_DISCONNECT, payload).await.map(|_| ())
}

/// Binds the change handler for a `probe:connect` answer.
///
/// Runs on the reader task, so the handler is in place before the first
/// `probe:change` for this probe is read.
fn bind_proxy(
    conn: &WeakConnection,
    outcome: ProbeResult<Value>,
) -> ProbeResult<(ProbeConnectResponse, Option<AttributeStore>)> {
    let response: ProbeConnectResponse = serde_json::from_value(outcome?).map_err(|e| {
        ProbeError::Connection(format!("malformed probe:connect response: {e}"))
    })?;
    let conn = conn.upgrade().ok_or_else(closed)?;

    let store = AttributeStore::new(response.attributes.clone());
    let sink = store.clone();
    let bound = conn
        .add_event(
            probe_change_event(&response.probe_id),
            Arc::new(move |payload| {
                if let Value::Object(diff) = payload {
                    sink.set(diff);
                }
            }),
        )
        .is_ok();

    Ok((response, bound.then_some(store)))
}

async fn resolve(router: Router, conn: Connection, key: ProbeKey, params: MonitorParams) {
    let weak = conn.downgrade();
    let result = match serde_json::to_value(&params) {
        Ok(payload) => {
            conn.request_with(PROBE_CONNECT, payload, move |outcome| {
                bind_proxy(&weak, outcome)
            })
            .await
        }
        Err(e) => Err(ProbeError::InvalidParams(e.to_string())),
    };

    let mut orphan = None;
    {
        let mut cache = conn.remote_probes().lock();
        let waiters = cache.pending_by_key.remove(&key).unwrap_or_default();

        let resolved = result.and_then(|(response, store)| {
            if let Some(existing) = cache.by_id.get(&response.probe_id) {
                // Another routed key already resolved to this probe.
                let probe = Arc::clone(&existing.probe);
                cache.ids_by_key.insert(key.clone(), response.probe_id);
                return Ok(probe);
            }
            let store = store.ok_or_else(|| {
                ProbeError::Connection(format!(
                    "change handler for {} already bound",
                    response.probe_id
                ))
            })?;
            let probe = Arc::new(RemoteProbe {
                id: response.probe_id.clone(),
                key: key.clone(),
                writable: response.writable_attributes,
                attributes: store,
                connection: conn.downgrade(),
                lost: conn.child_token(),
            });
            cache.by_id.insert(
                response.probe_id.clone(),
                CachedProbe {
                    probe: Arc::clone(&probe),
                    ref_count: 0,
                },
            );
            cache.ids_by_key.insert(key.clone(), response.probe_id);
            Ok(probe)
        });

        match resolved {
            Ok(probe) => {
                let delivered = waiters
                    .into_iter()
                    .filter(|waiter| !waiter.is_closed())
                    .map(|waiter| waiter.send(Ok(Arc::clone(&probe))))
                    .filter(Result::is_ok)
                    .count();

                let id = probe.id().clone();
                let idle = match cache.by_id.get_mut(&id) {
                    Some(entry) => {
                        entry.ref_count += delivered;
                        entry.ref_count == 0
                    }
                    None => false,
                };
                if idle {
                    cache.by_id.remove(&id);
                    cache.ids_by_key.retain(|_, known| *known != id);
                    orphan = Some(id);
                }
            }
            Err(e) => {
                debug!(connection = conn.id(), %key, error = %e, "Remote probe resolution failed");
                for waiter in waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
            }
        }
    }

    if let Some(id) = orphan {
        if let Err(e) = send_disconnect(&conn, &id).await {
            debug!(connection = conn.id(), probe_id = %id, error = %e, "Orphan release failed");
        }
    }

    router.stats().increment("router", "remote_resolutions");
}
