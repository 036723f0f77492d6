//! Handling of `probe:*` requests sent by the peer.
//!
//! Each probe the peer connects through this connection is tracked as an
//! [`IncomingMonitor`]: the resolved probe plus a forwarder task that pushes
//! attribute diffs to the peer as `probe:change:<id>`. The forwarder is armed
//! only after the `probe:connect` ack is written, so the peer always sees the
//! full snapshot before the first diff.
//!
//! Requests are drained from a per-connection queue by one task, so a
//! peer's controls and disconnects take effect in the order it sent them.
//! `probe:connect` is resolved on its own task; the peer cannot address the
//! probe before the connect ack, which is written after tracking starts.

use probemon_core::{Attributes, MonitorParams, ProbeError, ProbeId, ProbeResult};
use probemon_protocol::{
    probe_change_event, Frame, ProbeConnectResponse, ProbeControlRequest,
    ProbeDisconnectRequest, PROBE_CONNECT, PROBE_CONTROL, PROBE_DISCONNECT,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Connection;
use crate::router::{ProbeRef, Router};

/// A probe served to the peer over this connection.
pub(crate) struct IncomingMonitor {
    pub(crate) probe: ProbeRef,
    forwarder: CancellationToken,
    arm: Option<oneshot::Sender<()>>,
}

impl IncomingMonitor {
    /// Stops forwarding changes.
    pub(crate) fn stop(&self) {
        self.forwarder.cancel();
    }
}

fn parse<T: DeserializeOwned>(payload: Value) -> ProbeResult<T> {
    serde_json::from_value(payload).map_err(|e| ProbeError::InvalidParams(e.to_string()))
}

fn connect_response(probe: &ProbeRef, attributes: Attributes) -> ProbeConnectResponse {
    ProbeConnectResponse {
        probe_id: probe.id().clone(),
        writable_attributes: probe.writable().clone(),
        attributes,
    }
}

/// A `probe:*` request waiting for its turn.
pub(super) struct InboundRequest {
    pub(super) name: String,
    pub(super) payload: Value,
    pub(super) ack: Option<u64>,
}

/// Handles queued requests in arrival order until the connection closes.
pub(super) async fn serve_requests(
    conn: Connection,
    router: Router,
    mut queue: mpsc::UnboundedReceiver<InboundRequest>,
) {
    let closed = conn.child_token();

    loop {
        let request = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            request = queue.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        if request.name == PROBE_CONNECT {
            let conn = conn.clone();
            let router = router.clone();
            tokio::spawn(async move { handle_request(&conn, &router, request).await });
        } else {
            handle_request(&conn, &router, request).await;
        }
    }

    debug!(connection = conn.id(), "Request queue stopped");
}

/// Runs one inbound request and acks it.
async fn handle_request(conn: &Connection, router: &Router, request: InboundRequest) {
    let InboundRequest { name, payload, ack } = request;
    let mut arm = None;
    let outcome = match name.as_str() {
        PROBE_CONNECT => match conn.probe_connect(router, payload).await {
            Ok(response) => {
                arm = Some(response.probe_id.clone());
                serde_json::to_value(response)
                    .map_err(|e| ProbeError::Connection(e.to_string()))
            }
            Err(e) => Err(e),
        },
        PROBE_DISCONNECT => conn
            .probe_disconnect(router, payload)
            .await
            .map(|()| Value::Null),
        PROBE_CONTROL => conn.probe_control(router, payload).await,
        other => Err(ProbeError::NoControl(other.to_string())),
    };

    if let Err(e) = &outcome {
        debug!(connection = conn.id(), request = %name, error = %e, "Inbound request failed");
    }

    if let Some(id) = ack {
        if let Err(e) = conn.send_frame(Frame::ack(id, outcome)).await {
            debug!(connection = conn.id(), error = %e, "Failed to ack inbound request");
        }
    }

    if let Some(probe_id) = arm {
        conn.arm_forwarder(&probe_id);
    }
}

impl Connection {
    /// Serves `probe:connect`: resolves the probe through the router and
    /// starts tracking it for this peer.
    ///
    /// A second connect for a probe already served on this connection
    /// returns the current state without taking another reference.
    ///
    /// # Errors
    ///
    /// `ProbeError::Firewalled` on a firewalled connection; otherwise any
    /// resolution error from the router.
    pub async fn probe_connect(
        &self,
        router: &Router,
        payload: Value,
    ) -> ProbeResult<ProbeConnectResponse> {
        if self.firewall() {
            debug!(connection = self.id(), "Refusing probe:connect on firewalled connection");
            return Err(ProbeError::Firewalled);
        }

        let params: MonitorParams = parse(payload)?;
        let probe = router.connect_probe(&params, self.is_gateway()).await?;

        enum Tracked {
            Closed,
            Duplicate(ProbeConnectResponse),
            Added(ProbeConnectResponse),
        }

        let tracked = {
            let mut incoming = self.incoming();
            if self.is_disconnected() {
                Tracked::Closed
            } else if let Some(existing) = incoming.get(probe.id()) {
                Tracked::Duplicate(connect_response(
                    &existing.probe,
                    existing.probe.attributes().snapshot(),
                ))
            } else {
                let (snapshot, changes) = probe.attributes().subscribe_with_snapshot();
                let forwarder = self.child_token();
                let (arm, armed) = oneshot::channel();
                tokio::spawn(forward_changes(
                    self.clone(),
                    probe.clone(),
                    changes,
                    forwarder.clone(),
                    armed,
                ));
                incoming.insert(
                    probe.id().clone(),
                    IncomingMonitor {
                        probe: probe.clone(),
                        forwarder,
                        arm: Some(arm),
                    },
                );
                Tracked::Added(connect_response(&probe, snapshot))
            }
        };

        match tracked {
            Tracked::Added(response) => {
                debug!(connection = self.id(), probe_id = %probe.id(), "Serving probe to peer");
                Ok(response)
            }
            Tracked::Duplicate(response) => {
                debug!(connection = self.id(), probe_id = %probe.id(), "Duplicate probe:connect");
                router.release_probe(&probe).await?;
                Ok(response)
            }
            Tracked::Closed => {
                router.release_probe(&probe).await?;
                Err(ProbeError::Connection("connection closed".to_string()))
            }
        }
    }

    /// Serves `probe:disconnect`. Unknown ids are a no-op.
    pub async fn probe_disconnect(&self, router: &Router, payload: Value) -> ProbeResult<()> {
        let request: ProbeDisconnectRequest = parse(payload)?;
        let removed = self.incoming().remove(&request.probe_id);

        match removed {
            Some(monitor) => {
                monitor.stop();
                debug!(connection = self.id(), probe_id = %request.probe_id, "Peer released probe");
                router.release_probe(&monitor.probe).await
            }
            None => {
                debug!(connection = self.id(), probe_id = %request.probe_id, "probe:disconnect for unknown probe");
                Ok(())
            }
        }
    }

    /// Serves `probe:control`: a local probe by id, else a probe this
    /// connection relays for its peer.
    pub async fn probe_control(&self, router: &Router, payload: Value) -> ProbeResult<Value> {
        if self.firewall() {
            return Err(ProbeError::Firewalled);
        }

        let request: ProbeControlRequest = parse(payload)?;
        if let Some(probe) = router.registry().get(&request.probe_id).await {
            return probe.on_control(&request.name, request.params).await;
        }

        let relayed = self
            .incoming()
            .get(&request.probe_id)
            .map(|monitor| monitor.probe.clone());
        match relayed {
            Some(probe) => probe.control(&request.name, request.params).await,
            None => Err(ProbeError::ProbeNotRunning(request.probe_id.to_string())),
        }
    }

    /// Starts change forwarding for a freshly acked probe.
    fn arm_forwarder(&self, probe_id: &ProbeId) {
        let arm = self
            .incoming()
            .get_mut(probe_id)
            .and_then(|monitor| monitor.arm.take());
        if let Some(arm) = arm {
            let _ = arm.send(());
        }
    }
}

async fn forward_changes(
    conn: Connection,
    probe: ProbeRef,
    mut changes: broadcast::Receiver<Attributes>,
    cancel: CancellationToken,
    armed: oneshot::Receiver<()>,
) {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        armed = armed => if armed.is_err() { return },
    }

    let event = probe_change_event(probe.id());
    loop {
        let diff = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = changes.recv() => match received {
                Ok(diff) => diff,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(connection = conn.id(), probe_id = %probe.id(), skipped, "Forwarder lagged, resending snapshot");
                    probe.attributes().snapshot()
                }
                Err(RecvError::Closed) => break,
            },
        };

        if conn.emit(&event, Value::Object(diff)).await.is_err() {
            break;
        }
    }

    debug!(connection = conn.id(), probe_id = %probe.id(), "Change forwarder stopped");
}
