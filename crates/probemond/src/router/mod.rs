//! Routing of monitor requests to local or remote probes.
//!
//! The [`Router`] owns every [`Connection`] of the process, the local
//! probe registry and the identity used at handshake. Given a
//! [`MonitorParams`] it decides where the probe lives:
//!
//! ```text
//!                        ┌─ running locally / class registered ─▶ registry
//!  target is this ───────┤
//!  process?              └─ otherwise ─▶ default gateway ─▶ ClassNotAvailable
//!
//!                        ┌─ live connection to the target ─▶ that connection
//!  target is ────────────┤─ default gateway ─▶ gateway
//!  elsewhere             └─ may scan + host given ─▶ port scan ─▶ NoRouteToHost
//! ```
//!
//! Requests without a host that do not match this process fail with
//! `NoHostName`; requests relayed by a non-gateway peer fail with
//! `NotAGateway`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use probemon_core::{
    AttributeStore, MonitorParams, Probe, ProbeClasses, ProbeError, ProbeId, ProbeKey,
    ProbeResult, WritableAttributes,
};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProbemonConfig;
use crate::connection::{Connection, ConnectionState, DisconnectReason, Endpoint};
use crate::identity::ProcessIdentity;
use crate::registry::{spawn_registry, ProbeRegistryHandle, RunningProbeInfo};
use crate::stats::StatsHub;

mod discovery;
mod external;

pub use external::RemoteProbe;
pub(crate) use external::RemoteProbeCache;

/// Poll period while waiting for an auto-started probe to come up
const AUTO_START_POLL: Duration = Duration::from_millis(10);

/// Polls before giving up on an auto-started probe (5 seconds)
const AUTO_START_POLLS: u32 = 500;

/// Delay before re-dialing a lost default gateway
const GATEWAY_RETRY: Duration = Duration::from_secs(1);

// ============================================================================
// Probe References
// ============================================================================

/// A probe handed to a monitor: a local instance or a remote proxy.
#[derive(Clone)]
pub enum ProbeRef {
    Local(Arc<Probe>),
    Remote(Arc<RemoteProbe>),
}

impl ProbeRef {
    pub fn id(&self) -> &ProbeId {
        match self {
            Self::Local(probe) => probe.id(),
            Self::Remote(probe) => probe.id(),
        }
    }

    pub fn writable(&self) -> &WritableAttributes {
        match self {
            Self::Local(probe) => probe.writable(),
            Self::Remote(probe) => probe.writable(),
        }
    }

    pub fn attributes(&self) -> &AttributeStore {
        match self {
            Self::Local(probe) => probe.attributes(),
            Self::Remote(probe) => probe.attributes(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Invokes a control on the probe, over the wire for remote proxies.
    pub async fn control(&self, name: &str, params: Value) -> ProbeResult<Value> {
        match self {
            Self::Local(probe) => probe.on_control(name, params).await,
            Self::Remote(probe) => probe.control(name, params).await,
        }
    }

    /// Token cancelled when a remote proxy loses its connection.
    pub(crate) fn lost(&self) -> Option<CancellationToken> {
        match self {
            Self::Local(_) => None,
            Self::Remote(probe) => Some(probe.lost().clone()),
        }
    }
}

impl fmt::Debug for ProbeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(probe) => f.debug_tuple("Local").field(probe.id()).finish(),
            Self::Remote(probe) => f.debug_tuple("Remote").field(probe.id()).finish(),
        }
    }
}

/// Where a monitor request is served.
#[derive(Debug, Clone)]
pub enum Route {
    Local,
    Remote(Connection),
}

// ============================================================================
// Router
// ============================================================================

/// Process-wide routing state. Cheap to clone.
///
/// Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    identity: ProcessIdentity,
    config: ProbemonConfig,
    classes: ProbeClasses,
    registry: ProbeRegistryHandle,
    stats: StatsHub,
    state: Mutex<RouterState>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RouterState {
    connections: Vec<Connection>,
    default_gateway: Option<Connection>,
    gateway_endpoint: Option<Endpoint>,
    firewall: bool,
    /// Waiters of in-flight host scans, by host
    host_scans: HashMap<String, Vec<oneshot::Sender<()>>>,
}

impl Router {
    pub fn new(config: ProbemonConfig, classes: ProbeClasses, stats: StatsHub) -> Self {
        let identity = ProcessIdentity::current(&config);
        let registry = spawn_registry(classes.clone(), config.release_grace());
        let state = RouterState {
            firewall: config.firewall,
            ..RouterState::default()
        };

        info!(
            host = %identity.host_name,
            app = %identity.app_name,
            instance = %identity.app_instance,
            classes = ?classes.names(),
            "Router created"
        );

        Self {
            inner: Arc::new(RouterInner {
                identity,
                config,
                classes,
                registry,
                stats,
                state: Mutex::new(state),
                cancel: CancellationToken::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RouterState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn identity(&self) -> &ProcessIdentity {
        &self.inner.identity
    }

    pub fn config(&self) -> &ProbemonConfig {
        &self.inner.config
    }

    pub fn classes(&self) -> &ProbeClasses {
        &self.inner.classes
    }

    pub fn registry(&self) -> &ProbeRegistryHandle {
        &self.inner.registry
    }

    pub fn stats(&self) -> &StatsHub {
        &self.inner.stats
    }

    /// Token cancelled by [`Router::shutdown`].
    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    // ========================================================================
    // Local probes
    // ========================================================================

    /// Connects to (starting if needed) a probe of this process.
    pub async fn connect_internal(&self, params: MonitorParams) -> ProbeResult<Arc<Probe>> {
        self.inner.registry.connect(params).await
    }

    /// Drops one reference on a probe of this process.
    pub async fn disconnect_internal(&self, probe_id: &ProbeId) -> ProbeResult<()> {
        self.inner.registry.disconnect(probe_id.clone()).await
    }

    /// Connects the configured auto-start probes. Returns how many came up.
    pub async fn auto_start(&self) -> usize {
        let mut started = 0;
        for entry in &self.inner.config.auto_start {
            match self.connect_internal(entry.monitor_params()).await {
                Ok(probe) => {
                    info!(name = %entry.name, probe_id = %probe.id(), "Auto-started probe");
                    started += 1;
                }
                Err(e) => warn!(name = %entry.name, error = %e, "Auto-start failed"),
            }
        }
        started
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Decides where `params` is served.
    ///
    /// `make_new` allows opening connections (host scans); it is true for
    /// requests from local monitors and from gateway peers.
    pub async fn determine_connection(
        &self,
        params: &MonitorParams,
        make_new: bool,
    ) -> ProbeResult<Route> {
        if self.inner.identity.matches(params) {
            return self.local_route(params).await;
        }

        if let Some(conn) = self.find_connection(params) {
            return self.await_connection(conn).await.map(Route::Remote);
        }

        if let Some(gateway) = self.default_gateway() {
            return self.await_connection(gateway).await.map(Route::Remote);
        }

        let Some(host) = params.host_name.as_deref() else {
            return Err(ProbeError::NoHostName(params.label().to_string()));
        };

        if !make_new {
            return Err(ProbeError::NotAGateway);
        }

        self.add_host_connections(host).await;
        match self.find_connection(params) {
            Some(conn) => self.await_connection(conn).await.map(Route::Remote),
            None => Err(ProbeError::NoRouteToHost(host.to_string())),
        }
    }

    async fn local_route(&self, params: &MonitorParams) -> ProbeResult<Route> {
        let key = ProbeKey::build(params)?;
        if self.inner.registry.is_running(&key).await {
            return Ok(Route::Local);
        }
        if params
            .probe_class
            .as_deref()
            .is_some_and(|class| self.inner.classes.contains(class))
        {
            return Ok(Route::Local);
        }

        // Named probes that are configured for auto-start may still be
        // coming up.
        if self.is_auto_start(params) {
            for _ in 0..AUTO_START_POLLS {
                sleep(AUTO_START_POLL).await;
                if self.inner.registry.is_running(&key).await {
                    return Ok(Route::Local);
                }
            }
        }

        if let Some(gateway) = self.default_gateway() {
            return self.await_connection(gateway).await.map(Route::Remote);
        }

        Err(ProbeError::ClassNotAvailable(params.label().to_string()))
    }

    fn is_auto_start(&self, params: &MonitorParams) -> bool {
        params.probe_name.as_deref().is_some_and(|name| {
            self.inner
                .config
                .auto_start
                .iter()
                .any(|entry| entry.name == name)
        })
    }

    /// Resolves `params` to a probe, taking one reference on it.
    ///
    /// Pair with [`Router::release_probe`].
    pub async fn connect_probe(&self, params: &MonitorParams, make_new: bool) -> ProbeResult<ProbeRef> {
        self.inner.stats.increment("router", "probe_connects");

        match self.determine_connection(params, make_new).await? {
            Route::Local => self
                .connect_internal(params.clone())
                .await
                .map(ProbeRef::Local),
            Route::Remote(conn) => self
                .connect_external(&conn, params.clone())
                .await
                .map(ProbeRef::Remote),
        }
    }

    /// Drops the reference taken by [`Router::connect_probe`].
    pub async fn release_probe(&self, probe: &ProbeRef) -> ProbeResult<()> {
        match probe {
            ProbeRef::Local(probe) => self.disconnect_internal(probe.id()).await,
            ProbeRef::Remote(probe) => match probe.connection() {
                Some(conn) => self.disconnect_external(&conn, probe.id()).await,
                None => Ok(()),
            },
        }
    }

    /// Entry point for local monitors.
    pub async fn connect_monitor(&self, params: &MonitorParams) -> ProbeResult<ProbeRef> {
        self.connect_probe(params, true).await
    }

    /// Exit point for local monitors.
    pub async fn disconnect_monitor(&self, probe: &ProbeRef) -> ProbeResult<()> {
        self.release_probe(probe).await
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Tracks a connection until it disconnects.
    pub fn add_connection(&self, conn: Connection) {
        {
            let mut state = self.state();
            state.connections.retain(|c| c.id() != conn.id());
            state.connections.push(conn.clone());
        }
        self.inner.stats.increment("router", "connections");

        let router = self.clone();
        tokio::spawn(async move { router.watch_connection(conn).await });
    }

    async fn watch_connection(&self, conn: Connection) {
        let mut rx = conn.subscribe_state();
        let _ = rx.wait_for(|s| *s == ConnectionState::Disconnected).await;

        let was_gateway = {
            let mut state = self.state();
            state.connections.retain(|c| c.id() != conn.id());
            let was_gateway = state
                .default_gateway
                .as_ref()
                .is_some_and(|g| g.id() == conn.id());
            if was_gateway {
                state.default_gateway = None;
            }
            was_gateway
        };

        let incoming = conn.take_incoming();
        let released = incoming.len();
        for monitor in incoming {
            monitor.stop();
            if let Err(e) = self.release_probe(&monitor.probe).await {
                debug!(connection = conn.id(), error = %e, "Release after disconnect failed");
            }
        }

        debug!(connection = conn.id(), released, was_gateway, "Connection removed");

        if was_gateway {
            self.schedule_gateway_redial();
        }
    }

    /// Dials a peer and tracks the connection.
    pub fn connect_to(&self, host: &str, port: u16) -> Connection {
        let conn = Connection::dial(self, Endpoint::new(host, port), false);
        self.add_connection(conn.clone());
        conn
    }

    /// Dials `host:port` as the default gateway.
    ///
    /// The gateway is re-dialed whenever it disconnects, until
    /// [`Router::shutdown`].
    pub fn set_gateway(&self, host: &str, port: u16) -> Connection {
        let endpoint = Endpoint::new(host, port);
        let conn = Connection::dial(self, endpoint.clone(), true);
        {
            let mut state = self.state();
            state.gateway_endpoint = Some(endpoint.clone());
            state.default_gateway = Some(conn.clone());
        }
        info!(gateway = %endpoint, connection = conn.id(), "Default gateway set");
        self.add_connection(conn.clone());
        conn
    }

    pub fn default_gateway(&self) -> Option<Connection> {
        self.state()
            .default_gateway
            .clone()
            .filter(|gateway| !gateway.is_disconnected())
    }

    fn schedule_gateway_redial(&self) {
        let Some(endpoint) = self.state().gateway_endpoint.clone() else {
            return;
        };

        let router = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = router.inner.cancel.cancelled() => {}
                _ = sleep(GATEWAY_RETRY) => {
                    if router.state().default_gateway.is_none() {
                        debug!(gateway = %endpoint, "Re-dialing default gateway");
                        router.set_gateway(&endpoint.host, endpoint.port);
                    }
                }
            }
        });
    }

    /// Finds a live, unfirewalled connection to the process `params`
    /// targets.
    pub fn find_connection(&self, params: &MonitorParams) -> Option<Connection> {
        self.state()
            .connections
            .iter()
            .filter(|c| !c.firewall() && !c.is_disconnected())
            .find(|c| self.connection_matches(c, params))
            .cloned()
    }

    fn connection_matches(&self, conn: &Connection, params: &MonitorParams) -> bool {
        let remote = conn.remote_info();

        let host_ok = params.host_name.as_deref().map_or(true, |host| {
            let by_endpoint = conn
                .endpoint()
                .is_some_and(|e| e.host.eq_ignore_ascii_case(host));
            let by_remote = remote.as_ref().is_some_and(|r| {
                r.host_name.eq_ignore_ascii_case(host)
                    || (self.inner.identity.is_local_host(host)
                        && self.inner.identity.is_local_host(&r.host_name))
            });
            by_endpoint || by_remote
        });

        let app_ok = params
            .app_name
            .as_deref()
            .map_or(true, |app| remote.as_ref().is_some_and(|r| r.app_name == app));
        let instance_ok = params.app_instance.as_deref().map_or(true, |instance| {
            remote.as_ref().is_some_and(|r| r.app_instance == instance)
        });

        host_ok && app_ok && instance_ok
    }

    fn settle_timeout(&self) -> Duration {
        self.inner.config.connect_timeout() * 2
    }

    /// Waits for `conn` to finish connecting, re-dialing once if it dropped.
    pub async fn await_connection(&self, conn: Connection) -> ProbeResult<Connection> {
        let limit = self.settle_timeout();
        if conn.wait_settled(limit).await == ConnectionState::Connected {
            return Ok(conn);
        }

        let Some(endpoint) = conn.endpoint().cloned() else {
            return Err(ProbeError::Connection(format!(
                "connection {} dropped",
                conn.id()
            )));
        };

        debug!(connection = conn.id(), %endpoint, "Re-dialing dropped connection");
        let fresh = Connection::dial(self, endpoint.clone(), conn.is_gateway());
        {
            let mut state = self.state();
            let replaces_gateway = state
                .default_gateway
                .as_ref()
                .map_or(false, |g| g.id() == conn.id());
            if replaces_gateway {
                state.default_gateway = Some(fresh.clone());
            }
        }
        self.add_connection(fresh.clone());

        match fresh.wait_settled(limit).await {
            ConnectionState::Connected => Ok(fresh),
            _ => Err(ProbeError::Connection(format!("cannot reach {endpoint}"))),
        }
    }

    /// Snapshot of the tracked connections.
    pub fn connections(&self) -> Vec<Connection> {
        self.state().connections.clone()
    }

    /// Probes running in this process.
    pub async fn running_probes(&self) -> Vec<RunningProbeInfo> {
        self.inner.registry.list().await
    }

    /// Default firewall flag for connections accepted from now on.
    pub fn firewall(&self) -> bool {
        self.state().firewall
    }

    pub fn set_firewall(&self, firewall: bool) {
        self.state().firewall = firewall;
        info!(firewall, "Default firewall changed");
    }

    /// Disconnects every connection and releases every local probe.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();

        let connections = {
            let mut state = self.state();
            state.default_gateway = None;
            state.gateway_endpoint = None;
            std::mem::take(&mut state.connections)
        };
        for conn in &connections {
            conn.disconnect(DisconnectReason::Shutdown);
        }

        let released = self.inner.registry.shutdown().await;
        info!(connections = connections.len(), released, "Router shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AutoStartProbe;
    use crate::probes::register_builtin;

    fn router(app: &str) -> Router {
        let config = ProbemonConfig {
            app_name: app.to_string(),
            release_grace_ms: 0,
            ..ProbemonConfig::default()
        };
        let stats = StatsHub::new();
        let mut classes = ProbeClasses::new();
        register_builtin(&mut classes, &stats);
        Router::new(config, classes, stats)
    }

    #[tokio::test]
    async fn test_local_class_routes_locally() {
        let router = router("A");
        let route = router
            .determine_connection(&MonitorParams::class("Stat"), true)
            .await
            .unwrap();
        assert!(matches!(route, Route::Local));
    }

    #[tokio::test]
    async fn test_unknown_local_class() {
        let router = router("A");
        let err = router
            .determine_connection(&MonitorParams::class("Nope"), true)
            .await
            .unwrap_err();
        assert_eq!(err, ProbeError::ClassNotAvailable("Nope".to_string()));
    }

    #[tokio::test]
    async fn test_other_app_without_host() {
        let router = router("A");
        let params = MonitorParams::class("Stat").app("B");
        let err = router.determine_connection(&params, true).await.unwrap_err();
        assert!(matches!(err, ProbeError::NoHostName(_)));
    }

    #[tokio::test]
    async fn test_relay_refused_without_gateway() {
        let router = router("A");
        let params = MonitorParams::class("Stat").host("elsewhere.invalid");
        let err = router.determine_connection(&params, false).await.unwrap_err();
        assert_eq!(err, ProbeError::NotAGateway);
    }

    #[tokio::test]
    async fn test_connect_and_release_local_probe() {
        let router = router("A");
        let probe = router
            .connect_monitor(&MonitorParams::class("Stat"))
            .await
            .unwrap();
        assert!(!probe.is_remote());
        assert_eq!(router.running_probes().await.len(), 1);

        router.disconnect_monitor(&probe).await.unwrap();
        router.shutdown().await;
        assert!(router.running_probes().await.is_empty());
    }

    fn auto_start_router() -> Router {
        let config = ProbemonConfig {
            app_name: "A".to_string(),
            release_grace_ms: 0,
            auto_start: vec![AutoStartProbe {
                name: "hub".to_string(),
                probe_class: "Stat".to_string(),
                init_params: probemon_core::Attributes::new(),
            }],
            ..ProbemonConfig::default()
        };
        let stats = StatsHub::new();
        let mut classes = ProbeClasses::new();
        register_builtin(&mut classes, &stats);
        Router::new(config, classes, stats)
    }

    #[tokio::test]
    async fn test_named_probe_waits_for_auto_start() {
        let router = auto_start_router();
        let starter = router.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            starter.auto_start().await
        });

        let probe = router
            .connect_monitor(&MonitorParams::named("hub"))
            .await
            .unwrap();
        assert!(!probe.is_remote());

        let running = router.running_probes().await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].ref_count, 2);

        router.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_named_probe_gives_up_when_never_started() {
        let router = auto_start_router();
        let err = router
            .determine_connection(&MonitorParams::named("hub"), true)
            .await
            .unwrap_err();
        assert_eq!(err, ProbeError::ClassNotAvailable("hub".to_string()));
    }

    #[tokio::test]
    async fn test_firewall_default() {
        let router = router("A");
        assert!(!router.firewall());
        router.set_firewall(true);
        assert!(router.firewall());
    }
}
