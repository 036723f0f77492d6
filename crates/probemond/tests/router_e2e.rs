//! End-to-end tests across two routers in one test process.
//!
//! Router `alpha` serves an `Echo` probe class on an ephemeral loopback
//! port. Router `beta` has no classes; its port window is exactly alpha's
//! port, so monitors on beta that target `app = "alpha"` are resolved by a
//! host scan and served through a remote proxy. A third router, `gamma`,
//! reaches alpha only through beta as its default gateway.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::time::Duration;

use probemon_core::{
    async_trait, AttributeStore, Attributes, MonitorParams, ProbeBehavior, ProbeClasses,
    ProbeError, ProbeInit, ProbeResult, WritableAttributes,
};
use probemond::config::ProbemonConfig;
use probemond::connection::ConnectionState;
use probemond::monitor::{DisconnectKind, Monitor, MonitorEvent};
use probemond::router::Router;
use probemond::server::ProbeServer;
use probemond::stats::StatsHub;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const ALPHA_GRACE_MS: u64 = 100;

// ============================================================================
// Test Helpers
// ============================================================================

struct Echo {
    attributes: AttributeStore,
}

#[async_trait]
impl ProbeBehavior for Echo {
    async fn control(&self, name: &str, params: Value) -> ProbeResult<Value> {
        match name {
            "echo" => Ok(params),
            "bump" => {
                let count = self
                    .attributes
                    .get("count")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0)
                    + 1;
                self.attributes.set(attrs(json!({"count": count})));
                Ok(json!(count))
            }
            other => Err(ProbeError::NoControl(other.to_string())),
        }
    }

    fn validate(&self, changes: &Attributes) -> Result<(), String> {
        match changes.get("label") {
            Some(Value::String(label)) if label.is_empty() => Err("label must not be empty".to_string()),
            _ => Ok(()),
        }
    }
}

fn attrs(value: Value) -> Attributes {
    match value {
        Value::Object(map) => map,
        _ => Attributes::new(),
    }
}

/// Alpha: serves `Echo` with `label` writable.
struct Alpha {
    router: Router,
    port: u16,
    cancel_token: CancellationToken,
}

impl Alpha {
    async fn spawn() -> Self {
        let mut classes = ProbeClasses::new();
        classes.register_writable(
            "Echo",
            WritableAttributes::only(["label"]),
            |init: ProbeInit| -> ProbeResult<Box<dyn ProbeBehavior>> {
                Ok(Box::new(Echo {
                    attributes: init.attributes,
                }))
            },
        );
        let config = ProbemonConfig {
            app_name: "alpha".to_string(),
            release_grace_ms: ALPHA_GRACE_MS,
            ..ProbemonConfig::default()
        };
        let router = Router::new(config, classes, StatsHub::new());
        let cancel_token = CancellationToken::new();

        let server = ProbeServer::bind_addr(
            router.clone(),
            "127.0.0.1:0".parse().unwrap(),
            cancel_token.clone(),
        )
        .await
        .expect("bind alpha");
        let port = server.local_addr().unwrap().port();
        tokio::spawn(server.run());

        Self {
            router,
            port,
            cancel_token,
        }
    }

    async fn ref_count(&self) -> Option<usize> {
        self.router
            .running_probes()
            .await
            .first()
            .map(|probe| probe.ref_count)
    }

    async fn shutdown(&self) {
        self.cancel_token.cancel();
        self.router.shutdown().await;
    }
}

/// Beta: no classes, scans exactly alpha's port.
fn beta(alpha_port: u16, stats: StatsHub) -> Router {
    let config = ProbemonConfig {
        app_name: "beta".to_string(),
        service_base_port: alpha_port,
        ports_to_scan: 1,
        release_grace_ms: 0,
        connect_timeout_ms: 1_000,
        ..ProbemonConfig::default()
    };
    Router::new(config, ProbeClasses::new(), stats)
}

fn echo_params() -> MonitorParams {
    MonitorParams::class("Echo")
        .init_param("x", 1)
        .host("127.0.0.1")
        .app("alpha")
}

async fn next_change(events: &mut broadcast::Receiver<MonitorEvent>) -> Attributes {
    timeout(WAIT_TIMEOUT, async {
        loop {
            if let Ok(MonitorEvent::Change(changes)) = events.recv().await {
                return changes;
            }
        }
    })
    .await
    .expect("change should arrive")
}

async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(WAIT_TIMEOUT, async {
        while !condition().await {
            sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .expect("condition should hold");
}

// ============================================================================
// Remote Monitors
// ============================================================================

#[tokio::test]
async fn test_remote_monitor_control_and_changes() {
    let alpha = Alpha::spawn().await;
    let beta = beta(alpha.port, StatsHub::new());

    let monitor = Monitor::new(&beta, echo_params());
    let mut events = monitor.subscribe();
    monitor.connect().await.unwrap();

    assert!(matches!(events.recv().await.unwrap(), MonitorEvent::Connect));
    let initial = next_change(&mut events).await;
    assert_eq!(initial.get("x"), Some(&json!(1)));
    assert_eq!(monitor.get("x"), Some(json!(1)));
    assert_eq!(alpha.ref_count().await, Some(1));

    let echoed = monitor.control("echo", json!({"x": 1})).await.unwrap();
    assert_eq!(echoed, json!({"x": 1}));

    let missing = monitor.control("nope", Value::Null).await.unwrap_err();
    assert_eq!(missing, ProbeError::NoControl("nope".to_string()));

    assert_eq!(monitor.control("bump", Value::Null).await.unwrap(), json!(1));
    let diff = next_change(&mut events).await;
    assert_eq!(diff, attrs(json!({"count": 1})));
    assert_eq!(monitor.get("count"), Some(json!(1)));

    alpha.shutdown().await;
    beta.shutdown().await;
}

#[tokio::test]
async fn test_remote_set_forwards_writable_attributes() {
    let alpha = Alpha::spawn().await;
    let beta = beta(alpha.port, StatsHub::new());

    let monitor = Monitor::new(&beta, echo_params());
    monitor.connect().await.unwrap();
    let probe_id = monitor.probe_id().unwrap();

    monitor
        .set(attrs(json!({"label": "primary", "note": "local only"})))
        .await
        .unwrap();
    assert_eq!(monitor.get("note"), Some(json!("local only")));

    let probe = alpha.router.registry().get(&probe_id).await.unwrap();
    assert_eq!(probe.attributes().get("label"), Some(json!("primary")));
    assert_eq!(probe.attributes().get("note"), None);

    let err = monitor.set(attrs(json!({"label": ""}))).await.unwrap_err();
    assert_eq!(err.code(), Some("VALIDATION_ERROR"));
    assert_eq!(probe.attributes().get("label"), Some(json!("primary")));

    alpha.shutdown().await;
    beta.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_releases_remote_probe_after_grace() {
    let alpha = Alpha::spawn().await;
    let beta = beta(alpha.port, StatsHub::new());

    let monitor = Monitor::new(&beta, echo_params());
    monitor.connect().await.unwrap();
    assert_eq!(alpha.ref_count().await, Some(1));

    monitor.disconnect().await.unwrap();
    assert!(!monitor.is_connected());

    eventually(|| async { alpha.router.running_probes().await.is_empty() }).await;

    // Disconnect is idempotent.
    monitor.disconnect().await.unwrap();

    alpha.shutdown().await;
    beta.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_monitors_share_one_scan_and_one_reference() {
    let alpha = Alpha::spawn().await;
    let stats = StatsHub::new();
    let mut samples = stats.subscribe();
    let beta = beta(alpha.port, stats);

    let first = Monitor::new(&beta, echo_params());
    let second = Monitor::new(&beta, echo_params());
    let (a, b) = tokio::join!(first.connect(), second.connect());
    a.unwrap();
    b.unwrap();

    assert_eq!(first.probe_id(), second.probe_id());
    assert_eq!(alpha.ref_count().await, Some(1));

    let conn = beta.connections().into_iter().next().unwrap();
    assert_eq!(conn.remote_probe_refs(&first.probe_id().unwrap()), Some(2));

    let mut scans = 0;
    while let Ok(sample) = samples.try_recv() {
        if sample.path() == "router.host_scans" {
            scans += 1;
        }
    }
    assert_eq!(scans, 1);

    // One of two local references released: alpha keeps its instance.
    first.disconnect().await.unwrap();
    assert_eq!(conn.remote_probe_refs(&second.probe_id().unwrap()), Some(1));
    sleep(Duration::from_millis(ALPHA_GRACE_MS * 3)).await;
    assert_eq!(alpha.ref_count().await, Some(1));

    alpha.shutdown().await;
    beta.shutdown().await;
}

#[tokio::test]
async fn test_remote_loss_disconnects_monitor() {
    let alpha = Alpha::spawn().await;
    let beta = beta(alpha.port, StatsHub::new());

    let monitor = Monitor::new(&beta, echo_params());
    let mut events = monitor.subscribe();
    monitor.connect().await.unwrap();

    alpha.shutdown().await;

    let kind = timeout(WAIT_TIMEOUT, async {
        loop {
            if let Ok(MonitorEvent::Disconnect(kind)) = events.recv().await {
                return kind;
            }
        }
    })
    .await
    .expect("monitor should notice the loss");
    assert_eq!(kind, DisconnectKind::RemoteDisconnect);
    assert!(!monitor.is_connected());
    assert_eq!(
        monitor.control("echo", Value::Null).await.unwrap_err(),
        ProbeError::NotConnected
    );

    beta.shutdown().await;
}

#[tokio::test]
async fn test_remote_changes_arrive_in_order() {
    let alpha = Alpha::spawn().await;
    let beta = beta(alpha.port, StatsHub::new());

    let monitor = Monitor::new(&beta, echo_params());
    let mut events = monitor.subscribe();
    monitor.connect().await.unwrap();
    next_change(&mut events).await;

    let probe_id = monitor.probe_id().unwrap();
    let probe = alpha.router.registry().get(&probe_id).await.unwrap();
    probe.attributes().set(attrs(json!({"count": 1, "x": 1})));
    probe.attributes().set(attrs(json!({"count": 2})));

    assert_eq!(next_change(&mut events).await, attrs(json!({"count": 1})));
    assert_eq!(next_change(&mut events).await, attrs(json!({"count": 2})));

    alpha.shutdown().await;
    beta.shutdown().await;
}

// ============================================================================
// Discovery
// ============================================================================

#[tokio::test]
async fn test_concurrent_host_scans_are_coalesced() {
    let alpha = Alpha::spawn().await;
    let stats = StatsHub::new();
    let mut samples = stats.subscribe();
    let beta = beta(alpha.port, stats);

    tokio::join!(
        beta.add_host_connections("127.0.0.1"),
        beta.add_host_connections("127.0.0.1"),
    );

    let mut scans = 0;
    while let Ok(sample) = samples.try_recv() {
        if sample.path() == "router.host_scans" {
            scans += 1;
        }
    }
    assert_eq!(scans, 1);

    let connections = beta.connections();
    assert_eq!(connections.len(), 1);
    assert!(connections[0].is_connected());
    assert_eq!(connections[0].remote_info().unwrap().app_name, "alpha");

    // A later scan skips ports that are already connected.
    beta.add_host_connections("127.0.0.1").await;
    assert_eq!(beta.connections().len(), 1);

    alpha.shutdown().await;
    beta.shutdown().await;
}

// ============================================================================
// Routing Failures
// ============================================================================

#[tokio::test]
async fn test_unknown_app_has_no_route() {
    let alpha = Alpha::spawn().await;
    let beta = beta(alpha.port, StatsHub::new());

    let monitor = Monitor::new(
        &beta,
        MonitorParams::class("Echo").host("127.0.0.1").app("ghost"),
    );
    let mut events = monitor.subscribe();

    let err = monitor.connect().await.unwrap_err();
    assert_eq!(err, ProbeError::NoRouteToHost("127.0.0.1".to_string()));
    assert!(matches!(
        events.recv().await.unwrap(),
        MonitorEvent::Disconnect(DisconnectKind::ConnectFailed)
    ));

    alpha.shutdown().await;
    beta.shutdown().await;
}

#[tokio::test]
async fn test_remote_class_not_available() {
    let alpha = Alpha::spawn().await;
    let beta = beta(alpha.port, StatsHub::new());

    let monitor = Monitor::new(
        &beta,
        MonitorParams::class("Missing").host("127.0.0.1").app("alpha"),
    );
    let err = monitor.connect().await.unwrap_err();
    assert_eq!(err.code(), Some("PROBE_CLASS_NOT_AVAILABLE"));
    assert!(alpha.router.running_probes().await.is_empty());

    alpha.shutdown().await;
    beta.shutdown().await;
}

// ============================================================================
// Gateway Relay
// ============================================================================

#[tokio::test]
async fn test_gateway_relays_connect_control_and_changes() {
    let alpha = Alpha::spawn().await;

    // Beta scans alpha and serves gamma as its gateway.
    let beta = beta(alpha.port, StatsHub::new());
    let beta_cancel = CancellationToken::new();
    let server = ProbeServer::bind_addr(
        beta.clone(),
        "127.0.0.1:0".parse().unwrap(),
        beta_cancel.clone(),
    )
    .await
    .expect("bind beta");
    let beta_port = server.local_addr().unwrap().port();
    tokio::spawn(server.run());

    let gamma = Router::new(
        ProbemonConfig {
            app_name: "gamma".to_string(),
            release_grace_ms: 0,
            connect_timeout_ms: 1_000,
            ..ProbemonConfig::default()
        },
        ProbeClasses::new(),
        StatsHub::new(),
    );
    let gateway = gamma.set_gateway("127.0.0.1", beta_port);
    assert_eq!(gateway.wait_settled(WAIT_TIMEOUT).await, ConnectionState::Connected);

    let monitor = Monitor::new(&gamma, echo_params());
    let mut events = monitor.subscribe();
    monitor.connect().await.unwrap();

    let initial = next_change(&mut events).await;
    assert_eq!(initial.get("x"), Some(&json!(1)));
    assert_eq!(alpha.ref_count().await, Some(1));
    assert_eq!(gamma.connections().len(), 1, "gamma only talks to its gateway");

    let echoed = monitor.control("echo", json!({"x": 1})).await.unwrap();
    assert_eq!(echoed, json!({"x": 1}));

    assert_eq!(monitor.control("bump", Value::Null).await.unwrap(), json!(1));
    assert_eq!(next_change(&mut events).await, attrs(json!({"count": 1})));

    monitor.disconnect().await.unwrap();
    eventually(|| async { alpha.router.running_probes().await.is_empty() }).await;

    gamma.shutdown().await;
    beta_cancel.cancel();
    beta.shutdown().await;
    alpha.shutdown().await;
}
