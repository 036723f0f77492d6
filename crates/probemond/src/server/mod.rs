//! TCP server accepting peer connections.
//!
//! The server binds the first free port of the service window and hands
//! every accepted socket to the [`Router`] as an inbound [`Connection`].
//!
//! ```text
//! ┌─────────────────┐
//! │   ProbeServer   │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐      ┌─────────────────┐
//! │   Connection    │─────▶│     Router      │
//! │  (per peer)     │      │ add_connection  │
//! └─────────────────┘      └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged and the loop continues

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use probemon_core::ProbeError;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::connection::Connection;
use crate::router::Router;

/// Listener for inbound peer connections.
pub struct ProbeServer {
    listener: TcpListener,
    router: Router,
    cancel_token: CancellationToken,
}

impl ProbeServer {
    /// Binds the first free port of the configured service window.
    ///
    /// Listens on loopback unless `allow_external_connections` is set.
    pub async fn bind(router: Router, cancel_token: CancellationToken) -> Result<Self, ServerError> {
        let config = router.config();
        let ip = if config.allow_external_connections {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };

        for port in config.service_ports() {
            match TcpListener::bind(SocketAddr::new(ip, port)).await {
                Ok(listener) => return Ok(Self::with_listener(listener, router, cancel_token)),
                Err(e) if e.kind() == ErrorKind::AddrInUse => {
                    debug!(port, "Port in use, trying next");
                }
                Err(e) => {
                    return Err(ServerError::Bind {
                        addr: SocketAddr::new(ip, port),
                        error: e.to_string(),
                    })
                }
            }
        }

        Err(ServerError::AllPortsInUse {
            base: config.service_base_port,
            count: config.ports_to_scan,
        })
    }

    /// Binds an explicit address (port 0 picks an ephemeral port).
    pub async fn bind_addr(
        router: Router,
        addr: SocketAddr,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr,
                error: e.to_string(),
            })?;
        Ok(Self::with_listener(listener, router, cancel_token))
    }

    fn with_listener(listener: TcpListener, router: Router, cancel_token: CancellationToken) -> Self {
        Self {
            listener,
            router,
            cancel_token,
        }
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(|e| ServerError::Bind {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            error: e.to_string(),
        })
    }

    /// Accepts connections until the cancellation token is triggered.
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "Probe server listening");
        }

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let conn = Connection::accept(&self.router, stream, self.router.firewall());
                        debug!(connection = conn.id(), %peer, firewall = conn.firewall(), "Accepted connection");
                        self.router.add_connection(conn);
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },

    #[error("All ports in use (base port {base}, {count} ports)")]
    AllPortsInUse { base: u16, count: u16 },
}

impl From<ServerError> for ProbeError {
    fn from(e: ServerError) -> Self {
        match e {
            ServerError::AllPortsInUse { base, count } => ProbeError::AllPortsInUse { base, count },
            other => ProbeError::Connection(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbemonConfig;
    use crate::stats::StatsHub;
    use probemon_core::ProbeClasses;

    fn router(base: u16, count: u16) -> Router {
        let config = ProbemonConfig {
            service_base_port: base,
            ports_to_scan: count,
            ..ProbemonConfig::default()
        };
        Router::new(config, ProbeClasses::new(), StatsHub::new())
    }

    #[tokio::test]
    async fn test_all_ports_in_use() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let result = ProbeServer::bind(router(port, 1), CancellationToken::new()).await;
        match result {
            Err(ServerError::AllPortsInUse { base, count }) => {
                assert_eq!(base, port);
                assert_eq!(count, 1);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("bound a port that is taken"),
        }
    }

    #[test]
    fn test_all_ports_error_code() {
        let err: ProbeError = ServerError::AllPortsInUse { base: 1, count: 2 }.into();
        assert_eq!(err.code(), Some("ALL_PORTS_IN_USE"));
    }
}
