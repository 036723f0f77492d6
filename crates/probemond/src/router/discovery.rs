//! Host discovery by scanning the service port window.
//!
//! Concurrent scans of the same host are coalesced: the first caller dials,
//! later callers wait for it to finish and then re-run their own lookup.

use tokio::sync::oneshot;
use tracing::{debug, info};

use super::Router;
use crate::connection::{Connection, ConnectionState, Endpoint};

/// Wakes the waiters of a scan when it ends, even if the scanning future
/// is dropped.
struct ScanGuard<'a> {
    router: &'a Router,
    host: &'a str,
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        let waiters = self
            .router
            .state()
            .host_scans
            .remove(self.host)
            .unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }
}

impl Router {
    /// Dials every port of the service window on `host` that has no live
    /// connection yet, and waits until each attempt settles.
    pub async fn add_host_connections(&self, host: &str) {
        let waiter = {
            let mut state = self.state();
            match state.host_scans.get_mut(host) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    state.host_scans.insert(host.to_string(), Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            debug!(host, "Joining in-flight host scan");
            let _ = rx.await;
            return;
        }

        let _finish = ScanGuard { router: self, host };
        self.scan_host(host).await;
    }

    async fn scan_host(&self, host: &str) {
        self.stats().increment("router", "host_scans");

        let connected: Vec<u16> = self
            .connections()
            .iter()
            .filter(|c| !c.is_disconnected())
            .filter_map(|c| c.endpoint())
            .filter(|e| e.host.eq_ignore_ascii_case(host))
            .map(|e| e.port)
            .collect();

        let trials: Vec<_> = self
            .config()
            .service_ports()
            .filter(|port| !connected.contains(port))
            .map(|port| {
                let conn = Connection::dial(self, Endpoint::new(host, port), false);
                self.add_connection(conn.clone());
                conn
            })
            .collect();

        // Dials run concurrently.
        let limit = self.settle_timeout();
        let mut reached = 0;
        for conn in &trials {
            if conn.wait_settled(limit).await == ConnectionState::Connected {
                reached += 1;
            }
        }

        info!(host, dialed = trials.len(), reached, "Host scan finished");
    }
}
