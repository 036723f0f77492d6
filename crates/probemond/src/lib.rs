//! probemond - Probe runtime: registry, routing, peer connections and server
//!
//! This crate provides the runtime side of probemon:
//! - `registry` - Local probe registry actor (sharing, ref counts, grace release)
//! - `router` - Resolution of monitor requests to local or remote probes
//! - `connection` - Peer sessions over TCP with newline-delimited JSON frames
//! - `monitor` - Client-side attribute mirrors of probes
//! - `server` - TCP listener accepting peer connections
//! - `probes` - Built-in `Stat` and `Process` probe classes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      probemon process                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────┐      ┌─────────────┐     ┌──────────────┐  │
//! │  │   Monitor   │─────▶│   Router    │────▶│ RegistryActor│  │
//! │  └─────────────┘      └──────┬──────┘     │ (local probes│  │
//! │                              │            └──────────────┘  │
//! │  ┌─────────────┐             │ remote                       │
//! │  │ ProbeServer │──accept──▶ Connection ◀──dial── discovery  │
//! │  └─────────────┘             │                              │
//! └──────────────────────────────┼──────────────────────────────┘
//!                                ▼ TCP (peer processes)
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod connection;
pub mod identity;
pub mod monitor;
pub mod probes;
pub mod registry;
pub mod router;
pub mod server;
pub mod stats;
