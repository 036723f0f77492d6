//! Local probe registry using the Actor pattern.
//!
//! The registry guarantees one live instance per canonical probe key,
//! counts references, and releases instances after a grace window with no
//! references.
//!
//! ```text
//! ┌──────────────────┐ RegistryCommand ┌──────────────────┐ RegistryEvent
//! │ Router /         │────────────────▶│  RegistryActor   │──────────────▶ subscribers
//! │ Connection       │   (mpsc)        │  by_key, by_id   │  (broadcast)
//! └──────────────────┘                 └────────┬─────────┘
//!                                   init tasks  │  grace timers
//!                                   (Started)   ▼  (ReleaseIfIdle)
//!                                        loopback (weak sender)
//! ```

use std::time::Duration;

use probemon_core::ProbeClasses;
use tokio::sync::{broadcast, mpsc};

mod actor;
mod commands;
mod handle;

pub use actor::RegistryActor;
pub use commands::{RegistryCommand, RegistryEvent, RunningProbeInfo};
pub use handle::ProbeRegistryHandle;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 100;

/// Spawns the registry actor and returns a handle to it.
///
/// The actor stops (releasing what is still running) once every handle is
/// dropped.
///
/// ```no_run
/// use std::time::Duration;
/// use probemon_core::ProbeClasses;
/// use probemond::registry::spawn_registry;
///
/// #[tokio::main]
/// async fn main() {
///     let handle = spawn_registry(ProbeClasses::new(), Duration::from_secs(10));
///     let running = handle.list().await;
/// }
/// ```
pub fn spawn_registry(classes: ProbeClasses, grace: Duration) -> ProbeRegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = RegistryActor::new(cmd_rx, cmd_tx.downgrade(), classes, grace, event_tx.clone());
    tokio::spawn(actor.run());

    ProbeRegistryHandle::new(cmd_tx, event_tx)
}
