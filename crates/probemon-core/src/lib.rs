//! probemon Core - Shared types for remotely observable probes
//!
//! This crate provides the domain types shared between the runtime
//! (probemond), the wire protocol and probe implementations:
//! - attribute stores with change propagation
//! - probe ids, canonical probe keys and monitor parameters
//! - the `Probe` base type and the `ProbeBehavior`/`ProbeFactory` contract
//! - the error taxonomy and the event-name pattern matcher
//!
//! Production code follows the panic-free policy: no `.unwrap()`,
//! `.expect()`, `panic!()`, `unreachable!()` or `todo!()`.

pub mod attributes;
pub mod class;
pub mod error;
pub mod key;
pub mod pattern;
pub mod probe;

// Re-exports for convenience
pub use attributes::{changed_since, AttributeStore, Attributes, WritableAttributes, ID_ATTRIBUTE};
pub use class::{ProbeClasses, ProbeFactory};
pub use error::{ProbeError, ProbeResult};
pub use key::{MonitorParams, ProbeId, ProbeKey};
pub use pattern::{compile, PatternError, PatternMatcher};
pub use probe::{Probe, ProbeBehavior, ProbeInit, PING_CONTROL, SET_CONTROL};

/// Re-exported so probe implementations need no direct dependency.
pub use async_trait::async_trait;
