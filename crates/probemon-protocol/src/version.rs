//! Wire protocol revision carried in every `connection:info`.
//!
//! Two peers can talk when they share a major revision. Within a major,
//! the session runs at the lower minor of the two, so a newer peer knows
//! which additive features the other side understands.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire protocol revision of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// Revision spoken by this build.
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// True if a peer announcing `peer` can share a session with us.
    pub fn is_compatible_with(&self, peer: &ProtocolVersion) -> bool {
        self.major == peer.major
    }

    /// The revision a session with `peer` runs at, or `None` when the
    /// majors differ and the connection must be dropped.
    pub fn negotiate(&self, peer: &ProtocolVersion) -> Option<ProtocolVersion> {
        self.is_compatible_with(peer)
            .then(|| ProtocolVersion::new(self.major, self.minor.min(peer.minor)))
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newer_minor_peer_runs_at_our_minor() {
        let ours = ProtocolVersion::new(1, 2);
        let peer = ProtocolVersion::new(1, 5);

        assert_eq!(ours.negotiate(&peer), Some(ProtocolVersion::new(1, 2)));
        assert_eq!(peer.negotiate(&ours), Some(ProtocolVersion::new(1, 2)));
    }

    #[test]
    fn test_major_mismatch_refuses_session() {
        let ours = ProtocolVersion::CURRENT;
        let peer = ProtocolVersion::new(ours.major + 1, 0);

        assert!(!ours.is_compatible_with(&peer));
        assert_eq!(ours.negotiate(&peer), None);
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(ProtocolVersion::new(1, 0)).unwrap();
        assert_eq!(json, serde_json::json!({"major": 1, "minor": 0}));
        assert_eq!(ProtocolVersion::new(3, 7).to_string(), "3.7");
    }
}
