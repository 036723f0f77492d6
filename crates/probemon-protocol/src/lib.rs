//! probemon Protocol - Wire protocol for peer connections
//!
//! This crate provides the frame types, event names and typed payloads
//! exchanged between probemon processes, plus newline-delimited JSON
//! framing.

pub mod codec;
pub mod message;
pub mod version;

pub use codec::{decode, encode, FrameError, MAX_FRAME_SIZE};
pub use message::{
    ack_outcome, probe_change_event, ConnectionInfo, Frame, ProbeConnectRequest,
    ProbeConnectResponse, ProbeControlRequest, ProbeDisconnectRequest, WireError,
    CONNECTION_INFO, CONNECTION_PING, CONNECTION_PONG, PROBE_CHANGE_PREFIX, PROBE_CONNECT,
    PROBE_CONTROL, PROBE_DISCONNECT,
};
pub use version::ProtocolVersion;
