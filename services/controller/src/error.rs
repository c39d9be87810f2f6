//! Engine error taxonomy surfaced to callers.
//!
//! Wire-codec failures on *receive* never appear here — an undecodable
//! datagram is discarded by the receive filter. Everything below reports a
//! condition the caller has to act on.

use thiserror::Error;

/// Errors raised by host and group operations.
#[derive(Debug, Error)]
pub enum DroneError {
    /// Fewer drones available than required, or an operation on an empty
    /// group.
    #[error("drone not found: {0}")]
    NotFound(String),

    /// One or more expected drones did not reply within the overall timeout.
    #[error("drones not reachable: {0:?}")]
    NotReachable(Vec<String>),

    /// A reply was received but indicated failure: a drone-side error code,
    /// an unsupported command, or a malformed status payload.
    #[error("drone {drone} failed with code {code}: {}", .errstr.as_deref().unwrap_or("no detail"))]
    Runtime {
        code: i32,
        errstr: Option<String>,
        drone: String,
    },

    /// A reply arrived from a drone outside the group's membership.
    #[error("unexpected reply from non-member drones: {0:?}")]
    Conflict(Vec<String>),

    /// Group id (or prefix) exceeds the protocol length limits.
    #[error("invalid group id: {0}")]
    InvalidGroupId(String),

    /// Socket-level failure. Would-block is never surfaced this way; it just
    /// ends the current drain.
    #[error("socket: {0}")]
    Io(#[from] std::io::Error),

    /// Outbound payload could not be serialized.
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
}
