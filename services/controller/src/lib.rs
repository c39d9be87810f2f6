// controller: Multicast drone fleet controller engine.
// Exposes modules for integration testing.

pub mod config;
pub mod error;
pub mod group;
pub mod host;
pub mod transport;

pub use error::DroneError;
pub use group::{DEFAULT_CALL_TIMEOUT, Group, RECV_CEILING};
pub use host::{
    Answers, GROUP_ID_MAX, GROUP_PREFIX_MAX, Host, HostConfig, IDLE_INTERVAL, RESEND_SCHEDULE,
    ReplyMap,
};
