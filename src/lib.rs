// udrone: Multicast drone fleet controller.
//
// Facade over the workspace crates: test harnesses depend on this crate and
// drive `Host`/`Group` directly; the wire types live under `protocol`.

pub use controller::{
    Answers, DEFAULT_CALL_TIMEOUT, DroneError, GROUP_ID_MAX, GROUP_PREFIX_MAX, Group, Host,
    HostConfig, IDLE_INTERVAL, RECV_CEILING, RESEND_SCHEDULE, ReplyMap,
};
pub use ud_protocol as protocol;
