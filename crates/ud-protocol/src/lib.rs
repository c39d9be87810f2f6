// ud-protocol: Drone control wire protocol types and serialization.
//
// Every datagram on the multicast channel is one flat JSON envelope with a
// frozen top-level field set: `from`, `to`, `type`, `seq`, optional `data`.
// Payloads stay dynamic (`serde_json::Value`); only the reserved-command
// layer applies typed schemas.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::{Ipv4Addr, SocketAddrV4};

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

/// The multicast group all drones join.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 6, 6, 6);

/// The UDP port drones listen on.
pub const MULTICAST_PORT: u16 = 21337;

/// Fixed multicast endpoint all drones listen on.
pub const MULTICAST_ADDR: SocketAddrV4 = SocketAddrV4::new(MULTICAST_GROUP, MULTICAST_PORT);

/// Datagram ceiling; anything longer is discarded on receive.
pub const MAX_DATAGRAM: usize = 32 * 1024;

/// Sequence numbers live in `[0, SEQ_MODULO)`.
///
/// The headroom below `u32::MAX` lets a group's monotone counter increment
/// far past its random starting point without wrapping before the group is
/// recreated.
pub const SEQ_MODULO: u32 = 2_000_000_000;

/// Reserved group id addressing every idle (unassigned) drone.
pub const GROUP_DEFAULT: &str = "!all-default";

/// Message type names. A leading `!` marks a protocol-reserved command;
/// everything else is application-defined.
pub mod msgtype {
    /// Discovery probe; doubles as the keep-alive ping when no reply is
    /// awaited.
    pub const WHOIS: &str = "!whois";
    /// Membership request; payload is [`AssignRequest`](crate::AssignRequest).
    pub const ASSIGN: &str = "!assign";
    /// Leave group / clear state; payload is [`ResetRequest`](crate::ResetRequest).
    pub const RESET: &str = "!reset";
    /// Terminal reply; payload is [`StatusData`](crate::StatusData).
    pub const STATUS: &str = "status";
    /// Non-terminal acknowledgement: in progress, keep waiting.
    pub const ACCEPT: &str = "accept";
    /// Terminal reply: the drone does not know the command.
    pub const UNSUPPORTED: &str = "unsupported";
}

/// Whether a message type name is protocol-reserved.
#[must_use]
pub fn is_reserved(msgtype: &str) -> bool {
    msgtype.starts_with('!')
}

/// Numeric codes carried by drone runtime errors.
///
/// Drone-side `status.code` values share the namespace, so the
/// controller-assigned codes reuse the conventional errno numbers.
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EPROTO: i32 = 71;
    pub const EOPNOTSUPP: i32 = 95;
    pub const ETIMEDOUT: i32 = 110;
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The wire message: one UDP datagram, compact JSON.
///
/// Replies MUST echo the `seq` of the request they answer; the receive path
/// matches replies to exchanges by sequence alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender id: a drone id, or `"Host" + hostid` for a controller.
    pub from: String,
    /// Recipient id: a drone id or a group id.
    pub to: String,
    /// Command or reply kind.
    #[serde(rename = "type")]
    pub msgtype: String,
    /// Exchange sequence number.
    pub seq: u32,
    /// Opaque payload; omitted from the wire when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    /// Serialize to compact JSON (no insignificant whitespace).
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parse an envelope from raw datagram bytes.
    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Structural validity: both identity fields and the type are non-empty.
    /// Datagrams failing this are discarded by the receive filter.
    #[must_use]
    pub fn is_wellformed(&self) -> bool {
        !self.from.is_empty() && !self.to.is_empty() && !self.msgtype.is_empty()
    }

    /// Parse the payload of a `status` reply.
    ///
    /// `None` when this is not a `status` message or the payload does not
    /// conform to [`StatusData`] -- callers map that to a protocol error or
    /// ignore it, depending on context.
    #[must_use]
    pub fn status(&self) -> Option<StatusData> {
        if self.msgtype != msgtype::STATUS {
            return None;
        }
        StatusData::from_value(self.data.as_ref()?)
    }
}

// ---------------------------------------------------------------------------
// Reserved-command payload schemas
// ---------------------------------------------------------------------------

/// Payload of `!assign`: invite a drone into a group.
///
/// `seq` is the group's current counter value, NOT the envelope sequence;
/// the drone stores it so later group requests can be sequence-checked on
/// the drone side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignRequest {
    pub group: String,
    pub seq: u32,
}

/// Payload of `!reset`. `how = "system"` requests a full reboot instead of
/// just clearing group state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub how: Option<String>,
}

/// Payload of a terminal `status` reply. `code == 0` is success; anything
/// else is the drone-side error code, optionally explained by `errstr`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusData {
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errstr: Option<String>,
}

impl AssignRequest {
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::json!({ "group": self.group, "seq": self.seq })
    }
}

impl ResetRequest {
    #[must_use]
    pub fn to_value(&self) -> Value {
        match &self.how {
            Some(how) => serde_json::json!({ "how": how }),
            None => serde_json::json!({}),
        }
    }
}

impl StatusData {
    /// Success payload, `{"code": 0}`.
    #[must_use]
    pub fn ok() -> Self {
        StatusData {
            code: 0,
            errstr: None,
        }
    }

    #[must_use]
    pub fn error(code: i32, errstr: &str) -> Self {
        StatusData {
            code,
            errstr: Some(errstr.to_owned()),
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        match &self.errstr {
            Some(errstr) => serde_json::json!({ "code": self.code, "errstr": errstr }),
            None => serde_json::json!({ "code": self.code }),
        }
    }

    /// Strict parse; `None` on any structural mismatch (missing `code`,
    /// non-integer `code`, non-object payload).
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}
