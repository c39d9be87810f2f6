//! Controller host engine.
//!
//! One `Host` owns one multicast socket and a random identity, and drives
//! every exchange on the channel: sequence generation, the fixed resend
//! schedule, reply demultiplexing, discovery and reset, and group minting /
//! teardown.
//!
//! # Exchange model
//! A request is retransmitted per [`RESEND_SCHEDULE`]; replies are matched
//! by sequence number and accumulated into a map keyed by drone id (a
//! duplicate reply overwrites harmlessly). An optional expectation set both
//! tracks which drones are still awaited and triggers early exit the moment
//! it empties, so successful exchanges complete in one round trip.
//!
//! All exchanges on a host are serialized by an operation mutex: the socket
//! is the sole shared resource, and two concurrent drains would steal each
//! other's datagrams.

use crate::error::DroneError;
use crate::group::Group;
use crate::transport::MulticastTransport;
use rand::RngCore;
use rand::rngs::OsRng;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use ud_protocol::{Envelope, MAX_DATAGRAM, MULTICAST_ADDR, ResetRequest, SEQ_MODULO, msgtype};

/// Fixed resend schedule. Not a backoff policy: callers depend on the
/// ≈2.5 s worst case of a three-try exchange, so this is a frozen contract.
pub const RESEND_SCHEDULE: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(1),
];

/// Keep-alive interval for idle non-empty groups.
pub const IDLE_INTERVAL: Duration = Duration::from_secs(19);

/// Group ids are capped at 16 characters on the wire.
pub const GROUP_ID_MAX: usize = 16;

/// Caller-supplied group prefixes leave room for the 6-char host id suffix.
pub const GROUP_PREFIX_MAX: usize = GROUP_ID_MAX - 6;

/// Replies collected during an exchange, keyed by drone id.
pub type Answers = HashMap<String, Envelope>;

/// Per-drone outcome of a group request; `None` is the timeout sentinel.
pub type ReplyMap = HashMap<String, Option<Envelope>>;

/// Host construction knobs. The defaults are the fixed operational
/// constants; tests override the endpoint and the keep-alive interval.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Multicast endpoint the drones listen on.
    pub multicast_addr: SocketAddr,
    /// Local address to pin as the outgoing multicast interface.
    pub source_addr: Option<Ipv4Addr>,
    /// Idle keep-alive interval for non-empty groups.
    pub idle_interval: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            multicast_addr: SocketAddr::V4(MULTICAST_ADDR),
            source_addr: None,
            idle_interval: IDLE_INTERVAL,
        }
    }
}

/// Socket, identity and serialization shared between a host, its groups and
/// their keep-alive tasks.
pub(crate) struct HostShared {
    transport: MulticastTransport,
    hostid: String,
    uniqueid: String,
    idle_interval: Duration,
    /// Serializes exchanges; held across the waits of a single exchange,
    /// released between retransmission rounds of a group request.
    ops: tokio::sync::Mutex<()>,
}

/// A controller on the multicast channel.
pub struct Host {
    shared: Arc<HostShared>,
    groups: Mutex<Vec<Group>>,
}

impl Host {
    /// Bind the controller socket and mint a fresh identity.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(config: HostConfig) -> Result<Host, DroneError> {
        let transport = MulticastTransport::bind(config.multicast_addr, config.source_addr)?;
        let hostid = gen_hostid();
        let uniqueid = format!("Host{hostid}");
        info!(
            uniqueid = %uniqueid,
            local = %transport.local_addr()?,
            dest = %transport.dest(),
            "controller host initialized"
        );
        Ok(Host {
            shared: Arc::new(HostShared {
                transport,
                hostid,
                uniqueid,
                idle_interval: config.idle_interval,
                ops: tokio::sync::Mutex::new(()),
            }),
            groups: Mutex::new(Vec::new()),
        })
    }

    /// The full sender id, `"Host" + hostid`.
    #[must_use]
    pub fn uniqueid(&self) -> &str {
        &self.shared.uniqueid
    }

    /// The 6-hex-char host token appended to group prefixes.
    #[must_use]
    pub fn hostid(&self) -> &str {
        &self.shared.hostid
    }

    /// Draw a fresh sequence number.
    #[must_use]
    pub fn genseq(&self) -> u32 {
        self.shared.genseq()
    }

    /// Encode and emit a single datagram. No acknowledgement, no retry.
    pub async fn send(
        &self,
        to: &str,
        seq: u32,
        msgtype: &str,
        data: Option<&Value>,
    ) -> Result<(), DroneError> {
        self.shared.send(to, seq, msgtype, data).await
    }

    /// Drain one envelope matching the filters, if one is already queued.
    ///
    /// Non-matching datagrams (addressed elsewhere, wrong sequence, wrong
    /// type, undecodable) are consumed and silently discarded.
    pub async fn recv(
        &self,
        seq: Option<u32>,
        resptype: Option<&str>,
    ) -> Result<Option<Envelope>, DroneError> {
        let _ops = self.shared.ops.lock().await;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        self.shared.drain_one(&mut buf, seq, resptype)
    }

    /// Collect matching replies into `answers` until `timeout` elapses or
    /// `expect` empties. See [`HostShared::recv_until_locked`] semantics.
    pub async fn recv_until(
        &self,
        answers: &mut Answers,
        seq: u32,
        resptype: Option<&str>,
        timeout: Duration,
        expect: Option<&mut HashSet<String>>,
    ) -> Result<(), DroneError> {
        self.shared
            .recv_until(answers, seq, resptype, timeout, expect)
            .await
    }

    /// Single-recipient retransmission loop over [`RESEND_SCHEDULE`].
    pub async fn call(
        &self,
        to: &str,
        seq: Option<u32>,
        msgtype: &str,
        data: Option<&Value>,
        resptype: Option<&str>,
        expect: Option<&mut HashSet<String>>,
    ) -> Result<Answers, DroneError> {
        self.shared
            .call(to, seq, msgtype, data, resptype, expect)
            .await
    }

    /// Like [`Host::call`] but unicast-fanned to every id in `nodes`, which
    /// doubles as the expectation set and is pruned as replies arrive.
    pub async fn call_multi(
        &self,
        nodes: &mut HashSet<String>,
        seq: Option<u32>,
        msgtype: &str,
        data: Option<&Value>,
        resptype: Option<&str>,
    ) -> Result<Answers, DroneError> {
        self.shared
            .call_multi(nodes, seq, msgtype, data, resptype)
            .await
    }

    /// Discover drones answering to `group`, in arrival order.
    ///
    /// `need == Some(0)` degenerates to a single send with no wait (the
    /// keep-alive ping). Otherwise the resend schedule is walked collecting
    /// `status` replies, stopping at a schedule boundary once `need` distinct
    /// drones have answered. `board` is forwarded as the payload so only
    /// matching hardware answers.
    pub async fn whois(
        &self,
        group: &str,
        need: Option<usize>,
        seq: Option<u32>,
        board: Option<&Value>,
    ) -> Result<Vec<String>, DroneError> {
        self.shared.whois(group, need, seq, board).await
    }

    /// Send `!reset` to a drone or group and collect `status` replies.
    /// `how = "system"` requests a reboot.
    pub async fn reset(
        &self,
        whom: &str,
        how: Option<&str>,
        expect: Option<&mut HashSet<String>>,
    ) -> Result<Answers, DroneError> {
        self.shared.reset(whom, how, expect).await
    }

    /// Mint a group from a caller prefix; the 6-char host id is appended so
    /// concurrent controllers never collide on a group id.
    pub fn group(&self, prefix: &str) -> Result<Group, DroneError> {
        if prefix.len() > GROUP_PREFIX_MAX {
            return Err(DroneError::InvalidGroupId(format!(
                "prefix '{prefix}' longer than {GROUP_PREFIX_MAX} chars"
            )));
        }
        self.group_absolute(&format!("{prefix}{}", self.shared.hostid))
    }

    /// Mint a group with a verbatim id (no host suffix).
    pub fn group_absolute(&self, groupid: &str) -> Result<Group, DroneError> {
        if groupid.len() > GROUP_ID_MAX {
            return Err(DroneError::InvalidGroupId(format!(
                "'{groupid}' longer than {GROUP_ID_MAX} chars"
            )));
        }
        let group = Group::new(Arc::clone(&self.shared), groupid.to_owned());
        self.groups
            .lock()
            .expect("group registry poisoned")
            .push(group.clone());
        Ok(group)
    }

    /// Best-effort teardown: reset every minted group, swallowing per-group
    /// failures. Idempotent; safe to call again on exit paths.
    pub async fn disband(&self, how: Option<&str>) {
        let groups: Vec<Group> = {
            let mut registry = self.groups.lock().expect("group registry poisoned");
            std::mem::take(&mut *registry)
        };
        for group in &groups {
            if let Err(e) = group.reset(how).await {
                warn!(group = %group.id(), error = %e, "disband: reset failed");
            }
        }
    }
}

impl HostShared {
    pub(crate) fn idle_interval(&self) -> Duration {
        self.idle_interval
    }

    /// Fresh random sequence in `[0, SEQ_MODULO)`, from the OS entropy
    /// source so concurrent controllers cannot collide by seeding.
    pub(crate) fn genseq(&self) -> u32 {
        OsRng.next_u32() % SEQ_MODULO
    }

    pub(crate) async fn send(
        &self,
        to: &str,
        seq: u32,
        msgtype: &str,
        data: Option<&Value>,
    ) -> Result<(), DroneError> {
        let env = Envelope {
            from: self.uniqueid.clone(),
            to: to.to_owned(),
            msgtype: msgtype.to_owned(),
            seq,
            data: data.cloned(),
        };
        let bytes = env.encode()?;
        debug!(to, msgtype, seq, "send");
        self.transport.send(&bytes).await?;
        Ok(())
    }

    /// Drain datagrams until one passes the filter or the queue empties.
    ///
    /// Filter: well-formed envelope, addressed to this host, matching
    /// `resptype` and `seq` when given. Everything else is consumed and
    /// dropped — including replies to exchanges that already completed and
    /// keep-alive echoes.
    fn drain_one(
        &self,
        buf: &mut [u8],
        seq: Option<u32>,
        resptype: Option<&str>,
    ) -> Result<Option<Envelope>, DroneError> {
        loop {
            let Some(len) = self.transport.try_recv(buf)? else {
                return Ok(None);
            };
            let Ok(env) = Envelope::decode(&buf[..len]) else {
                trace!(len, "discarding undecodable datagram");
                continue;
            };
            if !env.is_wellformed() || env.to != self.uniqueid {
                continue;
            }
            if resptype.is_some_and(|want| env.msgtype != want) {
                continue;
            }
            if seq.is_some_and(|want| env.seq != want) {
                trace!(from = %env.from, seq = env.seq, "discarding mismatched sequence");
                continue;
            }
            debug!(from = %env.from, msgtype = %env.msgtype, seq = env.seq, "recv");
            return Ok(Some(env));
        }
    }

    pub(crate) async fn recv_until(
        &self,
        answers: &mut Answers,
        seq: u32,
        resptype: Option<&str>,
        timeout: Duration,
        expect: Option<&mut HashSet<String>>,
    ) -> Result<(), DroneError> {
        let _ops = self.ops.lock().await;
        self.recv_until_locked(answers, seq, resptype, timeout, expect)
            .await
    }

    /// Until `timeout` elapses or `expect` empties: wait for readiness, then
    /// drain every matching envelope, recording each under its sender and
    /// pruning the sender from `expect`.
    async fn recv_until_locked(
        &self,
        answers: &mut Answers,
        seq: u32,
        resptype: Option<&str>,
        timeout: Duration,
        mut expect: Option<&mut HashSet<String>>,
    ) -> Result<(), DroneError> {
        debug!(seq, timeout_ms = timeout.as_millis() as u64, expecting = ?expect.as_deref(), "collecting replies");
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            if expect.as_deref().is_some_and(HashSet::is_empty) {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if !self.transport.readable(deadline - now).await? {
                break;
            }
            while let Some(env) = self.drain_one(&mut buf, Some(seq), resptype)? {
                if let Some(exp) = expect.as_deref_mut() {
                    exp.remove(&env.from);
                }
                answers.insert(env.from.clone(), env);
            }
        }
        Ok(())
    }

    pub(crate) async fn call(
        &self,
        to: &str,
        seq: Option<u32>,
        msgtype: &str,
        data: Option<&Value>,
        resptype: Option<&str>,
        mut expect: Option<&mut HashSet<String>>,
    ) -> Result<Answers, DroneError> {
        let _ops = self.ops.lock().await;
        let seq = seq.unwrap_or_else(|| self.genseq());
        let mut answers = Answers::new();
        for timeout in RESEND_SCHEDULE {
            self.send(to, seq, msgtype, data).await?;
            self.recv_until_locked(&mut answers, seq, resptype, timeout, expect.as_deref_mut())
                .await?;
            if expect.as_deref().is_some_and(HashSet::is_empty) {
                break;
            }
        }
        Ok(answers)
    }

    pub(crate) async fn call_multi(
        &self,
        nodes: &mut HashSet<String>,
        seq: Option<u32>,
        msgtype: &str,
        data: Option<&Value>,
        resptype: Option<&str>,
    ) -> Result<Answers, DroneError> {
        let _ops = self.ops.lock().await;
        let seq = seq.unwrap_or_else(|| self.genseq());
        let mut answers = Answers::new();
        for timeout in RESEND_SCHEDULE {
            for node in nodes.iter() {
                self.send(node, seq, msgtype, data).await?;
            }
            self.recv_until_locked(&mut answers, seq, resptype, timeout, Some(nodes))
                .await?;
            if nodes.is_empty() {
                break;
            }
        }
        Ok(answers)
    }

    pub(crate) async fn whois(
        &self,
        group: &str,
        need: Option<usize>,
        seq: Option<u32>,
        board: Option<&Value>,
    ) -> Result<Vec<String>, DroneError> {
        let _ops = self.ops.lock().await;
        let seq = seq.unwrap_or_else(|| self.genseq());
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut found: Vec<String> = Vec::new();
        for timeout in RESEND_SCHEDULE {
            self.send(group, seq, msgtype::WHOIS, board).await?;
            if need == Some(0) {
                break;
            }
            // Full per-step wait; `need` is only re-evaluated at schedule
            // boundaries so discovery latency stays predictable.
            let deadline = Instant::now() + timeout;
            loop {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                if !self.transport.readable(deadline - now).await? {
                    break;
                }
                while let Some(env) =
                    self.drain_one(&mut buf, Some(seq), Some(msgtype::STATUS))?
                {
                    if !found.contains(&env.from) {
                        found.push(env.from);
                    }
                }
            }
            if need.is_some_and(|n| n > 0 && found.len() >= n) {
                break;
            }
        }
        Ok(found)
    }

    pub(crate) async fn reset(
        &self,
        whom: &str,
        how: Option<&str>,
        expect: Option<&mut HashSet<String>>,
    ) -> Result<Answers, DroneError> {
        let data = how.map(|how| {
            ResetRequest {
                how: Some(how.to_owned()),
            }
            .to_value()
        });
        self.call(
            whom,
            None,
            msgtype::RESET,
            data.as_ref(),
            Some(msgtype::STATUS),
            expect,
        )
        .await
    }
}

/// 6 hex chars from 3 bytes of OS entropy.
fn gen_hostid() -> String {
    let mut bytes = [0u8; 3];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
