//! Group membership and fan-out requests.
//!
//! A `Group` names a set of drones engaged to this controller and carries
//! the monotone sequence counter for their application requests. Reserved
//! (`!`-prefixed) commands draw fresh random sequences from the host instead
//! and never advance the counter.
//!
//! Every non-empty group emits a periodic no-reply `!whois` to itself so the
//! drones' session state does not expire while the controller is quiet; any
//! foreground request pushes that deadline forward.

use crate::error::DroneError;
use crate::host::{Answers, HostShared, ReplyMap};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use ud_protocol::{AssignRequest, GROUP_DEFAULT, errno, is_reserved, msgtype};

/// Default overall timeout for group requests.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Listen-only iterations of a request never wait longer than this before
/// re-evaluating the pending set.
pub const RECV_CEILING: Duration = Duration::from_secs(10);

/// Mutable group state, shared with the keep-alive task.
struct GroupState {
    members: HashSet<String>,
    seq: u32,
    idle_deadline: Instant,
}

/// A named, host-scoped collection of drones.
///
/// Handles are cheap clones over shared state; the host keeps one for
/// teardown, the caller keeps the rest. The keep-alive task exits when the
/// last handle is dropped.
#[derive(Clone)]
pub struct Group {
    host: Arc<HostShared>,
    groupid: String,
    state: Arc<Mutex<GroupState>>,
}

impl Group {
    pub(crate) fn new(host: Arc<HostShared>, groupid: String) -> Group {
        let state = Arc::new(Mutex::new(GroupState {
            members: HashSet::new(),
            seq: host.genseq(),
            idle_deadline: Instant::now() + host.idle_interval(),
        }));
        spawn_keepalive(Arc::clone(&host), groupid.clone(), Arc::downgrade(&state));
        debug!(group = %groupid, "group created");
        Group {
            host,
            groupid,
            state,
        }
    }

    /// The wire group id (prefix + host suffix, or the absolute id).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.groupid
    }

    /// Snapshot of the current membership.
    #[must_use]
    pub fn members(&self) -> HashSet<String> {
        self.lock_state().members.clone()
    }

    /// Acquire between `min` and `max` members from the idle pool.
    ///
    /// `min` defaults to `max` (or 1 when `max == 0`, so a bare
    /// `assign(0, None, None)` fails loudly instead of silently doing
    /// nothing). Discovery runs once, engagement follows; a shortfall gets
    /// one more discovery round (without board selection). If the group is
    /// still short, every drone engaged by this call is reset back to the
    /// idle pool and the call fails with [`DroneError::NotFound`].
    ///
    /// `board` restricts discovery to drones of that hardware type.
    pub async fn assign(
        &self,
        max: usize,
        min: Option<usize>,
        board: Option<&Value>,
    ) -> Result<Vec<String>, DroneError> {
        let min = min.unwrap_or(if max > 0 { max } else { 1 });
        let avail: Vec<String> = self
            .host
            .whois(GROUP_DEFAULT, Some(max), None, board)
            .await?
            .into_iter()
            .take(max)
            .collect();
        if avail.len() < min {
            return Err(DroneError::NotFound(format!(
                "not enough idle drones (need {min}, found {})",
                avail.len()
            )));
        }
        let mut engaged = self.engage(&avail).await?;
        if engaged.len() < min {
            let shortfall = max - engaged.len();
            let more: Vec<String> = self
                .host
                .whois(GROUP_DEFAULT, Some(shortfall), None, None)
                .await?
                .into_iter()
                .take(shortfall)
                .collect();
            engaged.extend(self.engage(&more).await?);
        }
        if engaged.len() < min {
            if !engaged.is_empty() {
                // Roll back: return partial engagements to the idle pool.
                debug!(group = %self.groupid, rollback = ?engaged, "assign shortfall, rolling back");
                let mut expect: HashSet<String> = engaged.iter().cloned().collect();
                self.host
                    .call_multi(
                        &mut expect,
                        None,
                        msgtype::RESET,
                        None,
                        Some(msgtype::STATUS),
                    )
                    .await?;
                let mut st = self.lock_state();
                for drone in &engaged {
                    st.members.remove(drone);
                }
            }
            return Err(DroneError::NotFound(format!(
                "not enough idle drones (need {min}, engaged {})",
                engaged.len()
            )));
        }
        Ok(engaged)
    }

    /// Invite the given drones into this group via `!assign`.
    ///
    /// A drone becomes a member iff its `status` reply carries `code == 0`;
    /// everything else (refusal, malformed payload, silence) just leaves it
    /// out. Returns the newly engaged ids.
    pub async fn engage(&self, nodes: &[String]) -> Result<Vec<String>, DroneError> {
        let payload = AssignRequest {
            group: self.groupid.clone(),
            seq: self.lock_state().seq,
        }
        .to_value();
        let mut expect: HashSet<String> = nodes.iter().cloned().collect();
        let answers = self
            .host
            .call_multi(
                &mut expect,
                None,
                msgtype::ASSIGN,
                Some(&payload),
                Some(msgtype::STATUS),
            )
            .await?;
        let engaged: Vec<String> = answers
            .iter()
            .filter(|(_, env)| env.status().is_some_and(|s| s.code == 0))
            .map(|(drone, _)| drone.clone())
            .collect();
        self.lock_state().members.extend(engaged.iter().cloned());
        debug!(group = %self.groupid, engaged = ?engaged, "engagement complete");
        Ok(engaged)
    }

    /// Fan a request out to every member and gather per-drone outcomes.
    ///
    /// Application types advance the group counter; reserved types draw a
    /// fresh host sequence. Iterations alternate between send+listen and
    /// listen-only (capped at [`RECV_CEILING`]) so a slow drone is not
    /// flooded with retransmits. A drone stays pending while silent or
    /// answering `accept`; terminal replies (`status`, `unsupported`, any
    /// application reply) settle it. On expiry, unsettled drones map to
    /// `None`.
    pub async fn request(
        &self,
        reqtype: &str,
        data: Option<&Value>,
        timeout: Duration,
    ) -> Result<ReplyMap, DroneError> {
        let (mut pending, seq) = {
            let mut st = self.lock_state();
            if st.members.is_empty() {
                return Err(DroneError::NotFound("drone group is empty".to_owned()));
            }
            let seq = if is_reserved(reqtype) {
                self.host.genseq()
            } else {
                st.seq = (st.seq + 1) % ud_protocol::SEQ_MODULO;
                st.seq
            };
            (st.members.clone(), seq)
        };

        let mut answers = ReplyMap::new();
        let start = Instant::now();
        let mut round = 0u32;
        self.touch();

        while !pending.is_empty() && start.elapsed() < timeout {
            let mut expect = pending.clone();
            round += 1;
            let fresh = if round % 2 == 1 {
                self.host
                    .call(
                        &self.groupid,
                        Some(seq),
                        reqtype,
                        data,
                        None,
                        Some(&mut expect),
                    )
                    .await?
            } else {
                let remaining = timeout.saturating_sub(start.elapsed());
                let mut collected = Answers::new();
                self.host
                    .recv_until(
                        &mut collected,
                        seq,
                        None,
                        RECV_CEILING.min(remaining),
                        Some(&mut expect),
                    )
                    .await?;
                collected
            };
            for (drone, env) in fresh {
                answers.insert(drone, Some(env));
            }
            for drone in expect {
                // No reply this round; overwritten if a later round delivers.
                answers.insert(drone, None);
            }
            for (drone, answer) in &mut answers {
                let in_progress =
                    matches!(answer, Some(env) if env.msgtype == msgtype::ACCEPT);
                if in_progress {
                    *answer = None;
                } else if answer.is_some() {
                    pending.remove(drone);
                }
            }
            self.touch();
        }

        // Zero-timeout requests (and hard expiries) still report every
        // member, mapped to the timeout sentinel.
        for drone in pending {
            answers.entry(drone).or_insert(None);
        }
        Ok(answers)
    }

    /// [`Group::request`] plus strict per-drone classification.
    ///
    /// Raises the first anomaly found: a timed-out member
    /// ([`DroneError::NotReachable`]), a reply from outside the membership
    /// ([`DroneError::Conflict`]), an `unsupported` or failed/malformed
    /// `status` reply ([`DroneError::Runtime`]). When `update` is given the
    /// replies are additionally merged into it.
    pub async fn call(
        &self,
        reqtype: &str,
        data: Option<&Value>,
        timeout: Duration,
        update: Option<&mut ReplyMap>,
    ) -> Result<ReplyMap, DroneError> {
        let answers = self.request(reqtype, data, timeout).await?;
        if let Some(update) = update {
            update.extend(answers.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        classify_answers(&answers, &self.lock_state().members)?;
        Ok(answers)
    }

    /// Disband the group: `!reset` every member and clear the membership.
    ///
    /// No-op on an empty group. Membership is cleared even when some drones
    /// stay silent; those are reported via [`DroneError::NotReachable`] so
    /// the caller knows which devices are stuck.
    pub async fn reset(&self, how: Option<&str>) -> Result<(), DroneError> {
        let mut expect = {
            let st = self.lock_state();
            if st.members.is_empty() {
                return Ok(());
            }
            st.members.clone()
        };
        let outcome = self
            .host
            .reset(&self.groupid, how, Some(&mut expect))
            .await;
        self.lock_state().members.clear();
        outcome?;
        if !expect.is_empty() {
            return Err(DroneError::NotReachable(expect.into_iter().collect()));
        }
        debug!(group = %self.groupid, "group reset");
        Ok(())
    }

    /// Push the keep-alive deadline forward; any foreground traffic counts
    /// as activity.
    fn touch(&self) {
        self.lock_state().idle_deadline = Instant::now() + self.host.idle_interval();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, GroupState> {
        self.state.lock().expect("group state poisoned")
    }

    #[cfg(test)]
    fn force_members<I: IntoIterator<Item = String>>(&self, members: I) {
        self.lock_state().members.extend(members);
    }

    #[cfg(test)]
    fn current_seq(&self) -> u32 {
        self.lock_state().seq
    }
}

/// Strict reply classification for [`Group::call`].
///
/// Unrecognized non-reserved reply types are application payloads and pass
/// untouched; only the reserved reply vocabulary is interpreted.
fn classify_answers(
    answers: &ReplyMap,
    members: &HashSet<String>,
) -> Result<(), DroneError> {
    for (drone, answer) in answers {
        let Some(env) = answer else {
            return Err(DroneError::NotReachable(vec![drone.clone()]));
        };
        if !members.contains(drone) {
            return Err(DroneError::Conflict(vec![drone.clone()]));
        }
        if env.msgtype == msgtype::UNSUPPORTED {
            return Err(DroneError::Runtime {
                code: errno::EOPNOTSUPP,
                errstr: Some("unknown command".to_owned()),
                drone: drone.clone(),
            });
        }
        if env.msgtype == msgtype::STATUS {
            match env.status() {
                Some(status) if status.code > 0 => {
                    return Err(DroneError::Runtime {
                        code: status.code,
                        errstr: status.errstr,
                        drone: drone.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    return Err(DroneError::Runtime {
                        code: errno::EPROTO,
                        errstr: Some("invalid status reply".to_owned()),
                        drone: drone.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Keep-alive task: sleeps toward the idle deadline, and on expiry emits a
/// no-reply `!whois` to the group when it has members. The whois draws its
/// own fresh sequence, so a concurrent request's sequence filter discards
/// any replies it provokes. Exits once every group handle is dropped.
fn spawn_keepalive(host: Arc<HostShared>, groupid: String, state: Weak<Mutex<GroupState>>) {
    tokio::spawn(async move {
        loop {
            let Some(strong) = state.upgrade() else { break };
            let (deadline, active) = {
                let st = strong.lock().expect("group state poisoned");
                (st.idle_deadline, !st.members.is_empty())
            };
            drop(strong);

            if Instant::now() < deadline {
                tokio::time::sleep_until(deadline).await;
                continue;
            }
            if active {
                debug!(group = %groupid, "idle keep-alive ping");
                if let Err(e) = host.whois(&groupid, Some(0), None, None).await {
                    warn!(group = %groupid, error = %e, "keep-alive ping failed");
                }
            }
            let Some(strong) = state.upgrade() else { break };
            strong.lock().expect("group state poisoned").idle_deadline =
                Instant::now() + host.idle_interval();
        }
    });
}
