//! Scripted in-process drone.
//!
//! `MockDrone` binds the real multicast endpoint (with address reuse, so a
//! whole fleet shares the port the way physical drones do), joins the group
//! on the loopback interface, and answers controller traffic by the book:
//! `!whois` while idle or engaged, `!assign`, `!reset`, and scripted
//! behaviors for application commands. Replies go unicast to the request's
//! source address, exactly like drone firmware.

use serde_json::Value;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use ud_protocol::{AssignRequest, Envelope, GROUP_DEFAULT, MAX_DATAGRAM, StatusData, msgtype};

// ---------------------------------------------------------------------------
// Scripting
// ---------------------------------------------------------------------------

/// Scripted response to one application command.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Immediate `status code 0`.
    Ok,
    /// `accept` right away, then `status code 0` after the delay.
    AcceptThenOk(Duration),
    /// `status code 0` after the delay, with no `accept` in between.
    DelayedOk(Duration),
    /// Immediate failure `status`.
    Fail { code: i32, errstr: String },
    /// Explicit `unsupported` reply.
    Unsupported,
    /// No reply at all.
    Silent,
}

/// What a mock drone does beyond the default protocol behavior.
#[derive(Debug, Clone, Default)]
pub struct DroneScript {
    /// Board type reported for hardware-selective discovery. A `!whois`
    /// carrying a board payload is only answered when it matches.
    pub board: Option<String>,
    /// Behaviors for application commands; anything unlisted is answered
    /// with `unsupported`.
    pub behaviors: HashMap<String, Behavior>,
    /// Refuse `!assign` with this status code instead of joining.
    pub refuse_assign: Option<i32>,
    /// Drop `!assign` requests on the floor (engagement timeout).
    pub ignore_assign: bool,
    /// Drop `!reset` requests on the floor (stuck drone).
    pub ignore_reset: bool,
    /// Also answer traffic addressed to this group id without ever being a
    /// member of it — a misbehaving drone for conflict scenarios.
    pub shadow_group: Option<String>,
}

impl DroneScript {
    /// Builder-style behavior registration.
    #[must_use]
    pub fn with_behavior(mut self, command: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(command.to_owned(), behavior);
        self
    }
}

// ---------------------------------------------------------------------------
// MockDrone
// ---------------------------------------------------------------------------

struct DroneState {
    group: Option<String>,
    received: Vec<Envelope>,
}

/// A running mock drone; dropping it shuts the drone down.
pub struct MockDrone {
    id: String,
    state: Arc<Mutex<DroneState>>,
    task: JoinHandle<()>,
}

impl MockDrone {
    /// Bind the drone to the multicast endpoint and start answering.
    pub async fn spawn(
        id: &str,
        endpoint: SocketAddrV4,
        script: DroneScript,
    ) -> io::Result<MockDrone> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(target_family = "unix")]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            endpoint.port(),
        )))?;
        socket.join_multicast_v4(endpoint.ip(), &Ipv4Addr::LOCALHOST)?;
        let socket = Arc::new(UdpSocket::from_std(socket.into())?);

        let state = Arc::new(Mutex::new(DroneState {
            group: None,
            received: Vec::new(),
        }));
        let task = tokio::spawn(drone_loop(
            id.to_owned(),
            Arc::clone(&socket),
            Arc::clone(&state),
            script,
        ));
        debug!(id, %endpoint, "mock drone up");
        Ok(MockDrone {
            id: id.to_owned(),
            state,
            task,
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Group the drone is currently engaged to, if any.
    #[must_use]
    pub fn group(&self) -> Option<String> {
        self.lock_state().group.clone()
    }

    /// Every envelope this drone accepted as addressed to it, in arrival
    /// order. Handy for asserting keep-alive pings and resend counts.
    #[must_use]
    pub fn received(&self) -> Vec<Envelope> {
        self.lock_state().received.clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, DroneState> {
        self.state.lock().expect("drone state poisoned")
    }
}

impl Drop for MockDrone {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ---------------------------------------------------------------------------
// Protocol loop
// ---------------------------------------------------------------------------

async fn drone_loop(
    id: String,
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<DroneState>>,
    script: DroneScript,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(_) => break,
        };
        let Ok(env) = Envelope::decode(&buf[..len]) else {
            continue;
        };
        if !env.is_wellformed() {
            continue;
        }
        handle(&id, &socket, &state, &script, env, src).await;
    }
}

async fn handle(
    id: &str,
    socket: &Arc<UdpSocket>,
    state: &Arc<Mutex<DroneState>>,
    script: &DroneScript,
    env: Envelope,
    src: SocketAddr,
) {
    let group = state.lock().expect("drone state poisoned").group.clone();
    let addressed_direct = env.to == id;
    let addressed_group = group.as_deref() == Some(env.to.as_str());
    let addressed_idle = group.is_none() && env.to == GROUP_DEFAULT;
    let addressed_shadow = script.shadow_group.as_deref() == Some(env.to.as_str());
    if !(addressed_direct || addressed_group || addressed_idle || addressed_shadow) {
        trace!(id, to = %env.to, "not for us");
        return;
    }
    state
        .lock()
        .expect("drone state poisoned")
        .received
        .push(env.clone());

    match env.msgtype.as_str() {
        msgtype::WHOIS => {
            if let Some(want) = &env.data {
                let board_matches = script
                    .board
                    .as_ref()
                    .is_some_and(|board| want == &Value::String(board.clone()));
                if !board_matches {
                    return;
                }
            }
            reply(socket, src, id, &env, msgtype::STATUS, Some(StatusData::ok().to_value())).await;
        }
        msgtype::ASSIGN => {
            if script.ignore_assign {
                return;
            }
            if let Some(code) = script.refuse_assign {
                let status = StatusData::error(code, "assignment refused");
                reply(socket, src, id, &env, msgtype::STATUS, Some(status.to_value())).await;
                return;
            }
            let request = env
                .data
                .as_ref()
                .and_then(|data| serde_json::from_value::<AssignRequest>(data.clone()).ok());
            let Some(request) = request else {
                return;
            };
            state.lock().expect("drone state poisoned").group = Some(request.group);
            reply(socket, src, id, &env, msgtype::STATUS, Some(StatusData::ok().to_value())).await;
        }
        msgtype::RESET => {
            if script.ignore_reset {
                return;
            }
            state.lock().expect("drone state poisoned").group = None;
            reply(socket, src, id, &env, msgtype::STATUS, Some(StatusData::ok().to_value())).await;
        }
        command => {
            let behavior = script
                .behaviors
                .get(command)
                .cloned()
                .unwrap_or(Behavior::Unsupported);
            match behavior {
                Behavior::Ok => {
                    reply(socket, src, id, &env, msgtype::STATUS, Some(StatusData::ok().to_value()))
                        .await;
                }
                Behavior::AcceptThenOk(delay) => {
                    reply(socket, src, id, &env, msgtype::ACCEPT, None).await;
                    spawn_delayed_status(socket, src, id, &env, delay);
                }
                Behavior::DelayedOk(delay) => {
                    spawn_delayed_status(socket, src, id, &env, delay);
                }
                Behavior::Fail { code, errstr } => {
                    let status = StatusData::error(code, &errstr);
                    reply(socket, src, id, &env, msgtype::STATUS, Some(status.to_value())).await;
                }
                Behavior::Unsupported => {
                    reply(socket, src, id, &env, msgtype::UNSUPPORTED, None).await;
                }
                Behavior::Silent => {}
            }
        }
    }
}

async fn reply(
    socket: &UdpSocket,
    dest: SocketAddr,
    id: &str,
    request: &Envelope,
    reply_type: &str,
    data: Option<Value>,
) {
    let envelope = Envelope {
        from: id.to_owned(),
        to: request.from.clone(),
        msgtype: reply_type.to_owned(),
        seq: request.seq,
        data,
    };
    if let Ok(bytes) = envelope.encode() {
        let _ = socket.send_to(&bytes, dest).await;
    }
}

fn spawn_delayed_status(
    socket: &Arc<UdpSocket>,
    dest: SocketAddr,
    id: &str,
    request: &Envelope,
    delay: Duration,
) {
    let socket = Arc::clone(socket);
    let id = id.to_owned();
    let request = request.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        reply(
            &socket,
            dest,
            &id,
            &request,
            msgtype::STATUS,
            Some(StatusData::ok().to_value()),
        )
        .await;
    });
}
