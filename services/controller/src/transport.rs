//! Multicast UDP transport.
//!
//! One nonblocking socket per controller, bound to an ephemeral port on all
//! local addresses. Requests go to the fixed multicast endpoint; drones
//! reply unicast to the bound port. The transport offers exactly three
//! primitives: fire-and-forget send, a bounded readiness wait, and a
//! nonblocking drain. Reliability lives a layer up, in the resend schedule.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;

/// The controller side of the multicast channel.
#[derive(Debug)]
pub struct MulticastTransport {
    socket: UdpSocket,
    dest: SocketAddr,
}

impl MulticastTransport {
    /// Open the controller socket.
    ///
    /// Binds `0.0.0.0:0` (the OS picks the port drones will reply to) and,
    /// when `source` is given, pins the outgoing multicast interface to that
    /// local address. Multicast loopback stays enabled so co-located drones
    /// (and the test suites) see the traffic.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(dest: SocketAddr, source: Option<Ipv4Addr>) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            0,
        )))?;
        if let Some(local) = source {
            socket.set_multicast_if_v4(&local)?;
        }
        socket.set_multicast_loop_v4(true)?;
        let socket = UdpSocket::from_std(socket.into())?;
        Ok(MulticastTransport { socket, dest })
    }

    /// Emit one datagram to the multicast endpoint. No acknowledgement.
    pub async fn send(&self, payload: &[u8]) -> io::Result<()> {
        self.socket.send_to(payload, self.dest).await.map(|_| ())
    }

    /// Wait until the socket is readable or `timeout` elapses.
    ///
    /// Returns `Ok(false)` on timeout. Millisecond-granularity deadlines are
    /// honored by the tokio timer.
    pub async fn readable(&self, timeout: Duration) -> io::Result<bool> {
        match tokio::time::timeout(timeout, self.socket.readable()).await {
            Ok(ready) => ready.map(|()| true),
            Err(_elapsed) => Ok(false),
        }
    }

    /// Nonblocking drain of a single datagram into `buf`.
    ///
    /// `Ok(None)` when the receive queue is empty; would-block is not an
    /// error. Datagrams longer than `buf` are truncated by the kernel, which
    /// makes them fail envelope decode upstream — that is the 32 KiB
    /// oversize-discard behavior.
    pub fn try_recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.socket.try_recv_from(buf) {
            Ok((len, _from)) => Ok(Some(len)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The ephemeral local address drones reply to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The fixed multicast endpoint this transport sends to.
    #[must_use]
    pub fn dest(&self) -> SocketAddr {
        self.dest
    }
}
