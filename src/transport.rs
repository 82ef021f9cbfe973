//! Transport adapter (C9): the default `Transport` implementation, a single
//! non-blocking UDP socket bound to the DHCPv6 client port, multicasting to
//! `ff02::1:2` and unicasting to a specific server when the FSM has one
//! (`spec.md` §6 "Transport contract").
//!
//! Reused from the teacher's shape (one socket, parse-dispatch-send loop)
//! but retargeted from tokio to non-blocking `nix` I/O, since the engine's
//! concurrency model is a single-threaded reactor (`spec.md` §5), not a
//! worker-per-protocol async task.

use std::net::Ipv6Addr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::sys::socket::{
    self, AddressFamily, Ipv6MembershipRequest, MsgFlags, SockFlag, SockProtocol, SockType,
    SockaddrIn6,
};
use tracing::{debug, trace, warn};

use crate::error::{EngineError, ErrorKind};

pub const DHCPV6_CLIENT_PORT: u16 = 546;
pub const DHCPV6_SERVER_PORT: u16 = 547;

/// All-DHCP-Relay-Agents-and-Servers, RFC 8415 §7.1.
pub const ALL_DHCP_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);

pub trait Transport {
    /// Send `buf` to `dest` scoped to `ifindex` (needed for link-local and
    /// multicast destinations). Returns bytes sent.
    fn send(&self, ifindex: u32, dest: Ipv6Addr, buf: &[u8]) -> Result<usize, EngineError>;

    /// Non-blocking receive. `Ok(None)` means no datagram was waiting.
    fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, Ipv6Addr, u32)>, EngineError>;

    fn raw_fd(&self) -> RawFd;
}

/// One UDP socket shared by every Device, bound to `[::]:546` and joined to
/// `ff02::1:2` on every interface the caller registers.
pub struct UdpTransport {
    socket: OwnedFd,
}

impl UdpTransport {
    pub fn bind() -> Result<Self, EngineError> {
        let socket = socket::socket(
            AddressFamily::Inet6,
            SockType::Datagram,
            SockFlag::SOCK_NONBLOCK,
            SockProtocol::Udp,
        )
        .map_err(|e| EngineError::new(ErrorKind::SendFailed, format!("socket(): {e}")))?;

        let addr = SockaddrIn6::from(std::net::SocketAddrV6::new(
            Ipv6Addr::UNSPECIFIED,
            DHCPV6_CLIENT_PORT,
            0,
            0,
        ));
        socket::bind(socket.as_raw_fd(), &addr)
            .map_err(|e| EngineError::new(ErrorKind::SendFailed, format!("bind(): {e}")))?;

        Ok(Self { socket })
    }

    /// Join the All-DHCP-Servers multicast group on `ifindex`, so Advertise
    /// unicast replies and any future relay traffic on that link are
    /// deliverable. Must be called once per interface the engine manages.
    pub fn join_multicast(&self, ifindex: u32) -> Result<(), EngineError> {
        let membership = Ipv6MembershipRequest::new(ALL_DHCP_SERVERS);
        socket::setsockopt(&self.socket, socket::sockopt::Ipv6AddMembership, &membership)
            .map_err(|e| EngineError::new(ErrorKind::SendFailed, format!("join multicast on if{ifindex}: {e}")))
    }
}

impl Transport for UdpTransport {
    fn send(&self, ifindex: u32, dest: Ipv6Addr, buf: &[u8]) -> Result<usize, EngineError> {
        let scope_id = if dest.is_multicast() || is_link_local(dest) {
            ifindex
        } else {
            0
        };
        let sockaddr = SockaddrIn6::from(std::net::SocketAddrV6::new(
            dest,
            DHCPV6_SERVER_PORT,
            0,
            scope_id,
        ));
        trace!(%dest, ifindex, bytes = buf.len(), "sending DHCPv6 message");
        socket::sendto(self.socket.as_raw_fd(), buf, &sockaddr, MsgFlags::empty())
            .map_err(|e| EngineError::new(ErrorKind::SendFailed, e.to_string()))
    }

    fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, Ipv6Addr, u32)>, EngineError> {
        match socket::recvfrom::<SockaddrIn6>(self.socket.as_raw_fd(), buf) {
            Ok((len, Some(from))) => {
                let addr = *from.ip();
                let scope_id = from.scope_id();
                debug!(%addr, len, "received DHCPv6 datagram");
                Ok(Some((len, addr, scope_id)))
            }
            Ok((_, None)) => Ok(None),
            Err(nix::errno::Errno::EAGAIN) => Ok(None),
            Err(e) => {
                warn!(error = %e, "recv() failed");
                Err(EngineError::new(ErrorKind::RecvFailed, e.to_string()))
            }
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

fn is_link_local(addr: Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}
