//! I/O endpoints a tunnel talks to: the virtual interface collaborator and
//! the peer-facing UDP/raw sockets.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

/// Link state of the virtual interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Interface down.
    AllDown,
    /// Link up, carrying IPv4.
    Ipv4Up,
    /// Link up, carrying IPv6.
    Ipv6Up,
}

/// The virtual L2 device a tunnel bridges.
///
/// Implementations wrap a kernel TAP device (see `poptun-app-utils`); tests
/// substitute an in-memory pair. All operations take `&self` so a reader and
/// a writer thread can share one handle; implementations rely on the
/// kernel's own read/write serialization rather than user-space locking.
pub trait VirtualInterface: Send + Sync {
    /// Kernel name of the interface.
    fn name(&self) -> &str;
    /// The interface's own MAC address.
    fn hwaddr(&self) -> [u8; 6];
    /// Current MTU.
    fn mtu(&self) -> io::Result<u32>;
    /// Change the MTU.
    fn set_mtu(&self, mtu: u32) -> io::Result<()>;
    /// Assign an IPv4 address and prefix.
    fn set_ipv4(&self, addr: Ipv4Addr, prefix: u8) -> io::Result<()>;
    /// Raise or lower the link.
    fn set_status(&self, status: LinkStatus) -> io::Result<()>;
    /// Wait until a frame is readable; `false` on timeout.
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool>;
    /// Read one full Ethernet frame.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    /// Write one full Ethernet frame.
    fn send(&self, buf: &[u8]) -> io::Result<usize>;
}

/// Shared handle to a [`VirtualInterface`].
pub type VirtualInterfaceArg = Arc<dyn VirtualInterface>;

/// What one bounded receive attempt produced.
#[derive(Debug)]
pub(crate) enum Received {
    /// Timed out, or the datagram was unusable; not an error.
    Nothing,
    /// The peer closed on us.
    Disconnected,
    /// A datagram of `len` bytes from `from` sits at the buffer start.
    Packet { len: usize, from: SocketAddr },
}

/// A socket facing the tunnel peer.
///
/// Wraps either a plain UDP socket or a raw IP socket of a fixed protocol.
/// Raw IPv4 sockets deliver the outer IP header with every datagram; this
/// wrapper strips it so callers always see the inner packet, matching IPv6
/// raw-socket semantics.
pub(crate) struct PeerSocket {
    sock: UdpSocket,
    strips_outer_header: bool,
}

impl PeerSocket {
    /// A UDP socket bound to an ephemeral port, with its receive path
    /// bounded by `waitms`.
    pub(crate) fn udp(waitms: u64) -> io::Result<Self> {
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        sock.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
        Self::finish(sock, waitms, false)
    }

    /// A raw socket of the given family and IP protocol number.
    pub(crate) fn raw(domain: Domain, protocol: i32, waitms: u64) -> io::Result<Self> {
        let sock = Socket::new(domain, Type::RAW, Some(Protocol::from(protocol)))?;
        Self::finish(sock, waitms, domain == Domain::IPV4)
    }

    fn finish(sock: Socket, waitms: u64, strips_outer_header: bool) -> io::Result<Self> {
        if waitms == 0 {
            sock.set_nonblocking(true)?;
        } else {
            sock.set_read_timeout(Some(Duration::from_millis(waitms)))?;
        }
        Ok(Self {
            sock: sock.into(),
            strips_outer_header,
        })
    }

    /// Where the socket is bound; lets the caller learn the ephemeral port.
    #[cfg(test)]
    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    /// One bounded receive attempt into the start of `buf`.
    pub(crate) fn recv_from(&self, buf: &mut [u8]) -> io::Result<Received> {
        let (len, from) = match self.sock.recv_from(buf) {
            Ok((0, _)) => return Ok(Received::Disconnected),
            Ok(received) => received,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                return Ok(Received::Nothing);
            }
            Err(err) => return Err(err),
        };

        if !self.strips_outer_header {
            return Ok(Received::Packet { len, from });
        }

        // Raw AF_INET delivery starts with the outer IPv4 header.
        let header_len = usize::from(buf[0] & 0x0f) * 4;
        if buf[0] >> 4 != 4 || header_len < 20 || len <= header_len {
            debug!(len, "discarding raw datagram with unusable outer header");
            return Ok(Received::Nothing);
        }
        buf.copy_within(header_len..len, 0);
        Ok(Received::Packet {
            len: len - header_len,
            from,
        })
    }

    /// Send one datagram; blocks until the kernel accepts it.
    pub(crate) fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.sock.send_to(buf, addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_recv_times_out() {
        let sock = PeerSocket::udp(10).unwrap();
        let mut buf = [0u8; 64];
        assert!(matches!(sock.recv_from(&mut buf).unwrap(), Received::Nothing));
    }

    #[test]
    fn udp_round_trip() {
        let receiver = PeerSocket::udp(100).unwrap();
        let sender = PeerSocket::udp(100).unwrap();
        let addr = receiver.local_addr().unwrap();
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, addr.port()));

        sender.send_to(b"ping", target).unwrap();

        let mut buf = [0u8; 64];
        match receiver.recv_from(&mut buf).unwrap() {
            Received::Packet { len, .. } => assert_eq!(&buf[..len], b"ping"),
            other => panic!("expected a packet, got {other:?}"),
        }
    }
}
