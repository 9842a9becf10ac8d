//! L2-over-UDP: whole Ethernet frames exchanged as UDP datagrams.

use std::net::SocketAddr;
use std::ops::ControlFlow::{Break, Continue};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::io::{LinkStatus, PeerSocket, Received, VirtualInterfaceArg};
use crate::tunnel::{Shared, TunnelError};
use crate::wire::ethernet::{self, ETHERTYPE_IPV6, FrameClass};
use crate::{ETHER_HEADER_LEN, SCRATCH_LEN};

use super::{DataWorkers, Variant, run_worker, spawn_worker};

pub(crate) struct EtherTunnel {
    shared: Arc<Shared>,
    interface: VirtualInterfaceArg,
    sock: Arc<PeerSocket>,
}

impl EtherTunnel {
    pub(crate) fn new(
        shared: Arc<Shared>,
        interface: VirtualInterfaceArg,
    ) -> Result<Self, TunnelError> {
        let sock = Arc::new(PeerSocket::udp(shared.waitms)?);
        Ok(Self {
            shared,
            interface,
            sock,
        })
    }

    fn remote(&self) -> SocketAddr {
        SocketAddr::from((
            self.shared.endpoint.remote_ipv4,
            self.shared.endpoint.remote_port,
        ))
    }
}

impl Variant for EtherTunnel {
    fn start(&self) -> Result<DataWorkers, TunnelError> {
        self.interface.set_status(LinkStatus::Ipv4Up)?;

        let reader = {
            let shared = self.shared.clone();
            let sock = self.sock.clone();
            let interface = self.interface.clone();
            let remote = self.remote();
            spawn_worker("ether-reader", move || {
                reader_loop(shared, sock, interface, remote)
            })?
        };
        let writer = {
            let shared = self.shared.clone();
            let sock = self.sock.clone();
            let interface = self.interface.clone();
            let remote = self.remote();
            spawn_worker("ether-writer", move || {
                writer_loop(shared, sock, interface, remote)
            })?
        };

        Ok(DataWorkers { reader, writer })
    }

    fn stop(&self) -> Result<(), TunnelError> {
        self.interface.set_status(LinkStatus::AllDown)?;
        Ok(())
    }
}

fn reader_loop(
    shared: Arc<Shared>,
    sock: Arc<PeerSocket>,
    interface: VirtualInterfaceArg,
    remote: SocketAddr,
) {
    let mut buf = [0u8; SCRATCH_LEN];
    let hwaddr = interface.hwaddr();

    run_worker(&shared, "ether reader", || {
        let (len, from) = match sock.recv_from(&mut buf) {
            Ok(Received::Nothing) => return Continue(()),
            Ok(Received::Disconnected) => {
                error!("disconnected from the server");
                return Break(());
            }
            Ok(Received::Packet { len, from }) => (len, from),
            Err(err) => {
                error!(%err, "error receiving data");
                return Break(());
            }
        };
        debug!(len, "read bytes from the server");

        let Some(len) = accept_ingress(&mut buf, len, from, remote, &hwaddr) else {
            return Continue(());
        };
        if let Err(err) = interface.send(&buf[..len]) {
            error!(%err, "error writing frame to the interface");
            return Break(());
        }
        Continue(())
    });
}

/// Validate a datagram from the peer and ready it for delivery. Returns the
/// frame length to write, or `None` to drop.
///
/// The peer sends complete Ethernet frames, so nothing is prepended; the
/// destination MAC is rewritten to the interface's own address unless the
/// frame is IPv6 multicast.
fn accept_ingress(
    buf: &mut [u8],
    len: usize,
    from: SocketAddr,
    remote: SocketAddr,
    hwaddr: &[u8; 6],
) -> Option<usize> {
    if from != remote {
        info!(%from, "discarding packet from incorrect host");
        return None;
    }
    if len < ETHER_HEADER_LEN {
        warn!(len, "discarding frame too short for an Ethernet header");
        return None;
    }
    if ethernet::ether_type(&buf[..len]) != Some(ETHERTYPE_IPV6) {
        return None;
    }
    if !ethernet::is_ipv6_multicast(&buf[..len]) {
        buf[0..6].copy_from_slice(hwaddr);
    }
    Some(len)
}

fn writer_loop(
    shared: Arc<Shared>,
    sock: Arc<PeerSocket>,
    interface: VirtualInterfaceArg,
    remote: SocketAddr,
) {
    let mut buf = [0u8; SCRATCH_LEN];
    let waitms = Duration::from_millis(shared.waitms);

    run_worker(&shared, "ether writer", || {
        match interface.wait_readable(waitms) {
            Ok(true) => {}
            Ok(false) => return Continue(()),
            Err(err) => {
                error!(%err, "error waiting for the interface");
                return Break(());
            }
        }
        let len = match interface.recv(&mut buf) {
            Ok(0) | Err(_) => {
                error!("error reading from the interface");
                return Break(());
            }
            Ok(len) => len,
        };
        debug!(len, "read bytes from the device");

        match ethernet::classify(&buf[..len], ETHERTYPE_IPV6) {
            FrameClass::Wanted => {}
            FrameClass::Runt => {
                warn!(len, "discarding frame too short for an Ethernet header");
                return Continue(());
            }
            FrameClass::NotEthernetIi | FrameClass::OtherProtocol(_) => return Continue(()),
        }

        if let Err(err) = sock.send_to(&buf[..len], remote) {
            error!(%err, "error writing to the socket");
            return Break(());
        }
        Continue(())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ethernet::fill_header;
    use std::net::Ipv4Addr;

    const HWADDR: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

    fn remote() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::new(198, 51, 100, 1), 5072))
    }

    fn ipv6_frame(dst: [u8; 6]) -> [u8; 60] {
        let mut buf = [0u8; 60];
        fill_header(&mut buf, &dst, &[0x02; 6], ETHERTYPE_IPV6);
        buf
    }

    #[test]
    fn frame_from_wrong_host_is_dropped() {
        let mut buf = ipv6_frame([0x0a; 6]);
        let len = buf.len();
        let from = SocketAddr::from((Ipv4Addr::new(203, 0, 113, 9), 5072));
        assert_eq!(accept_ingress(&mut buf, len, from, remote(), &HWADDR), None);
    }

    #[test]
    fn frame_from_wrong_port_is_dropped() {
        let mut buf = ipv6_frame([0x0a; 6]);
        let len = buf.len();
        let from = SocketAddr::from((Ipv4Addr::new(198, 51, 100, 1), 4000));
        assert_eq!(accept_ingress(&mut buf, len, from, remote(), &HWADDR), None);
    }

    #[test]
    fn unicast_destination_is_rewritten() {
        let mut buf = ipv6_frame([0x0a; 6]);
        let len = buf.len();
        assert_eq!(
            accept_ingress(&mut buf, len, remote(), remote(), &HWADDR),
            Some(len)
        );
        assert_eq!(&buf[0..6], &HWADDR);
    }

    #[test]
    fn multicast_destination_is_preserved() {
        let dst = [0x33, 0x33, 0xff, 0x00, 0x00, 0x02];
        let mut buf = ipv6_frame(dst);
        let len = buf.len();
        assert_eq!(
            accept_ingress(&mut buf, len, remote(), remote(), &HWADDR),
            Some(len)
        );
        assert_eq!(&buf[0..6], &dst);
    }

    #[test]
    fn non_ipv6_frame_is_dropped() {
        let mut buf = ipv6_frame([0x0a; 6]);
        buf[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
        let len = buf.len();
        assert_eq!(accept_ingress(&mut buf, len, remote(), remote(), &HWADDR), None);
    }

    #[test]
    fn truncated_frame_is_dropped() {
        let mut buf = ipv6_frame([0x0a; 6]);
        assert_eq!(accept_ingress(&mut buf, 10, remote(), remote(), &HWADDR), None);
    }
}
