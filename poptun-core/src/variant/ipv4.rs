//! IPv4 tunneled inside IP protocol 4, over an IPv4 or IPv6 outer packet.

use std::net::{IpAddr, SocketAddr};
use std::ops::ControlFlow::{Break, Continue};
use std::sync::Arc;
use std::time::Duration;

use socket2::Domain;
use tracing::{debug, error, info, warn};

use crate::endpoint::{TunnelType, netmask};
use crate::io::{LinkStatus, PeerSocket, Received, VirtualInterfaceArg};
use crate::tunnel::{Shared, TunnelError};
use crate::wire::arp::{self, ArpAction};
use crate::wire::ethernet::{
    self, BROADCAST_MAC, ETHERTYPE_ARP, ETHERTYPE_IPV4, MULTICAST_V4_PREFIX, ROUTER_MAC,
};
use crate::{ETHER_HEADER_LEN, SCRATCH_LEN};

use super::{DataWorkers, Variant, apply_mtu, run_worker, spawn_worker};

/// IP protocol number for IP-in-IP.
const IPPROTO_IPIP: i32 = 4;

pub(crate) struct Ipv4Tunnel {
    shared: Arc<Shared>,
    interface: VirtualInterfaceArg,
    sock: Arc<PeerSocket>,
    netmask: u32,
}

impl Ipv4Tunnel {
    pub(crate) fn new(
        shared: Arc<Shared>,
        interface: VirtualInterfaceArg,
    ) -> Result<Self, TunnelError> {
        let endpoint = &shared.endpoint;
        let domain = match endpoint.tunnel_type {
            TunnelType::V4V4 => Domain::IPV4,
            TunnelType::V4V6 => Domain::IPV6,
            _ => return Err(TunnelError::Config("not an IPv4-inside endpoint")),
        };
        let sock = Arc::new(PeerSocket::raw(domain, IPPROTO_IPIP, shared.waitms)?);

        interface.set_ipv4(endpoint.local_ipv4, endpoint.local_prefix)?;
        apply_mtu(&interface, endpoint.local_mtu)?;

        let netmask = netmask(endpoint.local_prefix);
        Ok(Self {
            shared,
            interface,
            sock,
            netmask,
        })
    }

    /// The outer address packets are exchanged with.
    fn remote(&self) -> IpAddr {
        match self.shared.endpoint.tunnel_type {
            TunnelType::V4V6 => IpAddr::V6(self.shared.endpoint.remote_ipv6),
            _ => IpAddr::V4(self.shared.endpoint.remote_ipv4),
        }
    }
}

impl Variant for Ipv4Tunnel {
    fn start(&self) -> Result<DataWorkers, TunnelError> {
        self.interface.set_status(LinkStatus::Ipv4Up)?;

        let reader = {
            let shared = self.shared.clone();
            let sock = self.sock.clone();
            let interface = self.interface.clone();
            let remote = self.remote();
            spawn_worker("ipv4-reader", move || {
                reader_loop(shared, sock, interface, remote)
            })?
        };
        let writer = {
            let shared = self.shared.clone();
            let sock = self.sock.clone();
            let interface = self.interface.clone();
            let remote = self.remote();
            let mask = self.netmask;
            spawn_worker("ipv4-writer", move || {
                writer_loop(shared, sock, interface, remote, mask)
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
    remote: IpAddr,
) {
    let mut buf = [0u8; SCRATCH_LEN];
    ethernet::fill_header(&mut buf, &interface.hwaddr(), &ROUTER_MAC, ETHERTYPE_IPV4);

    run_worker(&shared, "ipv4 reader", || {
        let (len, from) = match sock.recv_from(&mut buf[ETHER_HEADER_LEN..]) {
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
        // A different family shows up as a non-matching address.
        if from.ip() != remote {
            info!(%from, "discarding packet from incorrect host");
            return Continue(());
        }
        debug!(len, "read bytes from the server");

        if let Err(err) = interface.send(&buf[..ETHER_HEADER_LEN + len]) {
            error!(%err, "error writing frame to the interface");
            return Break(());
        }
        Continue(())
    });
}

/// Whether an egress IPv4 frame is addressed to us as the next hop: the
/// fabricated router, broadcast, or IPv4 multicast.
fn egress_allowed(dst: &[u8]) -> bool {
    dst[..6] == ROUTER_MAC || dst[..6] == BROADCAST_MAC || dst[..3] == MULTICAST_V4_PREFIX
}

fn writer_loop(
    shared: Arc<Shared>,
    sock: Arc<PeerSocket>,
    interface: VirtualInterfaceArg,
    remote: IpAddr,
    netmask: u32,
) {
    let mut buf = [0u8; SCRATCH_LEN];
    let waitms = Duration::from_millis(shared.waitms);
    let local_mac = interface.hwaddr();
    let local_ipv4 = shared.endpoint.local_ipv4;
    let remote = SocketAddr::from((remote, 0));

    run_worker(&shared, "ipv4 writer", || {
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

        match ethernet::ether_type(&buf[..len]) {
            Some(ETHERTYPE_ARP) => {
                match arp::respond(&mut buf, len, &local_mac, local_ipv4, netmask) {
                    ArpAction::Invalid => warn!("ARP request packet invalid"),
                    ArpAction::ForeignSender => info!("ARP coming from unknown device"),
                    ArpAction::DuplicateAddress => {
                        debug!("ignoring duplicate address detection query");
                    }
                    ArpAction::OutOfSubnet => warn!("target IP of ARP not available"),
                    ArpAction::Reply(reply_len) => {
                        info!("replied to an ARP request");
                        if let Err(err) = interface.send(&buf[..reply_len]) {
                            error!(%err, "error writing frame to the interface");
                            return Break(());
                        }
                    }
                }
                Continue(())
            }
            Some(ETHERTYPE_IPV4) => {
                if !egress_allowed(&buf[..6]) {
                    info!("found an IPv4 packet to another host");
                    return Continue(());
                }
                match sock.send_to(&buf[ETHER_HEADER_LEN..len], remote) {
                    Ok(sent) => {
                        debug!(sent, "wrote bytes to the server");
                        Continue(())
                    }
                    Err(err) => {
                        error!(%err, "error writing to the socket");
                        Break(())
                    }
                }
            }
            Some(other) => {
                info!("packet of unhandled protocol type {other:#06x}");
                Continue(())
            }
            None => {
                warn!(len, "discarding frame too short for an Ethernet header");
                Continue(())
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn egress_gate() {
        assert!(egress_allowed(&ROUTER_MAC));
        assert!(egress_allowed(&BROADCAST_MAC));
        assert!(egress_allowed(&[0x01, 0x00, 0x5e, 0x00, 0x00, 0x01]));
        assert!(!egress_allowed(&[0x02, 0x11, 0x22, 0x33, 0x44, 0x55]));
    }
}
