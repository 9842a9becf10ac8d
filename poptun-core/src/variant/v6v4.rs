//! 6in4: IPv6 carried as the payload of IPv4 protocol 41, optionally with
//! heartbeat keep-alives towards the broker.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::ops::ControlFlow::{Break, Continue};
use std::sync::Arc;
use std::time::Duration;

use socket2::Domain;
use tracing::{debug, error, info, warn};

use crate::endpoint::TunnelType;
use crate::io::{LinkStatus, PeerSocket, Received, VirtualInterfaceArg};
use crate::netcfg;
use crate::tunnel::{Shared, TunnelError};
use crate::wire::ethernet::{self, ETHERTYPE_IPV6, FrameClass, ROUTER_MAC};
use crate::wire::heartbeat::{self, HEARTBEAT_PORT};
use crate::wire::ndp::{self, Intercept};
use crate::wire::unix_time;
use crate::{ETHER_HEADER_LEN, SCRATCH_LEN};

use super::{DataWorkers, Variant, apply_mtu, run_worker, spawn_worker};

/// IP protocol number for IPv6-in-IPv4.
const IPPROTO_IPV6: i32 = 41;

/// Destination MAC stamped on decapsulated packets: a solicited-node style
/// multicast the host accepts without neighbor resolution.
const ALL_HOSTS_MAC: [u8; 6] = [0x33, 0x33, 0xff, 0x00, 0x00, 0x02];

pub(crate) struct SixInFourTunnel {
    shared: Arc<Shared>,
    interface: VirtualInterfaceArg,
    sock: Arc<PeerSocket>,
}

impl SixInFourTunnel {
    pub(crate) fn new(
        shared: Arc<Shared>,
        interface: VirtualInterfaceArg,
    ) -> Result<Self, TunnelError> {
        let sock = Arc::new(PeerSocket::raw(Domain::IPV4, IPPROTO_IPV6, shared.waitms)?);
        apply_mtu(&interface, shared.endpoint.local_mtu)?;
        Ok(Self {
            shared,
            interface,
            sock,
        })
    }
}

impl Variant for SixInFourTunnel {
    fn start(&self) -> Result<DataWorkers, TunnelError> {
        let endpoint = &self.shared.endpoint;
        self.interface.set_status(LinkStatus::Ipv6Up)?;
        netcfg::add_ipv6_address(
            self.interface.name(),
            endpoint.local_ipv6,
            endpoint.local_prefix,
        )?;
        if !endpoint.remote_ipv6.is_unspecified() {
            netcfg::add_default_route6(endpoint.remote_ipv6)?;
        }

        let reader = {
            let shared = self.shared.clone();
            let sock = self.sock.clone();
            let interface = self.interface.clone();
            spawn_worker("v6v4-reader", move || reader_loop(shared, sock, interface))?
        };
        let writer = {
            let shared = self.shared.clone();
            let sock = self.sock.clone();
            let interface = self.interface.clone();
            spawn_worker("v6v4-writer", move || writer_loop(shared, sock, interface))?
        };

        Ok(DataWorkers { reader, writer })
    }

    fn stop(&self) -> Result<(), TunnelError> {
        self.interface.set_status(LinkStatus::AllDown)?;
        Ok(())
    }

    /// Heartbeat tunnels refresh the broker's record of our IPv4 address
    /// with a throwaway UDP socket per beat.
    fn beat(&self) -> Result<(), TunnelError> {
        let endpoint = &self.shared.endpoint;
        if endpoint.tunnel_type != TunnelType::Heartbeat {
            return Ok(());
        }

        let message = heartbeat::message(endpoint.local_ipv6, unix_time(), &endpoint.password);
        let sock = UdpSocket::bind((std::net::Ipv4Addr::UNSPECIFIED, 0))?;
        sock.send_to(
            message.as_bytes(),
            SocketAddr::from((endpoint.remote_ipv4, HEARTBEAT_PORT)),
        )?;
        Ok(())
    }

    fn beats(&self) -> bool {
        self.shared.endpoint.tunnel_type == TunnelType::Heartbeat
    }
}

fn reader_loop(shared: Arc<Shared>, sock: Arc<PeerSocket>, interface: VirtualInterfaceArg) {
    let mut buf = [0u8; SCRATCH_LEN];
    let remote = IpAddr::V4(shared.endpoint.remote_ipv4);
    ethernet::fill_header(&mut buf, &ALL_HOSTS_MAC, &ROUTER_MAC, ETHERTYPE_IPV6);

    run_worker(&shared, "v6v4 reader", || {
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

fn writer_loop(shared: Arc<Shared>, sock: Arc<PeerSocket>, interface: VirtualInterfaceArg) {
    let mut buf = [0u8; SCRATCH_LEN];
    let waitms = Duration::from_millis(shared.waitms);
    let remote = SocketAddr::from((shared.endpoint.remote_ipv4, 0));

    run_worker(&shared, "v6v4 writer", || {
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

        match ndp::intercept(&mut buf, len) {
            Intercept::Drop => Continue(()),
            Intercept::Reply(reply_len) => {
                info!("writing reply to a neighbor solicitation");
                if let Err(err) = interface.send(&buf[..reply_len]) {
                    error!(%err, "error writing frame to the interface");
                    return Break(());
                }
                Continue(())
            }
            Intercept::Passthrough => {
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
        }
    });
}
