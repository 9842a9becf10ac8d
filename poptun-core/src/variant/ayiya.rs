//! AYIYA: IPv6 inside authenticated UDP datagrams.

use std::net::{Ipv6Addr, SocketAddr};
use std::ops::ControlFlow::{Break, Continue};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::io::{LinkStatus, PeerSocket, Received, VirtualInterfaceArg};
use crate::netcfg;
use crate::tunnel::{Shared, TunnelError};
use crate::wire::ayiya::{
    self, FRAMING_LEN, NEXT_HEADER_IPV6, NEXT_HEADER_NONE, Opcode, SecretHash,
};
use crate::wire::ethernet::{self, ETHERTYPE_IPV6, FrameClass, ROUTER_MAC};
use crate::wire::ndp::{self, Intercept};
use crate::wire::unix_time;
use crate::{ETHER_HEADER_LEN, SCRATCH_LEN};

use super::{DataWorkers, Variant, apply_mtu, run_worker, spawn_worker};

pub(crate) struct AyiyaTunnel {
    shared: Arc<Shared>,
    interface: VirtualInterfaceArg,
    sock: Arc<PeerSocket>,
    secret: SecretHash,
}

impl AyiyaTunnel {
    pub(crate) fn new(
        shared: Arc<Shared>,
        interface: VirtualInterfaceArg,
    ) -> Result<Self, TunnelError> {
        let sock = Arc::new(PeerSocket::udp(shared.waitms)?);
        apply_mtu(&interface, shared.endpoint.local_mtu)?;
        let secret = SecretHash::from_password(&shared.endpoint.password);
        Ok(Self {
            shared,
            interface,
            sock,
            secret,
        })
    }

    fn remote(&self) -> SocketAddr {
        SocketAddr::from((
            self.shared.endpoint.remote_ipv4,
            self.shared.endpoint.remote_port,
        ))
    }
}

impl Variant for AyiyaTunnel {
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
            let secret = self.secret.clone();
            let remote = self.remote();
            spawn_worker("ayiya-reader", move || {
                reader_loop(shared, sock, interface, secret, remote)
            })?
        };
        let writer = {
            let shared = self.shared.clone();
            let sock = self.sock.clone();
            let interface = self.interface.clone();
            let secret = self.secret.clone();
            let remote = self.remote();
            spawn_worker("ayiya-writer", move || {
                writer_loop(shared, sock, interface, secret, remote)
            })?
        };

        Ok(DataWorkers { reader, writer })
    }

    fn stop(&self) -> Result<(), TunnelError> {
        self.interface.set_status(LinkStatus::AllDown)?;
        Ok(())
    }

    fn beat(&self) -> Result<(), TunnelError> {
        let frame = ayiya::pack(
            Opcode::Noop,
            NEXT_HEADER_NONE,
            self.shared.endpoint.local_ipv6,
            unix_time() as u32,
            &self.secret,
            &[],
        );
        let sent = self.sock.send_to(&frame, self.remote())?;
        if sent != frame.len() {
            return Err(TunnelError::Io(std::io::Error::other(
                "short write while sending beat",
            )));
        }
        Ok(())
    }

    fn beats(&self) -> bool {
        true
    }
}

fn reader_loop(
    shared: Arc<Shared>,
    sock: Arc<PeerSocket>,
    interface: VirtualInterfaceArg,
    secret: SecretHash,
    remote: SocketAddr,
) {
    let mut buf = [0u8; SCRATCH_LEN];
    let hwaddr = interface.hwaddr();
    let identity = shared.endpoint.remote_ipv6;
    info!(hwaddr = ?hwaddr, "interface hardware address");

    run_worker(&shared, "ayiya reader", || {
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
        if from != remote {
            info!(%from, "discarding packet from incorrect host");
            return Continue(());
        }
        debug!(len, "read bytes from the server");

        let Some(deliver) = accept_ingress(&mut buf, len, identity, &secret, &hwaddr) else {
            return Continue(());
        };
        if let Err(err) = interface.send(&buf[deliver]) {
            error!(%err, "error writing frame to the interface");
            return Break(());
        }
        Continue(())
    });
}

/// Validate a datagram and fabricate its Ethernet header in place.
///
/// On success the returned range selects the fabricated header plus the
/// tunneled IPv6 packet; the header reuses the last 14 bytes of the AYIYA
/// framing, so nothing needs to move.
fn accept_ingress(
    buf: &mut [u8],
    len: usize,
    identity: Ipv6Addr,
    secret: &SecretHash,
    hwaddr: &[u8; 6],
) -> Option<Range<usize>> {
    let frame = match ayiya::verify(&mut buf[..len], &identity, secret, unix_time()) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(%err, "dropping invalid AYIYA packet");
            return None;
        }
    };

    // Keep-alives and echo probes carry nothing for the interface.
    if frame.opcode == Opcode::Noop || frame.next_header == NEXT_HEADER_NONE {
        return None;
    }
    if len == FRAMING_LEN || buf[FRAMING_LEN] >> 4 != 6 {
        warn!("tunneled packet does not start with an IPv6 header");
        return None;
    }

    let header_at = FRAMING_LEN - ETHER_HEADER_LEN;
    ethernet::fill_header(&mut buf[header_at..], hwaddr, &ROUTER_MAC, ETHERTYPE_IPV6);
    Some(header_at..len)
}

fn writer_loop(
    shared: Arc<Shared>,
    sock: Arc<PeerSocket>,
    interface: VirtualInterfaceArg,
    secret: SecretHash,
    remote: SocketAddr,
) {
    let mut buf = [0u8; SCRATCH_LEN];
    let waitms = Duration::from_millis(shared.waitms);
    let local_ipv6 = shared.endpoint.local_ipv6;

    run_worker(&shared, "ayiya writer", || {
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
                debug!("writing reply to a neighbor solicitation");
                if let Err(err) = interface.send(&buf[..reply_len]) {
                    error!(%err, "error writing frame to the interface");
                    return Break(());
                }
                Continue(())
            }
            Intercept::Passthrough => {
                let frame = ayiya::pack(
                    Opcode::Forward,
                    NEXT_HEADER_IPV6,
                    local_ipv6,
                    unix_time() as u32,
                    &secret,
                    &buf[ETHER_HEADER_LEN..len],
                );
                match sock.send_to(&frame, remote) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    const HWADDR: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x07];

    fn identity() -> Ipv6Addr {
        "2001:db8::1".parse().unwrap()
    }

    fn datagram(opcode: Opcode, next_header: u8, payload: &[u8]) -> Vec<u8> {
        let secret = SecretHash::from_password("secret");
        let frame = ayiya::pack(
            opcode,
            next_header,
            identity(),
            unix_time() as u32,
            &secret,
            payload,
        );
        let mut buf = frame.to_vec();
        buf.resize(SCRATCH_LEN, 0);
        buf
    }

    #[test]
    fn forward_frame_gets_a_fabricated_header() {
        let mut payload = [0u8; 40];
        payload[0] = 6 << 4;
        let mut buf = datagram(Opcode::Forward, NEXT_HEADER_IPV6, &payload);
        let len = FRAMING_LEN + payload.len();

        let secret = SecretHash::from_password("secret");
        let range = accept_ingress(&mut buf, len, identity(), &secret, &HWADDR).unwrap();
        assert_eq!(range, FRAMING_LEN - ETHER_HEADER_LEN..len);

        let frame = &buf[range];
        assert_eq!(&frame[0..6], &HWADDR);
        assert_eq!(&frame[6..12], &ROUTER_MAC);
        assert_eq!(&frame[12..14], &[0x86, 0xdd]);
        assert_eq!(&frame[ETHER_HEADER_LEN..], &payload);
    }

    #[test]
    fn keepalive_is_not_delivered() {
        let mut buf = datagram(Opcode::Noop, NEXT_HEADER_NONE, &[]);
        let secret = SecretHash::from_password("secret");
        assert_eq!(
            accept_ingress(&mut buf, FRAMING_LEN, identity(), &secret, &HWADDR),
            None
        );
    }

    #[test]
    fn non_ipv6_payload_is_dropped() {
        let mut payload = [0u8; 40];
        payload[0] = 4 << 4;
        let mut buf = datagram(Opcode::Forward, NEXT_HEADER_IPV6, &payload);
        let len = FRAMING_LEN + payload.len();
        let secret = SecretHash::from_password("secret");
        assert_eq!(accept_ingress(&mut buf, len, identity(), &secret, &HWADDR), None);
    }

    #[test]
    fn bad_signature_is_dropped() {
        let mut payload = [0u8; 40];
        payload[0] = 6 << 4;
        let mut buf = datagram(Opcode::Forward, NEXT_HEADER_IPV6, &payload);
        let len = FRAMING_LEN + payload.len();
        let secret = SecretHash::from_password("not the secret");
        assert_eq!(accept_ingress(&mut buf, len, identity(), &secret, &HWADDR), None);
    }
}
