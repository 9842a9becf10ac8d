use std::net::{Ipv4Addr, Ipv6Addr};

use crate::wire::ayiya;

/// Which encapsulation a tunnel speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelType {
    /// Raw Ethernet frames over UDP.
    Ether,
    /// AYIYA: IPv6 over UDP with shared-secret authentication.
    Ayiya,
    /// 6in4: IPv6 as the payload of IPv4 protocol 41.
    V6V4,
    /// 6in4 with periodic UDP heartbeats to the broker.
    Heartbeat,
    /// IPv4 inside IPv4 protocol 4.
    V4V4,
    /// IPv4 inside IPv6 next-header 4.
    V4V6,
}

/// Everything a tunnel needs to know about its two ends.
///
/// Produced by the broker login or the CLI, copied into the tunnel at
/// construction and never mutated afterwards. Address fields that a variant
/// does not use stay unspecified; `local_mtu` and `remote_port` may be left
/// at zero to get the per-variant default (filled in by
/// [`Endpoint::with_defaults`] before the tunnel takes its copy).
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Selects the tunnel variant.
    pub tunnel_type: TunnelType,
    /// Local IPv4 address of the tunnel interface (v4v4/v4v6).
    pub local_ipv4: Ipv4Addr,
    /// Local IPv6 address of the tunnel (ayiya/v6v4/heartbeat).
    pub local_ipv6: Ipv6Addr,
    /// Remote IPv4 address of the peer or POP.
    pub remote_ipv4: Ipv4Addr,
    /// Remote IPv6 address: the POP's tunnel-inner address, or the outer
    /// endpoint for v4v6.
    pub remote_ipv6: Ipv6Addr,
    /// Prefix length of the local address (0-32 for IPv4, 0-128 for IPv6).
    pub local_prefix: u8,
    /// Interface MTU; 0 means the variant default.
    pub local_mtu: u32,
    /// Remote UDP port; 0 means the variant default.
    pub remote_port: u16,
    /// Shared secret for AYIYA signatures and heartbeats.
    pub password: String,
    /// Keep-alive interval in seconds; 0 disables the beater thread.
    pub beat_interval: u32,
}

/// The longest password the wire protocols accept.
pub const MAX_PASSWORD_LEN: usize = 255;

impl Endpoint {
    /// A zeroed endpoint of the given type.
    pub fn new(tunnel_type: TunnelType) -> Self {
        Self {
            tunnel_type,
            local_ipv4: Ipv4Addr::UNSPECIFIED,
            local_ipv6: Ipv6Addr::UNSPECIFIED,
            remote_ipv4: Ipv4Addr::UNSPECIFIED,
            remote_ipv6: Ipv6Addr::UNSPECIFIED,
            local_prefix: 0,
            local_mtu: 0,
            remote_port: 0,
            password: String::new(),
            beat_interval: 0,
        }
    }

    /// Fill zero-valued `local_mtu` and `remote_port` with the defaults of
    /// the chosen variant. The tunnel does this before copying the endpoint,
    /// so the copy it keeps is fully immutable.
    pub fn with_defaults(mut self) -> Self {
        if self.local_mtu == 0 {
            self.local_mtu = match self.tunnel_type {
                TunnelType::Ether => 0,
                TunnelType::Ayiya | TunnelType::V6V4 | TunnelType::Heartbeat => 1280,
                TunnelType::V4V4 | TunnelType::V4V6 => 1460,
            };
        }
        if self.remote_port == 0 && self.tunnel_type == TunnelType::Ayiya {
            self.remote_port = ayiya::AYIYA_PORT;
        }
        self
    }

    /// Interface name used for this endpoint's virtual device.
    pub fn ifname(&self) -> &'static str {
        match self.tunnel_type {
            TunnelType::V4V4 | TunnelType::V4V6 => "ipv4tun",
            _ => "ipv6tun",
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("tunnel_type", &self.tunnel_type)
            .field("local_ipv4", &self.local_ipv4)
            .field("local_ipv6", &self.local_ipv6)
            .field("remote_ipv4", &self.remote_ipv4)
            .field("remote_ipv6", &self.remote_ipv6)
            .field("local_prefix", &self.local_prefix)
            .field("local_mtu", &self.local_mtu)
            .field("remote_port", &self.remote_port)
            .field("password", &"<redacted>")
            .field("beat_interval", &self.beat_interval)
            .finish()
    }
}

/// IPv4 netmask with `prefix` leading one-bits, as a host-order `u32`
/// (compare against `Ipv4Addr::to_bits`).
pub(crate) fn netmask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - p),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, 0x0000_0000)]
    #[test_case(8, 0xff00_0000)]
    #[test_case(24, 0xffff_ff00)]
    #[test_case(30, 0xffff_fffc)]
    #[test_case(32, 0xffff_ffff)]
    fn netmask_from_prefix(prefix: u8, expected: u32) {
        assert_eq!(netmask(prefix), expected);
    }

    #[test]
    fn ayiya_defaults() {
        let ep = Endpoint::new(TunnelType::Ayiya).with_defaults();
        assert_eq!(ep.remote_port, 5072);
        assert_eq!(ep.local_mtu, 1280);
    }

    #[test]
    fn explicit_values_survive_defaults() {
        let mut ep = Endpoint::new(TunnelType::Ayiya);
        ep.remote_port = 8000;
        ep.local_mtu = 1400;
        let ep = ep.with_defaults();
        assert_eq!(ep.remote_port, 8000);
        assert_eq!(ep.local_mtu, 1400);
    }

    #[test_case(TunnelType::V4V4, 1460)]
    #[test_case(TunnelType::V4V6, 1460)]
    #[test_case(TunnelType::V6V4, 1280)]
    #[test_case(TunnelType::Heartbeat, 1280)]
    fn mtu_defaults(tunnel_type: TunnelType, mtu: u32) {
        assert_eq!(Endpoint::new(tunnel_type).with_defaults().local_mtu, mtu);
    }

    #[test]
    fn debug_redacts_password() {
        let mut ep = Endpoint::new(TunnelType::Ayiya);
        ep.password = "hunter2".into();
        let rendered = format!("{ep:?}");
        assert!(!rendered.contains("hunter2"));
    }
}
