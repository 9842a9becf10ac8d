//! Heartbeat keep-alive messages for 6in4-heartbeat tunnels.
//!
//! A heartbeat is a single newline-free ASCII UDP payload:
//!
//! ```text
//! HEARTBEAT TUNNEL <local-ipv6> sender <unix-seconds> <md5-hex>
//! ```
//!
//! where `<md5-hex>` is the lowercase MD5 of the same string with the shared
//! password in place of the hex field. The POP uses it to refresh its record
//! of the client's current IPv4 address.

use std::fmt::Write;
use std::net::Ipv6Addr;

use md5::{Digest, Md5};

/// UDP port the POP listens on for heartbeats.
pub const HEARTBEAT_PORT: u16 = 3740;

/// Build the signed heartbeat payload.
pub fn message(local_ipv6: Ipv6Addr, epoch: u64, password: &str) -> String {
    let mut out = format!("HEARTBEAT TUNNEL {local_ipv6} sender {epoch} ");
    let digest = Md5::digest(format!("{out}{password}").as_bytes());
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(
        "fe80::1", 1_300_000_000, "secret",
        "HEARTBEAT TUNNEL fe80::1 sender 1300000000 018c4eb9b1d9d6d800df34c9b5079621";
        "loopback style address"
    )]
    #[test_case(
        "2001:db8::2", 1_234_567_890, "beatpw",
        "HEARTBEAT TUNNEL 2001:db8::2 sender 1234567890 4c8b1165a5e45a1a998a906ba66a1e89";
        "documentation address"
    )]
    fn reference_messages(addr: &str, epoch: u64, password: &str, expected: &str) {
        let addr: Ipv6Addr = addr.parse().unwrap();
        assert_eq!(message(addr, epoch, password), expected);
    }

    #[test]
    fn shape() {
        let msg = message("fe80::1".parse().unwrap(), 1, "pw");
        assert!(!msg.contains('\n'));
        let signature = msg.rsplit(' ').next().unwrap();
        assert_eq!(signature.len(), 32);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(signature, signature.to_lowercase());
    }
}
