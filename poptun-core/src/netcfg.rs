//! OS-side network configuration.
//!
//! Address assignment and routing are delegated to the platform's own
//! tooling; a tunnel runs these once from `start`, after the interface link
//! comes up.

use std::io;
use std::net::Ipv6Addr;
use std::process::Command;

use tracing::{debug, warn};

/// Assign `addr/prefix` to the interface.
#[cfg(target_os = "linux")]
pub fn add_ipv6_address(ifname: &str, addr: Ipv6Addr, prefix: u8) -> io::Result<()> {
    let mut cmd = Command::new("ip");
    cmd.args(["-6", "addr", "add", &format!("{addr}/{prefix}"), "dev", ifname]);
    run(cmd)
}

/// Assign `addr/prefix` to the interface.
#[cfg(target_os = "windows")]
pub fn add_ipv6_address(ifname: &str, addr: Ipv6Addr, prefix: u8) -> io::Result<()> {
    let mut cmd = Command::new("netsh");
    cmd.args(["interface", "ipv6", "set", "address", ifname, &addr.to_string()]);
    run(cmd)?;
    let mut cmd = Command::new("netsh");
    cmd.args([
        "interface",
        "ipv6",
        "add",
        "route",
        &format!("{addr}/{prefix}"),
        ifname,
    ]);
    run(cmd)
}

/// Assign `addr/prefix` to the interface.
#[cfg(not(any(target_os = "linux", target_os = "windows")))]
pub fn add_ipv6_address(ifname: &str, addr: Ipv6Addr, prefix: u8) -> io::Result<()> {
    let mut cmd = Command::new("ifconfig");
    cmd.args([
        ifname,
        "inet6",
        &addr.to_string(),
        "prefixlen",
        &prefix.to_string(),
        "alias",
    ]);
    run(cmd)
}

/// Install the default IPv6 route through the tunnel peer.
#[cfg(target_os = "linux")]
pub fn add_default_route6(via: Ipv6Addr) -> io::Result<()> {
    let mut cmd = Command::new("ip");
    cmd.args(["-6", "route", "add", "default", "via", &via.to_string()]);
    run(cmd)
}

/// Install the default IPv6 route through the tunnel peer.
#[cfg(target_os = "windows")]
pub fn add_default_route6(_via: Ipv6Addr) -> io::Result<()> {
    // Windows installs the route together with the address.
    Ok(())
}

/// Install the default IPv6 route through the tunnel peer.
#[cfg(not(any(target_os = "linux", target_os = "windows")))]
pub fn add_default_route6(via: Ipv6Addr) -> io::Result<()> {
    let mut cmd = Command::new("route");
    cmd.args(["add", "-inet6", "default", &via.to_string()]);
    run(cmd)
}

fn run(mut cmd: Command) -> io::Result<()> {
    debug!(?cmd, "running network configuration command");
    let status = cmd.status()?;
    if !status.success() {
        warn!(?cmd, %status, "network configuration command failed");
        return Err(io::Error::other(format!(
            "network configuration command exited with {status}"
        )));
    }
    Ok(())
}
