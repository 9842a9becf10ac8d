//! Kernel TAP device behind the engine's `VirtualInterface` trait.

use std::io;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::time::Duration;

use anyhow::{Context, Result};
use poptun_core::{LinkStatus, VirtualInterface};
use tun_rs::{DeviceBuilder, Layer, SyncDevice};

/// A TAP device in L2 mode: reads and writes whole Ethernet frames.
pub struct Tap {
    dev: SyncDevice,
    name: String,
    hwaddr: [u8; 6],
}

impl Tap {
    /// Open (or create) the named TAP device, link down.
    pub fn open(name: &str) -> Result<Self> {
        let dev = DeviceBuilder::new()
            .name(name)
            .layer(Layer::L2)
            .enable(false)
            .build_sync()
            .context("TAP device creation")?;
        let name = dev.name().context("TAP device name")?;
        let hwaddr = dev.mac_address().context("TAP hardware address")?;
        Ok(Self { dev, name, hwaddr })
    }
}

impl VirtualInterface for Tap {
    fn name(&self) -> &str {
        &self.name
    }

    fn hwaddr(&self) -> [u8; 6] {
        self.hwaddr
    }

    fn mtu(&self) -> io::Result<u32> {
        Ok(u32::from(self.dev.mtu()?))
    }

    fn set_mtu(&self, mtu: u32) -> io::Result<()> {
        let mtu =
            u16::try_from(mtu).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        self.dev.set_mtu(mtu)
    }

    fn set_ipv4(&self, addr: Ipv4Addr, prefix: u8) -> io::Result<()> {
        self.dev.add_address_v4(addr, prefix)
    }

    fn set_status(&self, status: LinkStatus) -> io::Result<()> {
        self.dev.enabled(!matches!(status, LinkStatus::AllDown))
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut fds = libc::pollfd {
            fd: self.dev.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        #[allow(unsafe_code)]
        // SAFETY: `fds` points at exactly one valid pollfd for the whole
        // duration of the call.
        let ready = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
        match ready {
            -1 => Err(io::Error::last_os_error()),
            0 => Ok(false),
            _ => Ok(true),
        }
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.dev.recv(buf)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.dev.send(buf)
    }
}
