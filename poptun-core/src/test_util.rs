//! In-memory virtual interface for exercising the engine without a TAP
//! device or elevated privileges.

use std::collections::VecDeque;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::io::{LinkStatus, VirtualInterface};

pub(crate) struct MockInterface {
    hwaddr: [u8; 6],
    mtu: Mutex<u32>,
    status: Mutex<LinkStatus>,
    /// Frames queued for the engine to read.
    ingress: Mutex<VecDeque<Vec<u8>>>,
    ingress_ready: Condvar,
    /// Frames the engine wrote out.
    written: Mutex<Vec<Vec<u8>>>,
    fail_io: AtomicBool,
}

impl MockInterface {
    pub(crate) fn new() -> Self {
        Self {
            hwaddr: [0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
            mtu: Mutex::new(1500),
            status: Mutex::new(LinkStatus::AllDown),
            ingress: Mutex::new(VecDeque::new()),
            ingress_ready: Condvar::new(),
            written: Mutex::new(Vec::new()),
            fail_io: AtomicBool::new(false),
        }
    }

    pub(crate) fn status(&self) -> LinkStatus {
        *self.status.lock()
    }

    pub(crate) fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }

    /// Queue a frame for the engine's next interface read.
    pub(crate) fn push_frame(&self, frame: Vec<u8>) {
        self.ingress.lock().push_back(frame);
        self.ingress_ready.notify_all();
    }

    /// Make every subsequent I/O operation fail, simulating a dead device.
    pub(crate) fn fail_io(&self, fail: bool) {
        self.fail_io.store(fail, Ordering::SeqCst);
    }

    fn check_alive(&self) -> io::Result<()> {
        if self.fail_io.load(Ordering::SeqCst) {
            return Err(io::Error::other("mock interface failure"));
        }
        Ok(())
    }
}

impl VirtualInterface for MockInterface {
    fn name(&self) -> &str {
        "mock0"
    }

    fn hwaddr(&self) -> [u8; 6] {
        self.hwaddr
    }

    fn mtu(&self) -> io::Result<u32> {
        Ok(*self.mtu.lock())
    }

    fn set_mtu(&self, mtu: u32) -> io::Result<()> {
        *self.mtu.lock() = mtu;
        Ok(())
    }

    fn set_ipv4(&self, _addr: Ipv4Addr, _prefix: u8) -> io::Result<()> {
        Ok(())
    }

    fn set_status(&self, status: LinkStatus) -> io::Result<()> {
        *self.status.lock() = status;
        Ok(())
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        self.check_alive()?;
        let mut ingress = self.ingress.lock();
        if ingress.is_empty() {
            let _ = self.ingress_ready.wait_for(&mut ingress, timeout);
        }
        Ok(!ingress.is_empty())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_alive()?;
        let Some(frame) = self.ingress.lock().pop_front() else {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        };
        let len = frame.len().min(buf.len());
        buf[..len].copy_from_slice(&frame[..len]);
        Ok(len)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.check_alive()?;
        self.written.lock().push(buf.to_vec());
        Ok(buf.len())
    }
}
