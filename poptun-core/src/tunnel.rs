//! The tunnel supervisor: owns the workers of one tunnel and the shared
//! running flag, and exposes the start/stop/running lifecycle to the caller.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, MAX_PASSWORD_LEN, TunnelType};
use crate::io::VirtualInterfaceArg;
use crate::variant::{self, Variant};

/// Errors surfaced by tunnel construction and lifecycle operations.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// `start` was called while the tunnel was already running.
    #[error("tunnel is already running")]
    AlreadyRunning,
    /// The endpoint cannot describe a working tunnel.
    #[error("invalid endpoint: {0}")]
    Config(&'static str),
    /// The interface MTU could not be brought down far enough.
    #[error("could not lower the interface MTU to {0}")]
    Mtu(u32),
    /// Socket, interface or thread resources failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// State shared between the supervisor and every worker thread.
///
/// `running` is the only cross-thread signal: `stop` clears it, and a worker
/// that hits a fatal error clears it on the way out so its siblings wind
/// down within one poll interval. Workers take the lock only for that flag;
/// no lock is ever held across a blocking syscall.
pub(crate) struct Shared {
    pub(crate) endpoint: Endpoint,
    pub(crate) waitms: u64,
    running: Mutex<bool>,
}

impl Shared {
    pub(crate) fn is_running(&self) -> bool {
        *self.running.lock()
    }

    pub(crate) fn clear_running(&self) {
        *self.running.lock() = false;
    }
}

/// Worker handles, guarded by the join mutex.
struct Workers {
    joined: bool,
    beater: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

/// One tunnel: an endpoint, a variant strategy, and up to three workers.
///
/// Locking: the `running` mutex is always taken before the worker (join)
/// mutex, in `start` and `stop` alike. Workers take only the `running`
/// mutex, and joining happens only after the `running` mutex has been
/// released, so a worker blocked on its per-iteration flag check can always
/// proceed to exit. No lock-order or join-under-lock deadlock is possible.
pub struct Tunnel {
    shared: Arc<Shared>,
    variant: Arc<dyn Variant>,
    workers: Mutex<Workers>,
}

impl Tunnel {
    /// Default worker poll granularity in milliseconds.
    pub const DEFAULT_WAITMS: u64 = 100;

    /// Build a tunnel for `endpoint` on top of an opened virtual interface.
    ///
    /// Takes its own copy of the endpoint (defaults filled in first); the
    /// caller may drop or reuse the descriptor immediately. Sockets are
    /// allocated and the interface is configured here; failures surface as
    /// an error and release everything.
    pub fn new(endpoint: Endpoint, interface: VirtualInterfaceArg) -> Result<Self, TunnelError> {
        Self::with_waitms(endpoint, interface, Self::DEFAULT_WAITMS)
    }

    /// As [`Tunnel::new`] with an explicit poll granularity. `waitms` bounds
    /// the worst-case shutdown latency; zero gives a busy poll.
    pub fn with_waitms(
        endpoint: Endpoint,
        interface: VirtualInterfaceArg,
        waitms: u64,
    ) -> Result<Self, TunnelError> {
        if endpoint.password.len() > MAX_PASSWORD_LEN {
            return Err(TunnelError::Config("password exceeds 255 bytes"));
        }
        let shared = Arc::new(Shared {
            endpoint: endpoint.with_defaults(),
            waitms,
            running: Mutex::new(false),
        });
        let variant = variant::build(&shared, interface)?;
        Ok(Self {
            shared,
            variant,
            workers: Mutex::new(Workers {
                joined: true,
                beater: None,
                reader: None,
                writer: None,
            }),
        })
    }

    /// The endpoint this tunnel was built from (defaults filled in).
    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    /// Bring the link up and spawn the workers.
    ///
    /// Fails without side effects if the tunnel is already running. When the
    /// variant cannot start its data workers, any beater that was already
    /// spawned is joined again and the error is returned with the tunnel
    /// fully stopped.
    pub fn start(&self) -> Result<(), TunnelError> {
        let mut running = self.shared.running.lock();
        let mut workers = self.workers.lock();
        if *running {
            return Err(TunnelError::AlreadyRunning);
        }
        *running = true;
        workers.joined = false;

        let beater = if self.shared.endpoint.beat_interval > 0 && self.variant.beats() {
            let shared = self.shared.clone();
            let variant = self.variant.clone();
            thread::Builder::new()
                .name("tunnel-beater".into())
                .spawn(move || beater_loop(shared, variant))
                .map(Some)
                .map_err(TunnelError::from)
        } else {
            Ok(None)
        };

        let started = beater.and_then(|beater| {
            workers.beater = beater;
            self.variant.start()
        });

        match started {
            Ok(data) => {
                workers.reader = Some(data.reader);
                workers.writer = Some(data.writer);
                Ok(())
            }
            Err(err) => {
                *running = false;
                // Joining must happen outside the running lock: the beater
                // reads that flag once per iteration to decide to exit.
                drop(running);
                if let Some(beater) = workers.beater.take() {
                    let _ = beater.join();
                }
                workers.joined = true;
                Err(err)
            }
        }
    }

    /// Whether the data plane is alive. Turns false once `stop` is called or
    /// any worker hits a fatal error.
    pub fn running(&self) -> bool {
        self.shared.is_running()
    }

    /// Signal the workers to exit, join them, and bring the link down.
    ///
    /// Idempotent; safe to call from a thread other than the one that called
    /// `start`, including while a worker is mid-iteration. Returns once all
    /// workers of the current run have been joined.
    pub fn stop(&self) -> Result<(), TunnelError> {
        let mut running = self.shared.running.lock();
        *running = false;
        // Take the join lock before releasing the run lock so a concurrent
        // start cannot slip in between.
        let mut workers = self.workers.lock();
        drop(running);

        if workers.joined {
            return Ok(());
        }

        for handle in [
            workers.beater.take(),
            workers.reader.take(),
            workers.writer.take(),
        ]
        .into_iter()
        .flatten()
        {
            if handle.join().is_err() {
                warn!("a tunnel worker panicked");
            }
        }
        workers.joined = true;

        self.variant.stop()
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(%err, "error stopping tunnel during teardown");
        }
    }
}

/// Periodic keep-alive worker.
///
/// AYIYA tunnels open with two extra beats and heartbeat tunnels with one;
/// brokers expect the burst before they start forwarding.
fn beater_loop(shared: Arc<Shared>, variant: Arc<dyn Variant>) {
    info!("starting beater thread");

    match shared.endpoint.tunnel_type {
        TunnelType::Ayiya => {
            beat_once(&variant);
            beat_once(&variant);
        }
        TunnelType::Heartbeat => beat_once(&variant),
        _ => {}
    }

    let interval = i64::from(shared.endpoint.beat_interval) * 1000;
    let mut time_left: i64 = 0;
    loop {
        if time_left <= 0 {
            debug!("sending beat to the server");
            beat_once(&variant);
            time_left = interval;
        }

        thread::sleep(Duration::from_millis(shared.waitms));
        time_left -= shared.waitms as i64;

        if !shared.is_running() {
            break;
        }
    }

    shared.clear_running();
    info!("finished beater thread");
}

fn beat_once(variant: &Arc<dyn Variant>) {
    if let Err(err) = variant.beat() {
        warn!(%err, "sending beat failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VirtualInterface;
    use crate::test_util::MockInterface;
    use std::net::Ipv4Addr;
    use std::time::Instant;

    /// An ether endpoint: UDP socket, no privileges, no shell-outs.
    fn ether_endpoint() -> Endpoint {
        let mut ep = Endpoint::new(TunnelType::Ether);
        ep.remote_ipv4 = Ipv4Addr::new(198, 51, 100, 1);
        ep.remote_port = 5072;
        ep
    }

    fn ether_tunnel(interface: Arc<MockInterface>) -> Tunnel {
        Tunnel::with_waitms(ether_endpoint(), interface, 10).unwrap()
    }

    #[test]
    fn start_stop_restart_cycle() {
        let interface = Arc::new(MockInterface::new());
        let tunnel = ether_tunnel(interface.clone());

        assert!(!tunnel.running());
        tunnel.start().unwrap();
        assert!(tunnel.running());
        assert_eq!(interface.status(), crate::LinkStatus::Ipv4Up);

        thread::sleep(Duration::from_millis(50));
        let begun = Instant::now();
        tunnel.stop().unwrap();
        // Workers observe the cleared flag within one waitms plus their own
        // bounded poll.
        assert!(begun.elapsed() < Duration::from_millis(500));
        assert!(!tunnel.running());
        assert_eq!(interface.status(), crate::LinkStatus::AllDown);

        tunnel.start().unwrap();
        assert!(tunnel.running());
        tunnel.stop().unwrap();
    }

    #[test]
    fn double_start_fails_without_side_effects() {
        let tunnel = ether_tunnel(Arc::new(MockInterface::new()));
        tunnel.start().unwrap();
        assert!(matches!(tunnel.start(), Err(TunnelError::AlreadyRunning)));
        // The first run is untouched.
        assert!(tunnel.running());
        tunnel.stop().unwrap();
    }

    #[test]
    fn stop_without_start_is_a_noop() {
        let tunnel = ether_tunnel(Arc::new(MockInterface::new()));
        tunnel.stop().unwrap();
        tunnel.stop().unwrap();
        assert!(!tunnel.running());
    }

    #[test]
    fn drop_without_start_is_a_noop() {
        let tunnel = ether_tunnel(Arc::new(MockInterface::new()));
        drop(tunnel);
    }

    #[test]
    fn busy_poll_shutdown_is_bounded() {
        let interface = Arc::new(MockInterface::new());
        let tunnel = Tunnel::with_waitms(ether_endpoint(), interface, 0).unwrap();
        tunnel.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        tunnel.stop().unwrap();
        assert!(!tunnel.running());
    }

    #[test]
    fn worker_fatal_error_clears_running() {
        let interface = Arc::new(MockInterface::new());
        let tunnel = ether_tunnel(interface.clone());
        tunnel.start().unwrap();
        assert!(tunnel.running());

        // The writer hits the failure on its next readable-wait and takes
        // the whole data plane down with it.
        interface.fail_io(true);
        let deadline = Instant::now() + Duration::from_secs(2);
        while tunnel.running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!tunnel.running());

        tunnel.stop().unwrap();
    }

    #[test]
    fn ether_data_path_round_trip() {
        let peer = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let peer_port = peer.local_addr().unwrap().port();

        let mut ep = Endpoint::new(TunnelType::Ether);
        ep.remote_ipv4 = Ipv4Addr::LOCALHOST;
        ep.remote_port = peer_port;

        let interface = Arc::new(MockInterface::new());
        let tunnel = Tunnel::with_waitms(ep, interface.clone(), 10).unwrap();
        tunnel.start().unwrap();

        // Egress: an IPv6 frame read from the interface reaches the peer
        // unmodified.
        let mut frame = vec![0u8; 60];
        frame[12..14].copy_from_slice(&[0x86, 0xdd]);
        interface.push_frame(frame.clone());

        let mut buf = [0u8; 2048];
        let (len, engine_addr) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], &frame[..]);

        // Ingress: a frame from the configured remote lands on the
        // interface with the destination rewritten to the interface MAC.
        peer.send_to(&frame, engine_addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while interface.written().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let written = interface.written();
        assert_eq!(written.len(), 1);
        assert_eq!(&written[0][0..6], &interface.hwaddr());
        assert_eq!(&written[0][6..], &frame[6..]);

        tunnel.stop().unwrap();
    }

    #[test]
    fn long_password_is_rejected() {
        let mut ep = ether_endpoint();
        ep.password = "x".repeat(MAX_PASSWORD_LEN + 1);
        let result = Tunnel::new(ep, Arc::new(MockInterface::new()));
        assert!(matches!(result, Err(TunnelError::Config(_))));
    }
}
