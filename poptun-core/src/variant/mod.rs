//! Tunnel variants: one encapsulation strategy per endpoint type.
//!
//! Every variant owns its socket and the shared virtual-interface handle
//! from construction to drop; `start`/`stop` flip the link state and the
//! worker threads but never reallocate resources. The supervisor drives
//! variants solely through [`Variant`] and stays oblivious to their private
//! state.

mod ayiya;
mod ether;
mod ipv4;
mod v6v4;

use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::info;

use crate::endpoint::TunnelType;
use crate::io::VirtualInterfaceArg;
use crate::tunnel::{Shared, TunnelError};

/// The per-variant operation set. Construction plays the `init` role and
/// `Drop` the `destroy` role of the contract.
pub(crate) trait Variant: Send + Sync {
    /// Bring the link up and spawn the reader and writer workers.
    fn start(&self) -> Result<DataWorkers, TunnelError>;

    /// Bring the link down. Worker joining is the supervisor's business.
    fn stop(&self) -> Result<(), TunnelError>;

    /// Emit one keep-alive.
    fn beat(&self) -> Result<(), TunnelError> {
        Ok(())
    }

    /// Whether this variant emits keep-alives; gates the beater thread.
    fn beats(&self) -> bool {
        false
    }
}

/// Handles of a freshly spawned reader/writer pair.
pub(crate) struct DataWorkers {
    pub(crate) reader: JoinHandle<()>,
    pub(crate) writer: JoinHandle<()>,
}

/// Select and construct the variant for the endpoint carried by `shared`.
pub(crate) fn build(
    shared: &Arc<Shared>,
    interface: VirtualInterfaceArg,
) -> Result<Arc<dyn Variant>, TunnelError> {
    Ok(match shared.endpoint.tunnel_type {
        TunnelType::Ether => Arc::new(ether::EtherTunnel::new(shared.clone(), interface)?),
        TunnelType::Ayiya => Arc::new(ayiya::AyiyaTunnel::new(shared.clone(), interface)?),
        TunnelType::V6V4 | TunnelType::Heartbeat => {
            Arc::new(v6v4::SixInFourTunnel::new(shared.clone(), interface)?)
        }
        TunnelType::V4V4 | TunnelType::V4V6 => {
            Arc::new(ipv4::Ipv4Tunnel::new(shared.clone(), interface)?)
        }
    })
}

/// Spawn a named worker thread.
pub(crate) fn spawn_worker<F>(name: &str, body: F) -> Result<JoinHandle<()>, TunnelError>
where
    F: FnOnce() + Send + 'static,
{
    Ok(std::thread::Builder::new()
        .name(name.to_string())
        .spawn(body)?)
}

/// Drive one worker until the tunnel stops or a cycle reports a fatal
/// condition. The flag check sits at the end of each iteration; a worker
/// that exits for its own reasons clears the flag so its siblings wind down
/// within one poll interval.
pub(crate) fn run_worker<F>(shared: &Shared, name: &str, mut cycle: F)
where
    F: FnMut() -> ControlFlow<()>,
{
    info!("starting {name} thread");
    loop {
        if cycle().is_break() {
            break;
        }
        if !shared.is_running() {
            break;
        }
    }
    shared.clear_running();
    info!("finished {name} thread");
}

/// Lower the interface MTU, tolerating devices that refuse as long as their
/// current MTU is already small enough.
pub(crate) fn apply_mtu(interface: &VirtualInterfaceArg, mtu: u32) -> Result<(), TunnelError> {
    if interface.set_mtu(mtu).is_err() && interface.mtu()? > mtu {
        return Err(TunnelError::Mtu(mtu));
    }
    Ok(())
}
