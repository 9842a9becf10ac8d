//! The poptun tunnel engine.
//!
//! A tunnel bridges a virtual L2 interface on the host to a remote peer
//! through one of several encapsulations: raw Ethernet frames over UDP,
//! AYIYA ("Anything-In-Anything", the shared-secret protocol spoken by IPv6
//! tunnel brokers), 6in4 with or without heartbeat keep-alives, and
//! IPv4-in-IPv4 / IPv4-in-IPv6. Each running tunnel owns a reader and a
//! writer thread, plus a beater thread when the endpoint asks for periodic
//! keep-alives; the [`Tunnel`] supervisor starts, observes and joins them.
//!
//! The virtual interface itself is a collaborator behind the
//! [`VirtualInterface`] trait; `poptun-app-utils` provides the TAP-backed
//! implementation.

#![warn(missing_docs)]

mod endpoint;
mod io;
pub mod netcfg;
mod tunnel;
mod variant;
pub mod wire;

#[cfg(test)]
pub(crate) mod test_util;

pub use endpoint::{Endpoint, TunnelType};
pub use io::{LinkStatus, VirtualInterface, VirtualInterfaceArg};
pub use tunnel::{Tunnel, TunnelError};

/// Scratch buffer size used by every worker. Large enough for a full frame
/// at any MTU a variant configures (<= 1500 plus encapsulation overhead).
pub(crate) const SCRATCH_LEN: usize = 4096;

/// Length of an Ethernet II header.
pub(crate) const ETHER_HEADER_LEN: usize = 14;
