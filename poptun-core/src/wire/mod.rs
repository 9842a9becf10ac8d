//! Wire formats: pure functions over byte buffers.
//!
//! Everything here operates on borrowed buffers so the workers can do their
//! frame surgery in place on a single scratch buffer per thread.

pub mod arp;
pub mod ayiya;
pub mod ethernet;
pub mod heartbeat;
pub mod ndp;

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch.
pub(crate) fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
