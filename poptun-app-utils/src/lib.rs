//! Helpers for applications embedding the poptun engine: the TAP-backed
//! virtual interface collaborator.

#![warn(missing_docs)]

#[cfg(unix)]
mod tap;

#[cfg(unix)]
pub use tap::Tap;
