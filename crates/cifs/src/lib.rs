#![forbid(unsafe_code)]
//! CIFS public API facade.
//!
//! Re-exports the session layer from `cifs-core` through a stable external
//! interface. Adapters and harnesses depend on this crate.

pub use cifs_core::*;
