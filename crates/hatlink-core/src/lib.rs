//! Shared building blocks for the hatlink workspace.
//!
//! This crate holds the pieces every other hatlink crate agrees on: the
//! error taxonomy, the wire-level constants of the HAT text protocol, and
//! the small domain types (ports, link states, samples, device catalogue).

pub mod constants;
pub mod error;
pub mod types;

pub use error::{HatError, Result, WaitKind};
pub use types::*;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
