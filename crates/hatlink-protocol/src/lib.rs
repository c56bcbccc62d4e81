//! Wire protocol of the HAT: upload checksum, line framing, line
//! classification and command formatting.
//!
//! Nothing in this crate performs I/O. The hardware crate drives the
//! [`HatLineCodec`] over a serial stream, feeds each line to [`parse_line`]
//! and writes strings produced by [`CommandBuilder`] and [`commands`].

pub mod builder;
pub mod checksum;
pub mod codec;
pub mod parser;

pub use builder::{CommandBuilder, commands};
pub use checksum::checksum;
pub use codec::HatLineCodec;
pub use parser::{PortStatus, WireEvent, parse_line};
