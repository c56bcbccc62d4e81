//! Host-side engine for the Raspberry Pi Build HAT.
//!
//! The HAT is a microcontroller with four LEGO device ports behind a single
//! UART. This crate owns that link: it brings the controller up (probing the
//! boot state, pulsing the reset lines and uploading firmware when needed),
//! runs the reader loop that turns the HAT's text output into port state and
//! completed waits, and hands out exclusive [`Device`] handles per port.
//!
//! # Bring-up
//!
//! ```no_run
//! use std::time::Duration;
//! use hatlink_hardware::{HatBuilder, HatConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = HatConfig::load("hatlink.toml").await?;
//! let hat = HatBuilder::new().config(config).open().await?;
//! println!("supply: {:.1} V", hat.voltage(Duration::from_secs(1)).await?);
//! hat.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency
//!
//! - One reader task owns the read half of the link.
//! - Writes from any task are serialized by [`link::LinkWriter`].
//! - Blocking operations register a [`sync::Pending`] before writing and are
//!   always bounded by a timeout.
//! - Data callbacks are async and run on a dedicated worker ([`dispatch`]),
//!   so a callback may itself write to the HAT and await the answer.
//!
//! # Testing without hardware
//!
//! [`mock::MockFirmware`] simulates the controller (firmware and bootloader)
//! over an in-memory duplex stream; [`HatBuilder::start`] accepts any
//! `AsyncRead + AsyncWrite` stream.

pub mod boot;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod engine;
pub mod gpio;
pub mod link;
pub mod loader;
pub mod mock;
mod reader;
pub mod registry;
pub mod sync;

pub use config::{HatConfig, Timing};
pub use device::{Device, Mode};
pub use dispatch::Callback;
pub use engine::{Hat, HatBuilder};
pub use gpio::{NoopResetLines, ResetLines};
#[cfg(all(feature = "gpio", target_os = "linux"))]
pub use gpio::PiResetLines;
pub use loader::FirmwareImage;
pub use registry::{Ownership, PortOwner};
pub use sync::Pending;
