//! In-process stand-ins for the hardware.
//!
//! Used by this crate's tests and by dependent crates' tests; nothing here
//! touches a real UART or GPIO.

pub mod firmware;
pub mod reset;

pub use firmware::{MOCK_FIRMWARE_VERSION, MockFirmware, MockHandle, MockMode, UploadRecord};
pub use reset::{LineEvent, RecordingResetLines};
