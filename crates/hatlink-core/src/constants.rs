//! Wire-level constants for the HAT text protocol.
//!
//! The HAT speaks a line-oriented text protocol over a 115200 baud UART.
//! Commands are CR-terminated; responses and unsolicited events are
//! newline-terminated. Port status lines carry a `P<n>` prefix followed by
//! one of the status suffixes below:
//!
//! ```text
//! P0: connected to active ID 30
//! P1: no device detected
//! P0: ramp done
//! P2C0: 12 -37 180
//! 8.2 V
//! ```
//!
//! The bootloader uses a different, prompt-driven dialogue (`BHBL>`) and
//! accepts binary payloads framed by [`STX`] and [`ETX`].
//!
//! # Usage
//!
//! ```
//! use hatlink_core::constants::*;
//!
//! let line = "Firmware version: 1636109636 2021-11-05T10:53:56+00:00";
//! assert!(line.starts_with(FIRMWARE_BANNER));
//! assert_eq!(NUM_PORTS, 4);
//! ```

// ============================================================================
// Link parameters
// ============================================================================

/// UART baud rate of the HAT.
pub const BAUD_RATE: u32 = 115_200;

/// Default serial device on a Raspberry Pi.
pub const DEFAULT_DEVICE: &str = "/dev/serial0";

/// Number of physical ports (A-D).
pub const NUM_PORTS: usize = 4;

/// Command terminator.
pub const COMMAND_TERMINATOR: char = '\r';

/// Separator between chained commands on one line.
pub const COMMAND_SEPARATOR: &str = " ; ";

// ============================================================================
// Banners
// ============================================================================

/// Prefix of the application firmware's reply to `version`.
pub const FIRMWARE_BANNER: &str = "Firmware version: ";

/// Prefix of the bootloader's reply to `version`.
pub const BOOTLOADER_BANNER: &str = "BuildHAT bootloader version";

/// Bootloader prompt; signals readiness for the next upload step.
pub const PROMPT: &str = "BHBL>";

/// Printed by the firmware once it has finished initialising ports after a reboot.
pub const DONE_BANNER: &str = "Done initialising ports";

/// Fragment of the banner printed when a port link switches baud rate.
pub const BAUD_CHANGE_FRAGMENT: &str = "baud";

// ============================================================================
// Port status suffixes (after `P<n>`)
// ============================================================================

/// Active (UART-capable) device identified; followed by its hex type id.
pub const STATUS_CONNECTED_ACTIVE: &str = ": connected to active ID";

/// Passive device identified; followed by its hex type id.
pub const STATUS_CONNECTED_PASSIVE: &str = ": connected to passive ID";

/// Port started negotiating with a freshly plugged device.
pub const STATUS_CONNECTING: &str = ": connecting to active device";

/// Serial link to an active device established.
pub const STATUS_ESTABLISHED: &str = ": established serial communication with active ID";

/// Device unplugged.
pub const STATUS_DISCONNECTED: &str = ": disconnected";

/// Device stopped answering during the data phase.
pub const STATUS_DEVICE_TIMEOUT: &str = ": timeout during data phase: disconnecting";

/// Device link failed its checksum; the port disconnects.
pub const STATUS_CHECKSUM_ERROR: &str = ": checksum error: disconnecting";

/// Listing reply for an empty port.
pub const STATUS_NOT_CONNECTED: &str = ": no device detected";

/// A `set pulse` finished.
pub const STATUS_PULSE_DONE: &str = ": pulse done";

/// A `set ramp` finished.
pub const STATUS_RAMP_DONE: &str = ": ramp done";

/// Suffix of a supply voltage reply (`8.2 V`).
pub const VOLTAGE_SUFFIX: &str = " V";

/// Offset of the first value in a `P<n>C<i>:` / `P<n>M<i>:` data line.
pub const DATA_VALUES_OFFSET: usize = 5;

// ============================================================================
// Bootloader framing
// ============================================================================

/// Start of payload marker.
pub const STX: u8 = 0x02;

/// End of payload marker.
pub const ETX: u8 = 0x03;

/// Seed of the upload checksum.
pub const CHECKSUM_SEED: u32 = 1;

/// Feedback polynomial of the upload checksum.
pub const CHECKSUM_POLYNOMIAL: u32 = 0x1d87_2b41;

// ============================================================================
// GPIO
// ============================================================================

/// BCM number of the HAT reset line.
pub const RESET_GPIO: u8 = 4;

/// BCM number of the HAT boot-select line.
pub const BOOT0_GPIO: u8 = 22;

// ============================================================================
// Device behaviour
// ============================================================================

/// Type id of the 3x3 colour light matrix.
///
/// It must be powered as soon as it connects, and `off` wipes its state,
/// so it is blanked instead of powered down on release.
pub const MATRIX_TYPE_ID: i32 = 64;

/// Payload that blanks every pixel of the light matrix.
pub const MATRIX_BLANK: [u8; 10] = [0xc2, 0, 0, 0, 0, 0, 0, 0, 0, 0];

/// Default polling interval for motor feedback, in milliseconds.
pub const DEFAULT_SELRATE_MS: u32 = 10;

/// Maximum junk lines tolerated during boot detection.
pub const MAX_JUNK_LINES: u32 = 5;

/// Maximum consecutive empty reads during boot detection.
pub const MAX_EMPTY_READS: u32 = 3;

/// Maximum probe resends caused by handshake noise.
pub const MAX_HANDSHAKE_RETRIES: u32 = 5;

/// Maximum device negotiation lines read during boot detection.
pub const MAX_CHATTER_LINES: u32 = 32;

/// Maximum carriage returns sent while coaxing a bootloader prompt.
pub const MAX_PROMPT_POKES: u32 = 10;
