//! Error types for HAT operations.
//!
//! A single tagged enum covers every failure a caller can observe, from a
//! missing HAT at startup to a wait that outlived its bound. Variants carry
//! the context fields (port, expected and found device) so callers can
//! pattern-match instead of parsing messages.

use std::fmt;

use thiserror::Error;

use crate::types::PortId;

/// Result type alias for HAT operations.
pub type Result<T> = std::result::Result<T, HatError>;

/// The asynchronous completion a caller was waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitKind {
    /// Next data sample for a port.
    PortData,
    /// A `set ramp` command reported completion.
    RampDone,
    /// A `set pulse` command reported completion.
    PulseDone,
    /// Supply voltage reply to `vin`.
    SupplyVoltage,
    /// Startup enumeration or post-reboot initialisation.
    Ready,
}

impl fmt::Display for WaitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PortData => write!(f, "port data"),
            Self::RampDone => write!(f, "ramp done"),
            Self::PulseDone => write!(f, "pulse done"),
            Self::SupplyVoltage => write!(f, "supply voltage"),
            Self::Ready => write!(f, "ready"),
        }
    }
}

/// Errors that can occur while driving the HAT.
#[derive(Debug, Error)]
pub enum HatError {
    /// No responsive HAT after a reset and reflash retry.
    #[error("HAT not found")]
    HatNotFound,

    /// The port already has a live owner.
    #[error("Port {port} already in use")]
    PortInUse { port: PortId },

    /// The port is empty or carries a different kind of device.
    #[error("There is not a {expected} connected to port {port} (found {found})")]
    DeviceNotFound {
        port: PortId,
        expected: String,
        found: String,
    },

    /// The device on the port changed since the handle was created.
    #[error("Device on port {port} has changed (expected type {expected}, found {found})")]
    DeviceChanged {
        port: PortId,
        expected: i32,
        found: i32,
    },

    /// An operation needs a simple or combi mode and none is selected.
    #[error("Port {port} is not in simple or combi mode")]
    InvalidMode { port: PortId },

    /// A wait exceeded its bound.
    #[error("Timed out waiting for {kind} after {duration_ms}ms")]
    Timeout { kind: WaitKind, duration_ms: u64 },

    /// A wait was abandoned because its port was released or the engine stopped.
    #[error("Wait for {kind} cancelled")]
    Cancelled { kind: WaitKind },

    /// Positioning direction is not one of shortest, clockwise, anticlockwise.
    #[error("Invalid direction {0:?}, should be: shortest, clockwise or anticlockwise")]
    DirectionInvalid(String),

    /// The HAT reported a checksum error on a device link.
    #[error("Checksum error reported on port {port}")]
    ChecksumMismatch { port: PortId },

    /// Argument outside its accepted range.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Port designator is not one of A-D / 0-3.
    #[error("Invalid port: {0}")]
    InvalidPort(String),

    /// Firmware upload failed.
    #[error("Firmware upload failed: {message}")]
    Firmware { message: String },

    /// The serial link was closed underneath the engine.
    #[error("Serial link closed")]
    LinkClosed,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A reset line could not be claimed or driven.
    #[error("GPIO {pin}: {message}")]
    Gpio { pin: u8, message: String },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HatError {
    /// Create a new timeout error.
    pub fn timeout(kind: WaitKind, duration: std::time::Duration) -> Self {
        Self::Timeout {
            kind,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a new cancellation error.
    pub fn cancelled(kind: WaitKind) -> Self {
        Self::Cancelled { kind }
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a new firmware upload error.
    pub fn firmware(message: impl Into<String>) -> Self {
        Self::Firmware {
            message: message.into(),
        }
    }

    /// Create a new GPIO error for BCM pin `pin`.
    pub fn gpio(pin: u8, message: impl fmt::Display) -> Self {
        Self::Gpio {
            pin,
            message: message.to_string(),
        }
    }

    /// Create a new device-not-found error.
    pub fn device_not_found(
        port: PortId,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self::DeviceNotFound {
            port,
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// True for timeouts, regardless of which wait expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_port_in_use_error() {
        let error = HatError::PortInUse {
            port: PortId::new(1).unwrap(),
        };
        assert_eq!(error.to_string(), "Port B already in use");
    }

    #[test]
    fn test_timeout_error() {
        let error = HatError::timeout(WaitKind::RampDone, Duration::from_millis(100));
        assert!(error.is_timeout());
        assert_eq!(error.to_string(), "Timed out waiting for ramp done after 100ms");
    }

    #[test]
    fn test_device_not_found_error() {
        let error = HatError::device_not_found(PortId::new(0).unwrap(), "Motor", "ColorSensor");
        assert_eq!(
            error.to_string(),
            "There is not a Motor connected to port A (found ColorSensor)"
        );
    }

    #[test]
    fn test_direction_invalid_error() {
        let error = HatError::DirectionInvalid("sideways".into());
        assert!(error.to_string().contains("\"sideways\""));
    }

    #[test]
    fn test_gpio_error() {
        let error = HatError::gpio(22, "pin busy");
        assert!(matches!(error, HatError::Gpio { pin: 22, .. }));
        assert_eq!(error.to_string(), "GPIO 22: pin busy");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let error: HatError = io.into();
        assert!(matches!(error, HatError::Io(_)));
    }
}
