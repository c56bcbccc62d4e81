//! Classification of lines received from the HAT.
//!
//! [`parse_line`] turns one trimmed line into a [`WireEvent`]. Lines the
//! classifier does not recognise yield `None`: the link carries negotiation
//! chatter from devices being plugged in, and the reader ignores it.
//!
//! | Line | Event |
//! |---|---|
//! | `Firmware version: 1636109636 ...` | [`WireEvent::FirmwareBanner`] |
//! | `BuildHAT bootloader version ...` | [`WireEvent::BootloaderBanner`] |
//! | `BHBL>` | [`WireEvent::Prompt`] |
//! | `Done initialising ports` | [`WireEvent::PortsInitialised`] |
//! | `P0: connected to active ID 30` | [`WireEvent::Port`] |
//! | `P2C0: 12 -37 180.5` | [`WireEvent::Data`] |
//! | `8.2 V` | [`WireEvent::Voltage`] |

use hatlink_core::{
    PortId, Sample, Value,
    constants::{
        BAUD_CHANGE_FRAGMENT, BOOTLOADER_BANNER, DATA_VALUES_OFFSET, DONE_BANNER, FIRMWARE_BANNER,
        PROMPT, STATUS_CHECKSUM_ERROR, STATUS_CONNECTED_ACTIVE, STATUS_CONNECTED_PASSIVE,
        STATUS_CONNECTING, STATUS_DEVICE_TIMEOUT, STATUS_DISCONNECTED, STATUS_ESTABLISHED,
        STATUS_NOT_CONNECTED, STATUS_PULSE_DONE, STATUS_RAMP_DONE, VOLTAGE_SUFFIX,
    },
};

/// Status reported on a `P<n>:` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortStatus {
    /// Active device with its type id.
    ConnectedActive(i32),
    /// Passive device with its type id.
    ConnectedPassive(i32),
    /// Listing reply for an empty port.
    NotConnected,
    Connecting,
    SerialEstablished,
    Disconnected,
    DeviceTimeout,
    ChecksumError,
    RampDone,
    PulseDone,
    BaudChange,
}

impl PortStatus {
    /// Type id carried by a connection status.
    pub fn type_id(&self) -> Option<i32> {
        match *self {
            PortStatus::ConnectedActive(id) | PortStatus::ConnectedPassive(id) => Some(id),
            _ => None,
        }
    }

    /// Statuses that leave the port without a device.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            PortStatus::Disconnected
                | PortStatus::DeviceTimeout
                | PortStatus::ChecksumError
                | PortStatus::NotConnected
        )
    }

    /// Statuses that answer one port of a `list` command.
    pub fn is_listing_reply(&self) -> bool {
        matches!(
            self,
            PortStatus::ConnectedActive(_)
                | PortStatus::ConnectedPassive(_)
                | PortStatus::NotConnected
        )
    }

    /// Negotiation chatter from a device that is still being brought up.
    pub fn is_chatter(&self) -> bool {
        matches!(
            self,
            PortStatus::Connecting | PortStatus::SerialEstablished | PortStatus::BaudChange
        )
    }
}

/// A classified line.
#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    Port {
        port: PortId,
        status: PortStatus,
    },
    Data {
        port: PortId,
        values: Sample,
    },
    Voltage(f64),
    /// `version` reply from the application firmware.
    ///
    /// `version` is `None` when the number after the banner does not parse.
    FirmwareBanner {
        version: Option<u64>,
    },
    BootloaderBanner,
    Prompt,
    /// The firmware finished bringing up its ports after a reboot.
    PortsInitialised,
}

impl WireEvent {
    /// True for lines a device emits while still negotiating.
    pub fn is_connection_chatter(&self) -> bool {
        matches!(self, WireEvent::Port { status, .. } if status.is_chatter())
    }
}

/// Classify one trimmed line.
///
/// # Examples
///
/// ```
/// use hatlink_core::PortId;
/// use hatlink_protocol::{PortStatus, WireEvent, parse_line};
///
/// assert_eq!(
///     parse_line("P1: connected to active ID 30"),
///     Some(WireEvent::Port {
///         port: PortId::new(1).unwrap(),
///         status: PortStatus::ConnectedActive(0x30),
///     })
/// );
/// assert_eq!(parse_line("8.2 V"), Some(WireEvent::Voltage(8.2)));
/// assert_eq!(parse_line("garbage"), None);
/// ```
pub fn parse_line(line: &str) -> Option<WireEvent> {
    if line.starts_with(PROMPT) {
        return Some(WireEvent::Prompt);
    }
    if let Some(rest) = line.strip_prefix(FIRMWARE_BANNER) {
        let version = rest.split(' ').next().and_then(|v| v.parse().ok());
        return Some(WireEvent::FirmwareBanner { version });
    }
    if line.starts_with(BOOTLOADER_BANNER) {
        return Some(WireEvent::BootloaderBanner);
    }
    if line.starts_with(DONE_BANNER) {
        return Some(WireEvent::PortsInitialised);
    }

    let bytes = line.as_bytes();
    if bytes.len() >= 3 && bytes[0] == b'P' {
        let port = port_from_digit(bytes[1])?;
        return match bytes[2] {
            b':' => parse_status(&line[2..]).map(|status| WireEvent::Port { port, status }),
            b'C' | b'M' => {
                parse_values(line.get(DATA_VALUES_OFFSET..)?).map(|values| WireEvent::Data {
                    port,
                    values,
                })
            }
            _ => None,
        };
    }

    parse_voltage(line).map(WireEvent::Voltage)
}

fn port_from_digit(digit: u8) -> Option<PortId> {
    if !digit.is_ascii_digit() {
        return None;
    }
    PortId::new(digit - b'0').ok()
}

/// Classify the part of a status line starting at the `:`.
fn parse_status(msg: &str) -> Option<PortStatus> {
    if let Some(rest) = msg.strip_prefix(STATUS_CONNECTED_ACTIVE) {
        return parse_type_id(rest).map(PortStatus::ConnectedActive);
    }
    if let Some(rest) = msg.strip_prefix(STATUS_CONNECTED_PASSIVE) {
        return parse_type_id(rest).map(PortStatus::ConnectedPassive);
    }

    let status = if msg.starts_with(STATUS_DISCONNECTED) {
        PortStatus::Disconnected
    } else if msg.starts_with(STATUS_DEVICE_TIMEOUT) {
        PortStatus::DeviceTimeout
    } else if msg.starts_with(STATUS_CHECKSUM_ERROR) {
        PortStatus::ChecksumError
    } else if msg.starts_with(STATUS_NOT_CONNECTED) {
        PortStatus::NotConnected
    } else if msg.starts_with(STATUS_RAMP_DONE) {
        PortStatus::RampDone
    } else if msg.starts_with(STATUS_PULSE_DONE) {
        PortStatus::PulseDone
    } else if msg.starts_with(STATUS_CONNECTING) {
        PortStatus::Connecting
    } else if msg.starts_with(STATUS_ESTABLISHED) {
        PortStatus::SerialEstablished
    } else if msg.contains(BAUD_CHANGE_FRAGMENT) {
        PortStatus::BaudChange
    } else {
        return None;
    };
    Some(status)
}

/// Type ids are printed in hex.
fn parse_type_id(rest: &str) -> Option<i32> {
    i32::from_str_radix(rest.trim(), 16).ok()
}

/// Space-separated numbers; a token containing `.` is a float.
fn parse_values(text: &str) -> Option<Sample> {
    text.split(' ')
        .filter(|token| !token.is_empty())
        .map(|token| {
            if token.contains('.') {
                token.parse().ok().map(Value::Float)
            } else {
                token.parse().ok().map(Value::Int)
            }
        })
        .collect()
}

/// `<digit>.<digits> V`
fn parse_voltage(line: &str) -> Option<f64> {
    let bytes = line.as_bytes();
    if bytes.len() < 5 || bytes[1] != b'.' || !line.ends_with(VOLTAGE_SUFFIX) {
        return None;
    }
    line.split(' ').next()?.parse().ok()
}
