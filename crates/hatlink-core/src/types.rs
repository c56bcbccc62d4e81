use crate::{
    Result,
    constants::{MATRIX_TYPE_ID, NUM_PORTS},
    error::HatError,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the four physical ports, A-D (index 0-3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortId(u8);

impl PortId {
    /// All four ports in index order.
    pub const ALL: [PortId; NUM_PORTS] = [PortId(0), PortId(1), PortId(2), PortId(3)];

    /// Create a port from its numeric index.
    ///
    /// # Errors
    /// Returns `HatError::InvalidPort` if the index is not 0-3.
    pub fn new(index: u8) -> Result<Self> {
        if usize::from(index) >= NUM_PORTS {
            return Err(HatError::InvalidPort(format!(
                "port index must be 0-{}, got {index}",
                NUM_PORTS - 1
            )));
        }
        Ok(PortId(index))
    }

    /// Numeric index, usable as a wire port number.
    #[must_use]
    pub fn index(&self) -> usize {
        usize::from(self.0)
    }

    /// Port letter (`'A'`-`'D'`).
    #[must_use]
    pub fn letter(&self) -> char {
        char::from(b'A' + self.0)
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl std::str::FromStr for PortId {
    type Err = HatError;

    /// Accepts a letter (`A`-`D`, case-insensitive) or a digit (`0`-`3`).
    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.trim().chars();
        match (chars.next(), chars.next()) {
            (Some(c @ 'A'..='D'), None) => PortId::new(c as u8 - b'A'),
            (Some(c @ 'a'..='d'), None) => PortId::new(c as u8 - b'a'),
            (Some(c @ '0'..='3'), None) => PortId::new(c as u8 - b'0'),
            _ => Err(HatError::InvalidPort(format!("{s:?}"))),
        }
    }
}

impl TryFrom<usize> for PortId {
    type Error = HatError;

    fn try_from(index: usize) -> Result<Self> {
        u8::try_from(index)
            .map_err(|_| HatError::InvalidPort(index.to_string()))
            .and_then(PortId::new)
    }
}

/// Where the remote controller currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    /// Nothing recognisable answered the version probe.
    Unknown,
    /// Application firmware at the expected version.
    RunningFirmware,
    /// Application firmware at a different version.
    NeedsFirmwareUpdate,
    /// Recovery bootloader, ready for an upload.
    InBootloader,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LinkState::Unknown => write!(f, "unknown"),
            LinkState::RunningFirmware => write!(f, "running firmware"),
            LinkState::NeedsFirmwareUpdate => write!(f, "needs firmware update"),
            LinkState::InBootloader => write!(f, "in bootloader"),
        }
    }
}

/// Progress of the version-probe exchange during one detection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    #[default]
    NotStarted,
    ProbeSent,
    EchoConfirmed,
}

/// One numeric field of a data line.
///
/// Fields containing a `.` are floats, everything else is an integer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
}

impl Value {
    /// Widen to `f64`.
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::Int(v) => v as f64,
            Value::Float(v) => v,
        }
    }

    /// Narrow to `i64`, truncating floats toward zero.
    #[must_use]
    pub fn as_i64(&self) -> i64 {
        match *self {
            Value::Int(v) => v,
            Value::Float(v) => v as i64,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
        }
    }
}

/// A decoded data line: the values of one mode or combi mode, in wire order.
pub type Sample = Vec<Value>;

/// Name reported for a port with no device.
pub const DISCONNECTED_NAME: &str = "Disconnected";

/// Name reported for a type id outside the catalogue.
pub const UNKNOWN_NAME: &str = "Unknown";

// (type id, class name, description)
const CATALOGUE: &[(i32, &str, &str)] = &[
    (1, "PassiveMotor", "Medium Linear Motor"),
    (2, "PassiveMotor", "Train Motor"),
    (8, "Light", "Light"),
    (34, "TiltSensor", "WeDo 2.0 Tilt Sensor"),
    (35, "MotionSensor", "Motion Sensor"),
    (37, "ColorDistanceSensor", "Color & Distance Sensor"),
    (38, "Motor", "Medium Linear Motor"),
    (46, "Motor", "Large Motor"),
    (47, "Motor", "XL Motor"),
    (48, "Motor", "Medium Angular Motor (Cyan)"),
    (49, "Motor", "Large Angular Motor (Cyan)"),
    (61, "ColorSensor", "Color Sensor"),
    (62, "DistanceSensor", "Distance Sensor"),
    (63, "ForceSensor", "Force Sensor"),
    (MATRIX_TYPE_ID, "Matrix", "3x3 Color Light Matrix"),
    (65, "Motor", "Small Angular Motor"),
    (75, "Motor", "Medium Angular Motor (Grey)"),
    (76, "Motor", "Large Angular Motor (Grey)"),
];

/// Device class name for a type id.
///
/// # Examples
///
/// ```
/// use hatlink_core::device_name;
///
/// assert_eq!(device_name(48), "Motor");
/// assert_eq!(device_name(-1), "Disconnected");
/// assert_eq!(device_name(999), "Unknown");
/// ```
#[must_use]
pub fn device_name(type_id: i32) -> &'static str {
    if type_id == -1 {
        return DISCONNECTED_NAME;
    }
    CATALOGUE
        .iter()
        .find(|(id, _, _)| *id == type_id)
        .map_or(UNKNOWN_NAME, |(_, name, _)| *name)
}

/// Human-readable description for a type id.
#[must_use]
pub fn device_description(type_id: i32) -> &'static str {
    if type_id == -1 {
        return DISCONNECTED_NAME;
    }
    CATALOGUE
        .iter()
        .find(|(id, _, _)| *id == type_id)
        .map_or(UNKNOWN_NAME, |(_, _, desc)| *desc)
}

/// Snapshot of one port as last reported by the HAT.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortInfo {
    pub port: PortId,
    /// `-1` when nothing is attached.
    pub type_id: i32,
    pub connected: bool,
    pub name: &'static str,
    pub description: &'static str,
}

impl PortInfo {
    /// Build a snapshot, deriving name and description from the catalogue.
    #[must_use]
    pub fn new(port: PortId, type_id: i32, connected: bool) -> Self {
        Self {
            port,
            type_id,
            // A type id of -1 never counts as connected.
            connected: connected && type_id != -1,
            name: device_name(type_id),
            description: device_description(type_id),
        }
    }
}

/// Requested rotational sense for absolute positioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Shortest,
    Clockwise,
    Anticlockwise,
}

impl std::str::FromStr for Direction {
    type Err = HatError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "shortest" => Ok(Direction::Shortest),
            "clockwise" => Ok(Direction::Clockwise),
            "anticlockwise" => Ok(Direction::Anticlockwise),
            other => Err(HatError::DirectionInvalid(other.to_string())),
        }
    }
}

/// Behaviour of the two status LEDs on the HAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LedMode {
    /// Firmware drives the LEDs from the supply voltage.
    #[default]
    Voltage,
    Off,
    Orange,
    Green,
    Both,
}

impl LedMode {
    /// Argument of the `ledmode` command.
    #[must_use]
    pub fn wire_value(&self) -> i8 {
        match self {
            LedMode::Voltage => -1,
            LedMode::Off => 0,
            LedMode::Orange => 1,
            LedMode::Green => 2,
            LedMode::Both => 3,
        }
    }
}

/// Unit in which motor speeds are given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpeedUnit {
    #[default]
    Percent,
    Rpm,
}
