use hatlink_core::{
    LedMode, PortId,
    constants::{COMMAND_SEPARATOR, COMMAND_TERMINATOR},
};

/// Builder for chained HAT commands with a fluent API.
///
/// Segments are joined with ` ; ` and the result is terminated with `\r`.
/// A `port` segment switches the target of the segments that follow it.
///
/// # Example
/// ```
/// use hatlink_core::PortId;
/// use hatlink_protocol::CommandBuilder;
///
/// let port = PortId::new(2).unwrap();
/// let cmd = CommandBuilder::for_port(port).select(Some(0)).selrate(10).build();
/// assert_eq!(cmd, "port 2 ; select 0 ; selrate 10\r");
/// ```
#[derive(Debug, Clone, Default)]
pub struct CommandBuilder {
    segments: Vec<String>,
}

impl CommandBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder whose first segment targets `port`.
    pub fn for_port(port: PortId) -> Self {
        Self::new().port(port)
    }

    /// Append a raw segment.
    pub fn segment(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    /// `port <n>`: direct the following segments at `port`.
    pub fn port(self, port: PortId) -> Self {
        self.segment(format!("port {}", port.index()))
    }

    /// `select <mode>`, or a bare `select` to stop streaming.
    pub fn select(self, mode: Option<u8>) -> Self {
        match mode {
            Some(mode) => self.segment(format!("select {mode}")),
            None => self.segment("select"),
        }
    }

    /// `selonce <mode>`: request a single sample.
    pub fn selonce(self, mode: u8) -> Self {
        self.segment(format!("selonce {mode}"))
    }

    /// `selrate <ms>`: streaming interval.
    pub fn selrate(self, interval_ms: u32) -> Self {
        self.segment(format!("selrate {interval_ms}"))
    }

    /// `combi <index> <mode dataset ...>`; an empty list clears the slot.
    pub fn combi(self, index: u8, pairs: &[(u8, u8)]) -> Self {
        let mut segment = format!("combi {index}");
        for (mode, dataset) in pairs {
            segment.push_str(&format!(" {mode} {dataset}"));
        }
        self.segment(segment)
    }

    /// `set ramp <from> <to> <duration> 0`: linear position ramp in rotations.
    pub fn set_ramp(self, from: f64, to: f64, duration: f64) -> Self {
        self.segment(format!("set ramp {from} {to} {duration} 0"))
    }

    /// `set pulse <speed> 0.0 <seconds> 0`: constant speed for a time.
    pub fn set_pulse(self, speed: f64, seconds: f64) -> Self {
        self.segment(format!("set pulse {speed} 0.0 {seconds} 0"))
    }

    /// `set <value>`: setpoint for the active controller.
    pub fn set(self, value: f64) -> Self {
        self.segment(format!("set {value}"))
    }

    /// PID profile; `profile` is the argument list after the port number.
    pub fn pid(self, port: PortId, profile: &str) -> Self {
        self.segment(format!("pid {} {profile}", port.index()))
    }

    /// Differential PID profile used for speed control in RPM.
    pub fn pid_diff(self, port: PortId, profile: &str) -> Self {
        self.segment(format!("pid_diff {} {profile}", port.index()))
    }

    /// `plimit <0..1>`: supply limit of the port driver.
    pub fn plimit(self, limit: f64) -> Self {
        self.segment(format!("plimit {limit}"))
    }

    /// `port_plimit <0..1>`: motor power limit.
    pub fn port_plimit(self, limit: f64) -> Self {
        self.segment(format!("port_plimit {limit}"))
    }

    /// `pwmparams <threshold> <min>`.
    pub fn pwmparams(self, pwmthresh: f64, minpwm: f64) -> Self {
        self.segment(format!("pwmparams {pwmthresh} {minpwm}"))
    }

    /// `pwm`: switch to open-loop drive.
    pub fn pwm(self) -> Self {
        self.segment("pwm")
    }

    pub fn coast(self) -> Self {
        self.segment("coast")
    }

    pub fn on(self) -> Self {
        self.segment("on")
    }

    pub fn off(self) -> Self {
        self.segment("off")
    }

    /// `write1 <hex bytes>`: raw message to the device.
    pub fn write1(self, bytes: &[u8]) -> Self {
        let hex: Vec<String> = bytes.iter().map(|b| format!("{b:x}")).collect();
        self.segment(format!("write1 {}", hex.join(" ")))
    }

    /// `echo <0|1>`.
    pub fn echo(self, enabled: bool) -> Self {
        self.segment(format!("echo {}", u8::from(enabled)))
    }

    /// True if no segment has been added.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Join the segments into one terminated command line.
    pub fn build(&self) -> String {
        let mut line = self.segments.join(COMMAND_SEPARATOR);
        line.push(COMMAND_TERMINATOR);
        line
    }
}

/// Stand-alone commands that do not target a port.
pub mod commands {
    use super::*;

    /// `version`: ask firmware or bootloader to identify itself.
    pub fn version() -> String {
        "version\r".to_string()
    }

    /// `list`: report the device on every port.
    pub fn list() -> String {
        "list\r".to_string()
    }

    /// `vin`: report the supply voltage.
    pub fn vin() -> String {
        "vin\r".to_string()
    }

    pub fn reboot() -> String {
        "reboot\r".to_string()
    }

    /// `clear`: reset the bootloader's upload buffer.
    pub fn clear() -> String {
        "clear\r".to_string()
    }

    /// `load <len> <checksum>`: announce a firmware image.
    pub fn load(len: usize, checksum: u32) -> String {
        format!("load {len} {checksum}\r")
    }

    /// `signature <len>`: announce the image signature.
    pub fn signature(len: usize) -> String {
        format!("signature {len}\r")
    }

    pub fn ledmode(mode: LedMode) -> String {
        format!("ledmode {}\r", mode.wire_value())
    }

    /// Stop streaming on every port and turn off command echo.
    pub fn deselect_all() -> String {
        PortId::ALL
            .iter()
            .fold(CommandBuilder::new(), |b, port| b.port(*port).select(None))
            .echo(false)
            .build()
    }
}
