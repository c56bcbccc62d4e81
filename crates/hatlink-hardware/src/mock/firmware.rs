//! Simulated HAT firmware and bootloader.
//!
//! [`MockFirmware`] runs an in-process controller on one end of a
//! `tokio::io::duplex` pair and hands the other end to the caller, so the
//! whole engine (boot detection, upload, reader loop, devices) can be
//! exercised without hardware.
//!
//! ```rust,no_run
//! use hatlink_core::{PortId, Value};
//! use hatlink_hardware::mock::MockFirmware;
//!
//! # async fn example() {
//! let port = PortId::new(0).unwrap();
//! let (stream, handle) = MockFirmware::new()
//!     .with_device(port, 61, vec![Value::Int(9)])
//!     .spawn();
//! // hand `stream` to HatBuilder::start, inspect `handle.commands()`
//! # }
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{Notify, mpsc};
use tracing::trace;

use hatlink_core::{
    PortId, Value,
    constants::{ETX, NUM_PORTS, STX},
};
use hatlink_protocol::checksum;

use super::reset::RecordingResetLines;

/// Version the simulated firmware reports unless told otherwise.
pub const MOCK_FIRMWARE_VERSION: u64 = 1_636_109_636;

const BOOTLOADER_REPLY: &str = "BuildHAT bootloader version 1.0 2021-10-26T10:18:13+00:00\r\n";
const PROMPT_REPLY: &str = "BHBL> ";

/// What the simulated controller is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockMode {
    Firmware { version: u64 },
    Bootloader,
    /// Answers nothing at all.
    Silent,
}

/// What the bootloader received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadRecord {
    pub firmware: Vec<u8>,
    pub signature: Vec<u8>,
    /// The announced checksum matched the received image.
    pub checksum_ok: bool,
}

#[derive(Debug, Clone)]
struct MockPort {
    type_id: i32,
    passive: bool,
    values: Vec<Value>,
    /// Simulated motor position in degrees.
    position: Option<f64>,
    /// Number of dataset pairs in combi slot 0.
    combi: Option<usize>,
}

impl Default for MockPort {
    fn default() -> Self {
        Self {
            type_id: -1,
            passive: false,
            values: Vec::new(),
            position: None,
            combi: None,
        }
    }
}

impl MockPort {
    fn sample(&self) -> Vec<Value> {
        match self.position {
            Some(degrees) => {
                let position = degrees.round() as i64;
                let absolute = (position + 180).rem_euclid(360) - 180;
                vec![Value::Int(0), Value::Int(position), Value::Int(absolute)]
            }
            None => self.values.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Payload {
    Firmware { len: usize, checksum: u32 },
    Signature { len: usize },
}

impl Payload {
    fn len(&self) -> usize {
        match *self {
            Payload::Firmware { len, .. } | Payload::Signature { len } => len,
        }
    }
}

#[derive(Debug)]
struct MockState {
    mode: MockMode,
    /// Version booted after leaving the bootloader.
    version: u64,
    ports: [MockPort; NUM_PORTS],
    voltage: f64,
    answer_ramps: bool,
    answer_pulses: bool,
    commands: Vec<String>,
    upload: Option<UploadRecord>,
    pending: Option<Payload>,
    current_port: usize,
}

enum Reply {
    Now(String),
    After(Duration, String),
}

struct MockShared {
    state: Mutex<MockState>,
    notify: Notify,
}

impl MockShared {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Builder for a simulated controller.
#[derive(Debug)]
pub struct MockFirmware {
    state: MockState,
}

impl Default for MockFirmware {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFirmware {
    /// Current firmware, no devices, 8.2 V supply.
    pub fn new() -> Self {
        Self {
            state: MockState {
                mode: MockMode::Firmware {
                    version: MOCK_FIRMWARE_VERSION,
                },
                version: MOCK_FIRMWARE_VERSION,
                ports: Default::default(),
                voltage: 8.2,
                answer_ramps: true,
                answer_pulses: true,
                commands: Vec::new(),
                upload: None,
                pending: None,
                current_port: 0,
            },
        }
    }

    /// Report `version` from the running firmware.
    pub fn firmware_version(mut self, version: u64) -> Self {
        self.state.mode = MockMode::Firmware { version };
        self
    }

    /// Start in the bootloader.
    pub fn in_bootloader(mut self) -> Self {
        self.state.mode = MockMode::Bootloader;
        self
    }

    /// Start unresponsive; a reset through [`MockHandle::reset_lines`]
    /// brings it to the bootloader.
    pub fn silent(mut self) -> Self {
        self.state.mode = MockMode::Silent;
        self
    }

    /// An active device that answers data requests with `values`.
    pub fn with_device(mut self, port: PortId, type_id: i32, values: Vec<Value>) -> Self {
        self.state.ports[port.index()] = MockPort {
            type_id,
            values,
            ..MockPort::default()
        };
        self
    }

    pub fn with_passive_device(mut self, port: PortId, type_id: i32) -> Self {
        self.state.ports[port.index()] = MockPort {
            type_id,
            passive: true,
            ..MockPort::default()
        };
        self
    }

    /// A motor at `position` degrees. Its samples are
    /// `[speed, position, absolute position]` and ramps move it.
    pub fn with_motor(mut self, port: PortId, type_id: i32, position: f64) -> Self {
        self.state.ports[port.index()] = MockPort {
            type_id,
            position: Some(position),
            ..MockPort::default()
        };
        self
    }

    pub fn with_voltage(mut self, volts: f64) -> Self {
        self.state.voltage = volts;
        self
    }

    /// Never report `ramp done`.
    pub fn without_ramp_done(mut self) -> Self {
        self.state.answer_ramps = false;
        self
    }

    /// Never report `pulse done`.
    pub fn without_pulse_done(mut self) -> Self {
        self.state.answer_pulses = false;
        self
    }

    /// Start the controller. Returns the host end of the link and a handle.
    pub fn spawn(self) -> (DuplexStream, MockHandle) {
        let (host, device) = tokio::io::duplex(64 * 1024);
        let (mut rx, mut tx) = tokio::io::split(device);
        let (out, mut outgoing) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(async move {
            while let Some(bytes) = outgoing.recv().await {
                if tx.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let shared = Arc::new(MockShared {
            state: Mutex::new(self.state),
            notify: Notify::new(),
        });
        let handle = MockHandle {
            shared: Arc::clone(&shared),
            out: out.clone(),
        };

        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(4096);
            loop {
                match rx.read_buf(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                while let Some(replies) = process(&shared, &mut buf) {
                    for reply in replies {
                        send_reply(&out, reply);
                    }
                    // Replies are queued before anyone hears the command arrived.
                    shared.notify.notify_waiters();
                }
            }
            trace!("Mock firmware stopped");
        });

        (host, handle)
    }
}

fn send_reply(out: &mpsc::UnboundedSender<Vec<u8>>, reply: Reply) {
    match reply {
        Reply::Now(text) => {
            let _ = out.send(text.into_bytes());
        }
        Reply::After(delay, text) => {
            let out = out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = out.send(text.into_bytes());
            });
        }
    }
}

/// Consume one command or payload from `buf`, if complete.
fn process(shared: &MockShared, buf: &mut BytesMut) -> Option<Vec<Reply>> {
    let mut state = shared.lock();

    if let Some(payload) = state.pending {
        let needed = payload.len() + 3;
        if buf.len() < needed {
            return None;
        }
        let frame = buf.split_to(needed);
        let framed = frame[0] == STX && frame[needed - 2] == ETX;
        let body = frame[1..needed - 2].to_vec();
        state.pending = None;
        return Some(state.receive_payload(payload, body, framed));
    }

    let end = buf.iter().position(|b| *b == b'\r')?;
    let raw = buf.split_to(end + 1);
    let line = String::from_utf8_lossy(&raw).trim().to_string();
    // Swallow the newline a terminal would add.
    if buf.first() == Some(&b'\n') {
        buf.advance(1);
    }
    Some(state.receive_command(&line))
}

impl MockState {
    fn receive_command(&mut self, line: &str) -> Vec<Reply> {
        if !line.is_empty() {
            self.commands.push(line.to_string());
        }
        match self.mode {
            MockMode::Silent => Vec::new(),
            MockMode::Bootloader => self.bootloader_command(line),
            MockMode::Firmware { version } => line
                .split(';')
                .map(str::trim)
                .filter(|segment| !segment.is_empty())
                .flat_map(|segment| self.firmware_segment(segment, version))
                .collect(),
        }
    }

    fn bootloader_command(&mut self, line: &str) -> Vec<Reply> {
        let mut words = line.split_whitespace();
        let reply = match words.next() {
            Some("version") => format!("{BOOTLOADER_REPLY}{PROMPT_REPLY}"),
            Some("clear") => {
                self.upload = Some(UploadRecord::default());
                PROMPT_REPLY.to_string()
            }
            Some("load") => {
                let len = words.next().and_then(|w| w.parse().ok()).unwrap_or(0);
                let checksum = words.next().and_then(|w| w.parse().ok()).unwrap_or(0);
                self.pending = Some(Payload::Firmware { len, checksum });
                return Vec::new();
            }
            Some("signature") => {
                let len = words.next().and_then(|w| w.parse().ok()).unwrap_or(0);
                self.pending = Some(Payload::Signature { len });
                return Vec::new();
            }
            Some("reboot") => {
                self.mode = MockMode::Firmware {
                    version: self.version,
                };
                return self.ports_initialised();
            }
            _ => PROMPT_REPLY.to_string(),
        };
        vec![Reply::Now(reply)]
    }

    fn receive_payload(&mut self, payload: Payload, body: Vec<u8>, framed: bool) -> Vec<Reply> {
        let upload = self.upload.get_or_insert_with(UploadRecord::default);
        match payload {
            Payload::Firmware { checksum: announced, .. } => {
                upload.checksum_ok = framed && checksum(&body) == announced;
                upload.firmware = body;
            }
            Payload::Signature { .. } => upload.signature = body,
        }
        vec![Reply::Now(PROMPT_REPLY.to_string())]
    }

    fn firmware_segment(&mut self, segment: &str, version: u64) -> Vec<Reply> {
        let mut words = segment.split_whitespace();
        let Some(command) = words.next() else {
            return Vec::new();
        };
        let port = self.current_port;
        let now = |text: String| vec![Reply::Now(text)];
        match command {
            "version" => now(format!(
                "Firmware version: {version} 2021-11-05T10:53:56+00:00\r\n"
            )),
            "list" => vec![Reply::Now(self.listing())],
            "vin" => now(format!("{:.1} V\r\n", self.voltage)),
            "reboot" => self.ports_initialised(),
            "port" => {
                if let Some(index) = words.next().and_then(|w| w.parse::<usize>().ok())
                    && index < NUM_PORTS
                {
                    self.current_port = index;
                }
                Vec::new()
            }
            "select" | "selonce" => match words.next().and_then(|w| w.parse::<u8>().ok()) {
                Some(mode) => self.sample_line(port, mode).map(now).unwrap_or_default(),
                None => Vec::new(),
            },
            "combi" => {
                let rest: Vec<&str> = words.skip(1).collect();
                self.ports[port].combi = (!rest.is_empty()).then_some(rest.len() / 2);
                Vec::new()
            }
            "set" => self.set_command(port, words.collect()),
            _ => Vec::new(),
        }
    }

    fn set_command(&mut self, port: usize, args: Vec<&str>) -> Vec<Reply> {
        let number = |i: usize| args.get(i).and_then(|w| w.parse::<f64>().ok());
        match args.first().copied() {
            Some("ramp") => {
                let (Some(target), Some(duration)) = (number(2), number(3)) else {
                    return Vec::new();
                };
                if let Some(position) = self.ports[port].position.as_mut() {
                    *position = target * 360.0;
                }
                self.completion(self.answer_ramps, duration, port, "ramp done")
            }
            Some("pulse") => {
                let Some(duration) = number(3) else {
                    return Vec::new();
                };
                self.completion(self.answer_pulses, duration, port, "pulse done")
            }
            _ => Vec::new(),
        }
    }

    fn completion(&self, answer: bool, seconds: f64, port: usize, what: &str) -> Vec<Reply> {
        if !answer {
            return Vec::new();
        }
        let delay = Duration::from_secs_f64(seconds.max(0.0));
        vec![Reply::After(delay, format!("P{port}: {what}\r\n"))]
    }

    fn sample_line(&self, port: usize, mode: u8) -> Option<String> {
        let slot = &self.ports[port];
        if slot.type_id == -1 {
            return None;
        }
        let sample = slot.sample();
        let (kind, values) = match slot.combi {
            Some(pairs) if mode == 0 => {
                let mut values: Vec<Value> = sample.into_iter().take(pairs).collect();
                values.resize(pairs, Value::Int(0));
                ('C', values)
            }
            _ if slot.position.is_some() => {
                let index = usize::from(mode).saturating_sub(1);
                ('M', sample.get(index).copied().into_iter().collect())
            }
            _ => ('M', sample),
        };
        let text: Vec<String> = values.iter().map(Value::to_string).collect();
        Some(format!("P{port}{kind}{mode}: {}\r\n", text.join(" ")))
    }

    fn listing(&self) -> String {
        let mut out = String::new();
        for (index, slot) in self.ports.iter().enumerate() {
            if slot.type_id == -1 {
                out.push_str(&format!("P{index}: no device detected\r\n"));
            } else if slot.passive {
                out.push_str(&format!(
                    "P{index}: connected to passive ID {:x}\r\n",
                    slot.type_id
                ));
            } else {
                out.push_str(&format!(
                    "P{index}: connected to active ID {:x}\r\ntype {:x}\r\n  nmodes =5\r\n",
                    slot.type_id, slot.type_id
                ));
            }
        }
        out
    }

    fn ports_initialised(&mut self) -> Vec<Reply> {
        for slot in &mut self.ports {
            slot.combi = None;
        }
        self.current_port = 0;
        vec![Reply::Now(format!(
            "Done initialising ports\r\n{}",
            self.listing()
        ))]
    }
}

/// Control and inspection of a running [`MockFirmware`].
#[derive(Clone)]
pub struct MockHandle {
    shared: Arc<MockShared>,
    out: mpsc::UnboundedSender<Vec<u8>>,
}

impl std::fmt::Debug for MockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockHandle")
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

impl MockHandle {
    /// Every command line received, without terminators.
    pub fn commands(&self) -> Vec<String> {
        self.shared.lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.shared.lock().commands.clear();
    }

    /// What the bootloader received, if an upload was started.
    pub fn upload(&self) -> Option<UploadRecord> {
        self.shared.lock().upload.clone()
    }

    pub fn mode(&self) -> MockMode {
        self.shared.lock().mode
    }

    /// Send a line to the host as if the controller printed it.
    pub fn inject_line(&self, line: &str) {
        let _ = self.out.send(format!("{line}\r\n").into_bytes());
    }

    /// Send raw bytes to the host.
    pub fn inject_bytes(&self, bytes: &[u8]) {
        let _ = self.out.send(bytes.to_vec());
    }

    /// Plug an active device into `port` and announce it.
    pub fn connect(&self, port: PortId, type_id: i32, values: Vec<Value>) {
        self.shared.lock().ports[port.index()] = MockPort {
            type_id,
            values,
            ..MockPort::default()
        };
        self.inject_line(&format!("P{}: connected to active ID {type_id:x}", port.index()));
    }

    /// Unplug whatever is on `port` and announce it.
    pub fn disconnect(&self, port: PortId) {
        self.shared.lock().ports[port.index()] = MockPort::default();
        self.inject_line(&format!("P{}: disconnected", port.index()));
    }

    /// Move a simulated motor by hand.
    pub fn set_position(&self, port: PortId, degrees: f64) {
        self.shared.lock().ports[port.index()].position = Some(degrees);
    }

    /// Reset lines wired to this controller: coming out of reset lands it
    /// in the bootloader.
    pub fn reset_lines(&self) -> RecordingResetLines {
        let shared = Arc::clone(&self.shared);
        RecordingResetLines::with_hook(move || {
            let mut state = shared.lock();
            state.mode = MockMode::Bootloader;
            state.pending = None;
        })
    }

    /// Wait until a received command contains `needle`.
    pub async fn wait_for_command(&self, needle: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.notify.notified();
            if self.commands().iter().any(|c| c.contains(needle)) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.commands().iter().any(|c| c.contains(needle));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link;

    fn port(index: u8) -> PortId {
        PortId::new(index).unwrap()
    }

    async fn exchange(
        handle: &MockHandle,
        reader: &mut link::LinkReader,
        writer: &link::LinkWriter,
        command: &str,
    ) -> Vec<String> {
        writer.write_command(command).await.unwrap();
        assert!(handle.wait_for_command(command.trim(), Duration::from_secs(1)).await);
        let mut lines = Vec::new();
        while let Some(line) = reader.read_line(Duration::from_millis(50)).await.unwrap() {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn test_list_and_version() {
        let (stream, handle) = MockFirmware::new()
            .with_device(port(0), 0x3d, vec![Value::Int(1)])
            .with_passive_device(port(2), 8)
            .spawn();
        let (mut reader, writer) = link::split(stream);

        let lines = exchange(&handle, &mut reader, &writer, "list\r").await;
        assert!(lines.contains(&"P0: connected to active ID 3d".to_string()));
        assert!(lines.contains(&"P1: no device detected".to_string()));
        assert!(lines.contains(&"P2: connected to passive ID 8".to_string()));

        let lines = exchange(&handle, &mut reader, &writer, "version\r").await;
        assert!(lines[0].starts_with("Firmware version: 1636109636"));
    }

    #[tokio::test]
    async fn test_combi_sample_length() {
        let (stream, handle) = MockFirmware::new()
            .with_device(port(1), 0x3d, vec![Value::Int(5), Value::Float(0.5)])
            .spawn();
        let (mut reader, writer) = link::split(stream);

        let command = "port 1 ; combi 0 1 0 2 0 3 0 ; selonce 0\r";
        let lines = exchange(&handle, &mut reader, &writer, command).await;
        assert_eq!(lines, ["P1C0: 5 0.5 0"]);
    }

    #[tokio::test]
    async fn test_bootloader_upload_checks_checksum() {
        let (stream, handle) = MockFirmware::new().in_bootloader().spawn();
        let (mut reader, writer) = link::split(stream);

        exchange(&handle, &mut reader, &writer, "clear\r").await;
        writer.write_command("load 5 1167\r").await.unwrap();
        writer.write_framed(b"hello", "firmware").await.unwrap();
        let lines = exchange(&handle, &mut reader, &writer, "signature 2\r").await;
        assert_eq!(lines, ["BHBL>"]);
        writer.write_framed(&[9, 9], "signature").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let upload = handle.upload().unwrap();
        assert_eq!(upload.firmware, b"hello");
        assert_eq!(upload.signature, [9, 9]);
        assert!(upload.checksum_ok);
    }
}
