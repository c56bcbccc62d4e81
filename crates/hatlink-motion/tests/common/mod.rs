//! Shared helpers for the motor tests.

#![allow(dead_code)]

use std::time::Duration;

use hatlink_core::PortId;
use hatlink_hardware::mock::{MOCK_FIRMWARE_VERSION, MockFirmware, MockHandle};
use hatlink_hardware::{Hat, HatBuilder, HatConfig, Timing};

pub const WAIT: Duration = Duration::from_secs(2);

pub fn fast_config() -> HatConfig {
    HatConfig {
        firmware_version: Some(MOCK_FIRMWARE_VERSION),
        timing: Timing {
            read_timeout_ms: 20,
            probe_timeout_ms: 100,
            settle_delay_ms: 10,
            reset_hold_ms: 1,
            reset_recovery_ms: 5,
            upload_pause_ms: 2,
            done_grace_ms: 30,
            device_settle_ms: 0,
            connect_stale_ms: 100,
            startup_timeout_ms: 5000,
            wait_timeout_ms: 1000,
            motion_slack_ms: 500,
        },
        ..HatConfig::default()
    }
}

pub fn port(letter: &str) -> PortId {
    letter.parse().expect("valid port letter")
}

pub async fn start(firmware: MockFirmware) -> (Hat, MockHandle) {
    let (stream, handle) = firmware.spawn();
    let hat = HatBuilder::new()
        .config(fast_config())
        .start(stream)
        .await
        .expect("engine starts");
    (hat, handle)
}

/// `(from, to, duration)` of the last `set ramp` written.
pub fn last_ramp(handle: &MockHandle) -> Option<(f64, f64, f64)> {
    let commands = handle.commands();
    let command = commands.iter().rev().find(|c| c.contains("set ramp"))?;
    let (_, args) = command.split_once("set ramp ")?;
    let numbers: Vec<f64> = args
        .split_whitespace()
        .filter_map(|w| w.parse().ok())
        .collect();
    match numbers[..] {
        [from, to, duration, ..] => Some((from, to, duration)),
        _ => None,
    }
}

pub fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-4
}

pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
