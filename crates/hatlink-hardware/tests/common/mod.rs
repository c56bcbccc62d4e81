//! Shared helpers for the engine integration tests.
//!
//! Every test runs a [`MockFirmware`] over an in-memory duplex stream, with
//! timings shrunk so a full start-up (including the grace delay after a
//! reboot) takes a few tens of milliseconds.

#![allow(dead_code)]

use std::time::Duration;

use hatlink_core::PortId;
use hatlink_hardware::mock::{MOCK_FIRMWARE_VERSION, MockFirmware, MockHandle};
use hatlink_hardware::{Hat, HatBuilder, HatConfig, Timing};

/// Bound for waits that should succeed.
pub const WAIT: Duration = Duration::from_secs(2);

/// Timings for tests: short reads, no settling, quick grace delay.
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

/// Start an engine against `firmware` with [`fast_config`].
pub async fn start(firmware: MockFirmware) -> (Hat, MockHandle) {
    let (stream, handle) = firmware.spawn();
    let hat = HatBuilder::new()
        .config(fast_config())
        .start(stream)
        .await
        .expect("engine starts");
    (hat, handle)
}

/// Poll `condition` until it holds or `timeout` passes.
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
