//! Engine configuration.
//!
//! [`HatConfig`] names the serial device, the firmware files and the
//! firmware version the host expects, plus a [`Timing`] block holding every
//! delay and bound the engine uses. Every field except `firmware_version`
//! has a default, so a TOML file names the version and whatever else differs:
//!
//! ```toml
//! device = "/dev/ttyAMA0"
//! firmware_version = 1636109636
//!
//! [timing]
//! wait_timeout_ms = 2000
//! ```
//!
//! # Examples
//!
//! ```
//! use hatlink_hardware::config::HatConfig;
//!
//! let config = HatConfig::from_toml_str("firmware_version = 42").unwrap();
//! assert_eq!(config.firmware_version, Some(42));
//! assert!(HatConfig::from_toml_str("baud_rate = 115200").is_err());
//! assert_eq!(config.baud_rate, 115_200);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hatlink_core::{
    HatError, Result,
    constants::{BAUD_RATE, DEFAULT_DEVICE},
};

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HatConfig {
    /// Serial device the HAT is attached to.
    pub device: String,

    pub baud_rate: u32,

    /// Application firmware image uploaded when the HAT needs flashing.
    pub firmware_path: PathBuf,

    /// Signature accompanying the firmware image.
    pub signature_path: PathBuf,

    /// Version number the running firmware must report. Required: a HAT
    /// reporting any other version is reflashed.
    pub firmware_version: Option<u64>,

    pub timing: Timing,
}

impl Default for HatConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            baud_rate: BAUD_RATE,
            firmware_path: PathBuf::from("data/firmware.bin"),
            signature_path: PathBuf::from("data/signature.bin"),
            firmware_version: None,
            timing: Timing::default(),
        }
    }
}

impl HatConfig {
    /// Parse a configuration from TOML text.
    ///
    /// # Errors
    /// Returns `HatError::Config` if the text is not valid TOML for this
    /// structure or fails [`validate`](Self::validate).
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: HatConfig =
            toml::from_str(text).map_err(|e| HatError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    ///
    /// # Errors
    /// Returns `HatError::Io` if the file cannot be read, or
    /// `HatError::Config` if its content is invalid.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&text)
    }

    /// Reject values the engine cannot work with.
    ///
    /// # Errors
    /// Returns `HatError::Config` describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.device.trim().is_empty() {
            return Err(HatError::Config("device path must not be empty".into()));
        }
        if self.baud_rate == 0 {
            return Err(HatError::Config("baud_rate must be non-zero".into()));
        }
        if self.timing.read_timeout_ms == 0 {
            return Err(HatError::Config("read_timeout_ms must be non-zero".into()));
        }
        self.expected_version()?;
        Ok(())
    }

    /// The firmware version the HAT must report.
    ///
    /// # Errors
    /// Returns `HatError::Config` when no version is configured.
    pub fn expected_version(&self) -> Result<u64> {
        self.firmware_version
            .ok_or_else(|| HatError::Config("firmware_version must be set".into()))
    }
}

/// Delays and bounds, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Line read bound in the reader loop; also how often it checks for shutdown.
    pub read_timeout_ms: u64,
    /// Line read bound while probing the boot state.
    pub probe_timeout_ms: u64,
    /// Sleep after device negotiation chatter was seen during the probe.
    pub settle_delay_ms: u64,
    /// Width of the reset pulse.
    pub reset_hold_ms: u64,
    /// Sleep after the reset lines are released.
    pub reset_recovery_ms: u64,
    /// Pause between announcing an upload and sending its payload.
    pub upload_pause_ms: u64,
    /// Delay between "Done initialising ports" and the ready signal.
    pub done_grace_ms: u64,
    /// Minimum engine age before the reader may stop.
    pub device_settle_ms: u64,
    /// A port still negotiating after this long no longer holds up shutdown.
    pub connect_stale_ms: u64,
    /// Bound on start-up, from first probe to ready.
    pub startup_timeout_ms: u64,
    /// Default bound for sample, voltage and completion waits.
    pub wait_timeout_ms: u64,
    /// Added to a computed ramp or pulse duration to bound its wait.
    pub motion_slack_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            read_timeout_ms: 1000,
            probe_timeout_ms: 5000,
            settle_delay_ms: 2000,
            reset_hold_ms: 10,
            reset_recovery_ms: 500,
            upload_pause_ms: 100,
            done_grace_ms: 8000,
            device_settle_ms: 1000,
            connect_stale_ms: 3000,
            startup_timeout_ms: 30_000,
            wait_timeout_ms: 5000,
            motion_slack_ms: 2000,
        }
    }
}

impl Timing {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn reset_hold(&self) -> Duration {
        Duration::from_millis(self.reset_hold_ms)
    }

    pub fn reset_recovery(&self) -> Duration {
        Duration::from_millis(self.reset_recovery_ms)
    }

    pub fn upload_pause(&self) -> Duration {
        Duration::from_millis(self.upload_pause_ms)
    }

    pub fn done_grace(&self) -> Duration {
        Duration::from_millis(self.done_grace_ms)
    }

    pub fn device_settle(&self) -> Duration {
        Duration::from_millis(self.device_settle_ms)
    }

    pub fn connect_stale(&self) -> Duration {
        Duration::from_millis(self.connect_stale_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn motion_slack(&self) -> Duration {
        Duration::from_millis(self.motion_slack_ms)
    }
}
