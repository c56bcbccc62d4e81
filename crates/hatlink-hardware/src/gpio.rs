//! GPIO lines used to hard-reset the HAT.
//!
//! Two host GPIOs are wired to the HAT microcontroller: RESET (BCM 4) and
//! BOOT0 (BCM 22). Holding BOOT0 low across a reset pulse restarts the
//! controller into its bootloader, ready for an upload.
//!
//! [`ResetLines`] is the seam between the reset sequence and the host's GPIO
//! driver. [`PiResetLines`] drives the lines through the Raspberry Pi GPIO
//! peripheral with `rppal`; [`NoopResetLines`] is for hosts where the lines
//! are not wired.

use tracing::{debug, info};

use hatlink_core::{HatError, Result};
#[cfg(all(feature = "gpio", target_os = "linux"))]
use hatlink_core::constants::{BOOT0_GPIO, RESET_GPIO};

use crate::config::Timing;

/// Output lines that can reset the HAT.
pub trait ResetLines: Send + Sync {
    /// Drive BOOT0 high (`true`) or low.
    fn set_boot0(&mut self, high: bool) -> Result<()>;

    /// Drive RESET high (`true`, running) or low (held in reset).
    fn set_reset(&mut self, high: bool) -> Result<()>;

    /// Stop driving both lines.
    fn release(&mut self) -> Result<()>;
}

impl<T: ResetLines + ?Sized> ResetLines for Box<T> {
    fn set_boot0(&mut self, high: bool) -> Result<()> {
        (**self).set_boot0(high)
    }

    fn set_reset(&mut self, high: bool) -> Result<()> {
        (**self).set_reset(high)
    }

    fn release(&mut self) -> Result<()> {
        (**self).release()
    }
}

/// Reset the HAT: BOOT0 low, RESET pulsed low then high, lines released.
///
/// # Errors
/// Returns the first GPIO error; the lines are still released.
pub async fn reset_hat(lines: &mut dyn ResetLines, timing: &Timing) -> Result<()> {
    info!("Resetting HAT");
    let pulse = async {
        lines.set_boot0(false)?;
        lines.set_reset(false)?;
        tokio::time::sleep(timing.reset_hold()).await;
        lines.set_reset(true)?;
        tokio::time::sleep(timing.reset_hold()).await;
        Ok::<(), HatError>(())
    }
    .await;
    let released = lines.release();
    tokio::time::sleep(timing.reset_recovery()).await;
    pulse.and(released)
}

/// Lines that do nothing, for hosts without a reset wiring.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopResetLines;

impl ResetLines for NoopResetLines {
    fn set_boot0(&mut self, _high: bool) -> Result<()> {
        Ok(())
    }

    fn set_reset(&mut self, _high: bool) -> Result<()> {
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The lines [`HatBuilder::open`](crate::HatBuilder::open) uses when none
/// were supplied: the Pi header pins when GPIO support is built in.
pub fn default_reset_lines() -> Box<dyn ResetLines> {
    #[cfg(all(feature = "gpio", target_os = "linux"))]
    {
        Box::new(PiResetLines::new())
    }
    #[cfg(not(all(feature = "gpio", target_os = "linux")))]
    {
        debug!("Built without GPIO support, resets are skipped");
        Box::new(NoopResetLines)
    }
}

/// Lines driven through the Raspberry Pi GPIO peripheral.
///
/// Pins are claimed on first use. Releasing drops them, which puts each pin
/// back in the mode it had before, so the lines float again.
#[cfg(all(feature = "gpio", target_os = "linux"))]
#[derive(Debug)]
pub struct PiResetLines {
    reset_pin: u8,
    boot0_pin: u8,
    reset: Option<rppal::gpio::OutputPin>,
    boot0: Option<rppal::gpio::OutputPin>,
}

#[cfg(all(feature = "gpio", target_os = "linux"))]
impl PiResetLines {
    /// Use the HAT's BCM pins.
    pub fn new() -> Self {
        Self::with_pins(RESET_GPIO, BOOT0_GPIO)
    }

    /// Use other BCM pins.
    pub fn with_pins(reset: u8, boot0: u8) -> Self {
        Self {
            reset_pin: reset,
            boot0_pin: boot0,
            reset: None,
            boot0: None,
        }
    }

    fn claim(pin: u8) -> Result<rppal::gpio::OutputPin> {
        let output = rppal::gpio::Gpio::new()
            .and_then(|gpio| gpio.get(pin))
            .map_err(|e| HatError::gpio(pin, e))?
            .into_output();
        debug!(pin, "Claimed GPIO");
        Ok(output)
    }

    fn drive(slot: &mut Option<rppal::gpio::OutputPin>, pin: u8, high: bool) -> Result<()> {
        if slot.is_none() {
            *slot = Some(Self::claim(pin)?);
        }
        if let Some(output) = slot {
            if high {
                output.set_high();
            } else {
                output.set_low();
            }
        }
        Ok(())
    }
}

#[cfg(all(feature = "gpio", target_os = "linux"))]
impl Default for PiResetLines {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(feature = "gpio", target_os = "linux"))]
impl ResetLines for PiResetLines {
    fn set_boot0(&mut self, high: bool) -> Result<()> {
        Self::drive(&mut self.boot0, self.boot0_pin, high)
    }

    fn set_reset(&mut self, high: bool) -> Result<()> {
        Self::drive(&mut self.reset, self.reset_pin, high)
    }

    fn release(&mut self) -> Result<()> {
        self.reset = None;
        self.boot0 = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{LineEvent, RecordingResetLines};

    #[tokio::test(start_paused = true)]
    async fn test_reset_sequence_order() {
        let mut lines = RecordingResetLines::new();
        let timing = Timing::default();
        let started = tokio::time::Instant::now();

        reset_hat(&mut lines, &timing).await.unwrap();

        assert_eq!(
            lines.events(),
            [
                LineEvent::Boot0(false),
                LineEvent::Reset(false),
                LineEvent::Reset(true),
                LineEvent::Released,
            ]
        );
        // Two 10ms holds plus the 500ms recovery.
        let elapsed = started.elapsed();
        assert!(elapsed >= std::time::Duration::from_millis(520));
        assert!(elapsed < std::time::Duration::from_millis(530));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_releases_after_failure() {
        let mut lines = RecordingResetLines::failing_reset();
        let err = reset_hat(&mut lines, &Timing::default()).await.unwrap_err();

        assert!(matches!(err, HatError::Gpio { .. }));
        assert_eq!(lines.events().last(), Some(&LineEvent::Released));
    }

    #[cfg(all(feature = "gpio", target_os = "linux"))]
    #[test]
    fn test_pi_lines_claim_lazily() {
        let mut lines = PiResetLines::with_pins(4, 22);
        // Nothing claimed yet, so releasing touches no hardware.
        lines.release().unwrap();
        assert!(lines.reset.is_none() && lines.boot0.is_none());

        let on_pi = ["/dev/gpiomem", "/dev/gpiomem0"]
            .iter()
            .any(|path| std::path::Path::new(path).exists());
        if !on_pi {
            let err = lines.set_reset(false).unwrap_err();
            assert!(matches!(err, HatError::Gpio { pin: 4, .. }));
            assert!(lines.reset.is_none());
        }
    }

    #[test]
    fn test_default_lines_start_unclaimed() {
        let mut lines = default_reset_lines();
        assert!(lines.release().is_ok());
    }
}
