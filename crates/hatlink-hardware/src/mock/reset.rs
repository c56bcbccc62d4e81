//! Reset lines that record what they were asked to do.

use std::sync::{Arc, Mutex, PoisonError};

use hatlink_core::{HatError, Result, constants::RESET_GPIO};

use crate::gpio::ResetLines;

/// One operation on the reset lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEvent {
    Boot0(bool),
    Reset(bool),
    Released,
}

type Hook = Arc<dyn Fn() + Send + Sync>;

/// [`ResetLines`] that log every call. Clones share the log.
#[derive(Clone, Default)]
pub struct RecordingResetLines {
    events: Arc<Mutex<Vec<LineEvent>>>,
    fail_reset: bool,
    on_reset: Option<Hook>,
}

impl std::fmt::Debug for RecordingResetLines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingResetLines")
            .field("events", &self.events())
            .field("fail_reset", &self.fail_reset)
            .finish_non_exhaustive()
    }
}

impl RecordingResetLines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines whose RESET output always fails with an I/O error.
    pub fn failing_reset() -> Self {
        Self {
            fail_reset: true,
            ..Self::default()
        }
    }

    /// Lines that run `hook` when RESET is driven high again, i.e. when the
    /// controller comes out of reset.
    pub fn with_hook(hook: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            on_reset: Some(Arc::new(hook)),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<LineEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, event: LineEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl ResetLines for RecordingResetLines {
    fn set_boot0(&mut self, high: bool) -> Result<()> {
        self.record(LineEvent::Boot0(high));
        Ok(())
    }

    fn set_reset(&mut self, high: bool) -> Result<()> {
        if self.fail_reset {
            return Err(HatError::gpio(RESET_GPIO, "reset line unavailable"));
        }
        self.record(LineEvent::Reset(high));
        if high && let Some(hook) = &self.on_reset {
            hook();
        }
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.record(LineEvent::Released);
        Ok(())
    }
}
