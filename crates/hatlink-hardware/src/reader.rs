//! The reader loop.
//!
//! One task owns the read half of the link for the lifetime of the engine.
//! Each line is classified by [`parse_line`] and applied to the shared
//! state by [`Shared::handle_line`]:
//!
//! | Event | Effect |
//! |---|---|
//! | port connected / not connected | port table; listing bookkeeping; matrix `on` |
//! | port connecting | staleness timer, holds up shutdown |
//! | port disconnected / timeout | port table; waits on the port cancelled |
//! | port checksum error | as disconnected; data waits fail with `ChecksumMismatch` |
//! | ramp done / pulse done | oldest matching wait resolved |
//! | data line | latest sample; data waits resolved; callback queued |
//! | voltage | voltage waits resolved |
//! | firmware banner while listing | listing finished, ready signalled |
//! | ports initialised, not listing | ready signalled after the grace delay |
//!
//! Lines that do not classify are ignored: the link carries negotiation
//! chatter that is not worth modelling.
//!
//! Writes the loop needs (the matrix `on`) are returned as [`Action`]s and
//! performed by the loop itself, so the port table lock is never held
//! across an await.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use hatlink_core::{HatError, PortId, Sample, constants::MATRIX_TYPE_ID};
use hatlink_protocol::{CommandBuilder, PortStatus, WireEvent, parse_line};

use crate::dispatch::CallbackEvent;
use crate::engine::Shared;
use crate::link::LinkReader;

/// Follow-up work produced by one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Action {
    Write(String),
    /// Signal ready after the grace delay; `reboot` replays port owners first.
    ScheduleReady { reboot: bool },
}

/// Run until the engine stops or the link fails.
pub(crate) async fn run_reader(shared: Arc<Shared>, mut reader: LinkReader) {
    let read_timeout = shared.config.timing.read_timeout();
    loop {
        if shared.may_stop(Instant::now()) {
            debug!("Reader stopping");
            break;
        }
        let line = match reader.read_line(read_timeout).await {
            Ok(Some(line)) => line,
            Ok(None) => continue,
            Err(e) => {
                warn!("Link read failed, reader stopping: {e}");
                shared.completions.cancel_all();
                break;
            }
        };
        for action in shared.handle_line(&line, Instant::now()) {
            perform(&shared, action).await;
        }
    }
}

async fn perform(shared: &Arc<Shared>, action: Action) {
    match action {
        Action::Write(command) => {
            if let Err(e) = shared.writer.write_command(&command).await {
                warn!("Follow-up write failed: {e}");
            }
        }
        Action::ScheduleReady { reboot } => {
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                tokio::time::sleep(shared.config.timing.done_grace()).await;
                if shared.is_closed() {
                    return;
                }
                if reboot && let Err(e) = shared.broadcast_reset().await {
                    warn!("Re-initialising ports failed: {e}");
                }
                shared.signal_ready();
            });
        }
    }
}

impl Shared {
    /// Apply one line to the shared state.
    pub(crate) fn handle_line(&self, line: &str, now: Instant) -> Vec<Action> {
        let Some(event) = parse_line(line) else {
            if !line.is_empty() {
                trace!(line, "Ignoring line");
            }
            return Vec::new();
        };

        let mut actions = Vec::new();
        match event {
            WireEvent::Port { port, status } => self.on_port_status(port, status, now, &mut actions),
            WireEvent::Data { port, values } => self.on_data(port, values),
            WireEvent::Voltage(volts) => {
                self.completions.fulfil_voltage(volts);
            }
            WireEvent::FirmwareBanner { .. } => {
                if self.lock_ports().listing.take().is_some() {
                    debug!("Listing ended by firmware banner");
                    self.signal_ready();
                }
            }
            WireEvent::PortsInitialised => {
                if self.lock_ports().listing.is_none() {
                    let reboot = self.ready_count() > 0;
                    debug!(reboot, "Ports initialised, ready after grace delay");
                    actions.push(Action::ScheduleReady { reboot });
                }
            }
            WireEvent::BootloaderBanner | WireEvent::Prompt => {
                warn!("Bootloader output while running firmware");
            }
        }
        actions
    }

    fn on_port_status(&self, port: PortId, status: PortStatus, now: Instant, actions: &mut Vec<Action>) {
        let listing_done = {
            let mut table = self.lock_ports();
            let slot = &mut table.slots[port.index()];
            match status {
                PortStatus::ConnectedActive(type_id) | PortStatus::ConnectedPassive(type_id) => {
                    slot.type_id = type_id;
                    slot.connected = true;
                    slot.connecting_since = None;
                    info!(%port, type_id, "Device connected");
                    // A matrix has to be powered as soon as it appears.
                    if type_id == MATRIX_TYPE_ID && matches!(status, PortStatus::ConnectedActive(_)) {
                        actions.push(Action::Write(CommandBuilder::for_port(port).on().build()));
                    }
                }
                PortStatus::Connecting => slot.connecting_since = Some(now),
                status if status.is_disconnect() => {
                    if slot.connected {
                        info!(%port, ?status, "Device disconnected");
                    }
                    slot.type_id = -1;
                    slot.connected = false;
                    slot.connecting_since = None;
                }
                _ => {}
            }

            let complete = match table.listing.as_mut() {
                Some(reported) if status.is_listing_reply() => {
                    reported[port.index()] = true;
                    reported.iter().all(|r| *r)
                }
                _ => false,
            };
            if complete {
                table.listing = None;
            }
            complete
        };

        match status {
            PortStatus::RampDone => {
                if !self.completions.fulfil_ramp(port) {
                    trace!(%port, "Ramp done with nobody waiting");
                }
            }
            PortStatus::PulseDone => {
                if !self.completions.fulfil_pulse(port) {
                    trace!(%port, "Pulse done with nobody waiting");
                }
            }
            PortStatus::ChecksumError => {
                warn!(%port, "Checksum error, device disconnected");
                self.completions
                    .fail_data(port, || HatError::ChecksumMismatch { port });
                self.completions.cancel_port(port);
            }
            PortStatus::Disconnected | PortStatus::DeviceTimeout => {
                self.completions.cancel_port(port);
            }
            _ => {}
        }

        if listing_done {
            debug!("All ports listed");
            self.signal_ready();
        }
    }

    fn on_data(&self, port: PortId, values: Sample) {
        let callback = {
            let mut table = self.lock_ports();
            let slot = &mut table.slots[port.index()];
            slot.data.clone_from(&values);
            slot.callback.clone()
        };
        self.completions.fulfil_data(port, &values);
        if let Some(callback) = callback {
            let queued = self.callback_queue().is_some_and(|queue| {
                queue.enqueue(CallbackEvent {
                    port,
                    callback,
                    values,
                })
            });
            if !queued {
                trace!(%port, "Callback worker stopped, sample not dispatched");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{PortSlot, shared_for_test};
    use hatlink_core::Value;
    use std::time::Duration;

    fn port(index: u8) -> PortId {
        PortId::new(index).unwrap()
    }

    #[tokio::test]
    async fn test_listing_signals_ready_exactly_once() {
        let (shared, _peer) = shared_for_test();
        shared.begin_listing();
        let now = Instant::now();

        for line in [
            "P0: connected to active ID 30",
            "P1: no device detected",
            "P2: connected to passive ID 8",
        ] {
            shared.handle_line(line, now);
            assert_eq!(shared.ready_count(), 0);
        }
        shared.handle_line("P3: no device detected", now);
        assert_eq!(shared.ready_count(), 1);

        shared.handle_line("Firmware version: 1636109636 x", now);
        shared.handle_line("P3: no device detected", now);
        assert_eq!(shared.ready_count(), 1);
    }

    #[tokio::test]
    async fn test_repeated_port_does_not_complete_listing() {
        let (shared, _peer) = shared_for_test();
        shared.begin_listing();
        let now = Instant::now();
        for _ in 0..4 {
            shared.handle_line("P0: no device detected", now);
        }
        assert_eq!(shared.ready_count(), 0);
        shared.handle_line("Firmware version: 1 x", now);
        assert_eq!(shared.ready_count(), 1);
    }

    #[tokio::test]
    async fn test_port_table_updates() {
        let (shared, _peer) = shared_for_test();
        let now = Instant::now();

        shared.handle_line("P1: connected to active ID 31", now);
        {
            let table = shared.lock_ports();
            let PortSlot { type_id, connected, .. } = &table.slots[1];
            assert_eq!((*type_id, *connected), (0x31, true));
        }

        shared.handle_line("P1: timeout during data phase: disconnecting", now);
        let table = shared.lock_ports();
        assert_eq!(table.slots[1].type_id, -1);
        assert!(!table.slots[1].connected);
    }

    #[tokio::test]
    async fn test_matrix_connect_is_powered() {
        let (shared, _peer) = shared_for_test();
        let actions = shared.handle_line("P2: connected to active ID 40", Instant::now());
        assert_eq!(actions, [Action::Write("port 2 ; on\r".to_string())]);
    }

    #[tokio::test]
    async fn test_data_line_resolves_wait_and_stores_sample() {
        let (shared, _peer) = shared_for_test();
        let pending = shared.completions.register_data(port(0));

        shared.handle_line("P0C0: 12 -37 180.5", Instant::now());

        let expected = vec![Value::Int(12), Value::Int(-37), Value::Float(180.5)];
        assert_eq!(pending.wait(Duration::from_millis(10)).await.unwrap(), expected);
        assert_eq!(shared.lock_ports().slots[0].data, expected);
    }

    #[tokio::test]
    async fn test_checksum_error_fails_data_wait() {
        let (shared, _peer) = shared_for_test();
        shared.handle_line("P3: connected to active ID 30", Instant::now());
        let pending = shared.completions.register_data(port(3));

        shared.handle_line("P3: checksum error: disconnecting", Instant::now());

        assert!(matches!(
            pending.wait(Duration::from_millis(10)).await,
            Err(HatError::ChecksumMismatch { .. })
        ));
        assert!(!shared.lock_ports().slots[3].connected);
    }

    #[tokio::test]
    async fn test_done_banner_outside_listing_schedules_ready() {
        let (shared, _peer) = shared_for_test();
        let actions = shared.handle_line("Done initialising ports", Instant::now());
        assert_eq!(actions, [Action::ScheduleReady { reboot: false }]);

        shared.signal_ready();
        let actions = shared.handle_line("Done initialising ports", Instant::now());
        assert_eq!(actions, [Action::ScheduleReady { reboot: true }]);

        shared.begin_listing();
        assert!(shared.handle_line("Done initialising ports", Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connecting_port_holds_up_stop_until_stale() {
        let (shared, _peer) = shared_for_test();
        shared.request_stop();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(shared.may_stop(Instant::now()));

        shared.handle_line("P0: connecting to active device", Instant::now());
        assert!(!shared.may_stop(Instant::now()));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(shared.may_stop(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_settle_and_listing() {
        let (shared, _peer) = shared_for_test();
        shared.request_stop();
        assert!(!shared.may_stop(Instant::now()));

        tokio::time::advance(Duration::from_secs(2)).await;
        shared.begin_listing();
        assert!(!shared.may_stop(Instant::now()));

        shared.handle_line("Firmware version: 1 x", Instant::now());
        assert!(shared.may_stop(Instant::now()));
    }

    #[tokio::test]
    async fn test_noise_is_ignored() {
        let (shared, _peer) = shared_for_test();
        for line in ["", "garbage", "P9: connected to active ID 30", "P0: something new"] {
            assert!(shared.handle_line(line, Instant::now()).is_empty());
        }
        assert_eq!(shared.ready_count(), 0);
    }
}
