//! The HAT engine handle.
//!
//! [`Hat`] is a cheap, clonable handle onto one running link. Construction
//! goes through [`HatBuilder`], which brings the controller up (probing,
//! resetting and reflashing as needed), spawns the reader loop and the
//! callback worker, and returns once the HAT reports its ports.
//!
//! ```text
//!   callers ──► Hat ──► LinkWriter (serialized) ──► UART
//!                │
//!                ├── CompletionTable ◄── reader loop ◄── LinkReader ◄── UART
//!                ├── port table      ◄──┘     │
//!                ├── Registry                 └──► callback worker ──► user code
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use hatlink_hardware::{HatBuilder, HatConfig};
//!
//! # async fn example() -> hatlink_core::Result<()> {
//! let config = HatConfig {
//!     firmware_version: Some(1_636_109_636),
//!     ..HatConfig::default()
//! };
//! let hat = HatBuilder::new().config(config).open().await?;
//! for info in hat.ports() {
//!     println!("{}: {} ({})", info.port, info.name, info.description);
//! }
//! hat.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use hatlink_core::{
    HatError, PortId, PortInfo, Result, Sample, WaitKind,
    constants::{MATRIX_BLANK, MATRIX_TYPE_ID, NUM_PORTS},
    types::LedMode,
};
use hatlink_protocol::{CommandBuilder, commands};

use crate::boot::{self, StartMode};
use crate::config::HatConfig;
use crate::dispatch::{self, CallbackFn, CallbackQueue};
use crate::gpio::{NoopResetLines, ResetLines};
use crate::link::{self, LinkWriter};
use crate::loader::FirmwareImage;
use crate::reader;
use crate::registry::{Ownership, PortOwner, Registry};
use crate::sync::{CompletionTable, Pending};

pub(crate) type WeakCallback = Weak<CallbackFn>;

/// Live state of one port as reported by the HAT.
pub(crate) struct PortSlot {
    pub(crate) type_id: i32,
    pub(crate) connected: bool,
    /// Values of the most recent data line.
    pub(crate) data: Sample,
    pub(crate) callback: Option<WeakCallback>,
    /// Set while a device is negotiating its connection.
    pub(crate) connecting_since: Option<Instant>,
}

impl Default for PortSlot {
    fn default() -> Self {
        Self {
            type_id: -1,
            connected: false,
            data: Vec::new(),
            callback: None,
            connecting_since: None,
        }
    }
}

#[derive(Default)]
pub(crate) struct PortTable {
    pub(crate) slots: [PortSlot; NUM_PORTS],
    /// Ports that answered the start-up `list`; `None` when not listing.
    pub(crate) listing: Option<[bool; NUM_PORTS]>,
}

struct Tasks {
    reader: JoinHandle<()>,
    worker: JoinHandle<usize>,
}

/// State shared by the handle, the reader loop and scheduled tasks.
pub(crate) struct Shared {
    pub(crate) config: HatConfig,
    pub(crate) writer: LinkWriter,
    pub(crate) ports: Mutex<PortTable>,
    pub(crate) completions: CompletionTable,
    pub(crate) registry: Registry,
    callbacks: Mutex<Option<CallbackQueue>>,
    ready: watch::Sender<u64>,
    stop: AtomicBool,
    closed: AtomicBool,
    started: Instant,
    tasks: Mutex<Option<Tasks>>,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn new(config: HatConfig, writer: LinkWriter, callbacks: CallbackQueue) -> Self {
        let (ready, _) = watch::channel(0);
        Self {
            config,
            writer,
            ports: Mutex::new(PortTable::default()),
            completions: CompletionTable::new(),
            registry: Registry::new(),
            callbacks: Mutex::new(Some(callbacks)),
            ready,
            stop: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            started: Instant::now(),
            tasks: Mutex::new(None),
        }
    }

    pub(crate) fn lock_ports(&self) -> MutexGuard<'_, PortTable> {
        relock(&self.ports)
    }

    pub(crate) fn callback_queue(&self) -> Option<CallbackQueue> {
        relock(&self.callbacks).clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ready_count(&self) -> u64 {
        *self.ready.borrow()
    }

    pub(crate) fn signal_ready(&self) {
        self.ready.send_modify(|count| *count += 1);
        info!(count = self.ready_count(), "HAT ready");
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Start counting `list` replies.
    pub(crate) fn begin_listing(&self) {
        self.lock_ports().listing = Some([false; NUM_PORTS]);
    }

    /// True once the stop flag is set and nothing in flight would be cut off.
    pub(crate) fn may_stop(&self, now: Instant) -> bool {
        if !self.stop.load(Ordering::Acquire) {
            return false;
        }
        let timing = &self.config.timing;
        if now.duration_since(self.started) < timing.device_settle() {
            return false;
        }
        let table = self.lock_ports();
        if table.listing.is_some() {
            return false;
        }
        let stale = timing.connect_stale();
        !table.slots.iter().any(|slot| {
            slot.connecting_since
                .is_some_and(|since| now.duration_since(since) < stale)
        })
    }

    /// Replay every owner's configuration after a whole-link reboot.
    pub(crate) async fn broadcast_reset(&self) -> Result<()> {
        let owners = self.registry.owners();
        info!(owners = owners.len(), "Re-initialising owned ports");
        for (port, owner) in owners {
            for command in owner.reset_commands(port) {
                self.writer.write_command(&command).await?;
            }
        }
        Ok(())
    }
}

/// Handle onto a running HAT.
#[derive(Clone)]
pub struct Hat {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Hat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hat")
            .field("ready_count", &self.ready_count())
            .field("closed", &self.shared.is_closed())
            .finish_non_exhaustive()
    }
}

impl Hat {
    /// Start configuring a new engine.
    pub fn builder() -> HatBuilder {
        HatBuilder::new()
    }

    pub fn config(&self) -> &HatConfig {
        &self.shared.config
    }

    /// Snapshot of all four ports.
    pub fn ports(&self) -> [PortInfo; NUM_PORTS] {
        let table = self.shared.lock_ports();
        PortId::ALL.map(|port| {
            let slot = &table.slots[port.index()];
            PortInfo::new(port, slot.type_id, slot.connected)
        })
    }

    pub fn port_info(&self, port: PortId) -> PortInfo {
        let table = self.shared.lock_ports();
        let slot = &table.slots[port.index()];
        PortInfo::new(port, slot.type_id, slot.connected)
    }

    /// Values of the most recent data line seen on `port`.
    pub fn latest_sample(&self, port: PortId) -> Sample {
        self.shared.lock_ports().slots[port.index()].data.clone()
    }

    /// How many times the HAT has become ready: once at start-up, then once
    /// per reboot.
    pub fn ready_count(&self) -> u64 {
        self.shared.ready_count()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Write one command line.
    ///
    /// # Errors
    /// Returns `HatError::LinkClosed` after shutdown, or the write error.
    pub async fn send(&self, command: &str) -> Result<()> {
        if self.shared.is_closed() {
            return Err(HatError::LinkClosed);
        }
        self.shared.writer.write_command(command).await
    }

    /// Read the supply voltage.
    ///
    /// # Errors
    /// Returns `HatError::Timeout` if the HAT does not answer within `timeout`.
    pub async fn voltage(&self, timeout: Duration) -> Result<f64> {
        let pending = self.expect_voltage();
        self.send(&commands::vin()).await?;
        pending.wait(timeout).await
    }

    /// Set the behaviour of the status LEDs.
    pub async fn set_leds(&self, mode: LedMode) -> Result<()> {
        self.send(&commands::ledmode(mode)).await
    }

    /// Reboot the controller and wait until it is ready again.
    ///
    /// Every owned port has its configuration replayed before this returns.
    ///
    /// # Errors
    /// Returns `HatError::Timeout` if the HAT is not ready within `timeout`.
    pub async fn reboot(&self, timeout: Duration) -> Result<()> {
        let mut ready = self.shared.ready.subscribe();
        let before = *ready.borrow_and_update();
        info!("Rebooting HAT");
        self.send(&commands::reboot()).await?;
        wait_ready(&mut ready, before, timeout).await
    }

    /// Replay every owner's configuration.
    pub async fn broadcast_reset(&self) -> Result<()> {
        if self.shared.is_closed() {
            return Err(HatError::LinkClosed);
        }
        self.shared.broadcast_reset().await
    }

    /// Register for the next data sample on `port`.
    ///
    /// Register before writing the command that triggers the sample.
    pub fn expect_sample(&self, port: PortId) -> Pending<Sample> {
        self.shared.completions.register_data(port)
    }

    /// Register for the next `ramp done` on `port`.
    pub fn expect_ramp_done(&self, port: PortId) -> Pending<()> {
        self.shared.completions.register_ramp(port)
    }

    /// Register for the next `pulse done` on `port`.
    pub fn expect_pulse_done(&self, port: PortId) -> Pending<()> {
        self.shared.completions.register_pulse(port)
    }

    /// Register for the next supply voltage reply.
    pub fn expect_voltage(&self) -> Pending<f64> {
        self.shared.completions.register_voltage()
    }

    pub(crate) fn acquire(&self, port: PortId, owner: Arc<dyn PortOwner>) -> Result<Ownership> {
        if self.shared.is_closed() {
            return Err(HatError::LinkClosed);
        }
        self.shared.registry.acquire(port, owner)
    }

    pub(crate) fn is_owner(&self, ownership: &Ownership) -> bool {
        self.shared.registry.is_current(ownership)
    }

    pub(crate) fn set_callback(&self, port: PortId, callback: Option<WeakCallback>) {
        self.shared.lock_ports().slots[port.index()].callback = callback;
    }

    /// Give up a port: cancel its waits, drop its callback and, if a device
    /// is still attached, run the owner's shutdown commands.
    pub(crate) async fn release(&self, ownership: Ownership) -> Result<()> {
        let port = ownership.port();
        let Some(owner) = self.shared.registry.release(&ownership) else {
            return Ok(());
        };
        self.shared.completions.cancel_port(port);
        let connected = {
            let mut table = self.shared.lock_ports();
            let slot = &mut table.slots[port.index()];
            slot.callback = None;
            slot.connected
        };
        if connected && !self.shared.is_closed() {
            for command in owner.shutdown_commands(port) {
                self.shared.writer.write_command(&command).await?;
            }
        }
        Ok(())
    }

    /// Give up a port without writing anything, for when no runtime is left
    /// to run the shutdown commands on.
    pub(crate) fn abandon(&self, ownership: Ownership) {
        if self.shared.registry.release(&ownership).is_some() {
            let port = ownership.port();
            self.shared.completions.cancel_port(port);
            self.shared.lock_ports().slots[port.index()].callback = None;
        }
    }

    /// Stop the engine and power every port down.
    ///
    /// Pending waits fail with `HatError::Cancelled`. Calling this more than
    /// once is a no-op.
    ///
    /// # Errors
    /// Returns the first write error of the power-down sequence.
    pub async fn shutdown(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Shutting down HAT");
        shared.request_stop();
        shared.completions.cancel_all();

        let tasks = relock(&shared.tasks).take();
        let callbacks = relock(&shared.callbacks).take();
        drop(callbacks);
        if let Some(Tasks { reader, worker }) = tasks {
            let bound = shared.config.timing.startup_timeout();
            join_bounded("reader", reader, bound).await;
            join_bounded("callback worker", worker, bound).await;
        }
        shared.registry.clear();

        let type_ids: Vec<(PortId, i32)> = {
            let table = shared.lock_ports();
            PortId::ALL
                .iter()
                .map(|port| (*port, table.slots[port.index()].type_id))
                .collect()
        };
        let mut power_down = CommandBuilder::new();
        for (port, type_id) in type_ids {
            if type_id == MATRIX_TYPE_ID {
                let blank = CommandBuilder::for_port(port).write1(&MATRIX_BLANK).build();
                shared.writer.write_command(&blank).await?;
            } else {
                power_down = power_down.port(port).pwm().coast().off();
            }
        }
        if !power_down.is_empty() {
            shared.writer.write_command(&power_down.build()).await?;
        }
        shared.writer.write_command(&commands::deselect_all()).await
    }
}

async fn join_bounded<T>(name: &str, mut task: JoinHandle<T>, bound: Duration) {
    match tokio::time::timeout(bound, &mut task).await {
        Ok(Ok(_)) => debug!(task = name, "Task stopped"),
        Ok(Err(e)) => warn!(task = name, "Task failed: {e}"),
        Err(_) => {
            warn!(task = name, "Task did not stop in time, aborting");
            task.abort();
        }
    }
}

async fn wait_ready(ready: &mut watch::Receiver<u64>, before: u64, timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, ready.wait_for(|count| *count > before)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(HatError::cancelled(WaitKind::Ready)),
        Err(_) => Err(HatError::timeout(WaitKind::Ready, timeout)),
    }
}

/// Builder for [`Hat`].
#[derive(Default)]
pub struct HatBuilder {
    config: HatConfig,
    reset_lines: Option<Box<dyn ResetLines>>,
    firmware: Option<FirmwareImage>,
}

impl std::fmt::Debug for HatBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HatBuilder")
            .field("config", &self.config)
            .field("reset_lines", &self.reset_lines.is_some())
            .field("firmware", &self.firmware.is_some())
            .finish()
    }
}

impl HatBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: HatConfig) -> Self {
        self.config = config;
        self
    }

    /// GPIO lines used to reset the controller.
    pub fn reset_lines(mut self, lines: impl ResetLines + 'static) -> Self {
        self.reset_lines = Some(Box::new(lines));
        self
    }

    /// Firmware to upload if the controller needs it, instead of reading
    /// the configured files.
    pub fn firmware(mut self, image: FirmwareImage) -> Self {
        self.firmware = Some(image);
        self
    }

    /// Open the configured serial device and start the engine.
    ///
    /// Resets go through [`gpio::default_reset_lines`](crate::gpio::default_reset_lines)
    /// unless other lines were supplied.
    ///
    /// # Errors
    /// See [`start`](Self::start); also fails if the device cannot be opened.
    #[cfg(feature = "serial")]
    pub async fn open(mut self) -> Result<Hat> {
        self.config.validate()?;
        let stream = link::open_serial(&self.config.device, self.config.baud_rate)?;
        if self.reset_lines.is_none() {
            self.reset_lines = Some(crate::gpio::default_reset_lines());
        }
        self.start(stream).await
    }

    /// Start the engine over an already-open stream.
    ///
    /// # Errors
    /// - `HatError::Config` for an invalid configuration, including a
    ///   missing `firmware_version`
    /// - `HatError::HatNotFound` if no controller answers, even after a reset
    /// - `HatError::Firmware` if a needed upload fails
    /// - `HatError::Timeout` if the HAT does not become ready within
    ///   `startup_timeout` once bring-up is done
    pub async fn start<S>(self, stream: S) -> Result<Hat>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let HatBuilder {
            config,
            reset_lines,
            firmware,
        } = self;
        config.validate()?;
        let mut lines = reset_lines.unwrap_or_else(|| Box::new(NoopResetLines));
        let startup = config.timing.startup_timeout();

        let (mut link_reader, writer) = link::split(stream);
        // Bring-up bounds its own reads; the startup bound covers the wait for ready.
        let mode = boot::bring_up(
            &mut link_reader,
            &writer,
            lines.as_mut(),
            firmware.as_ref(),
            &config,
        )
        .await?;

        let (queue, worker) = dispatch::spawn_worker();
        let shared = Arc::new(Shared::new(config, writer, queue));
        let mut ready = shared.ready.subscribe();
        let reader_task = tokio::spawn(reader::run_reader(Arc::clone(&shared), link_reader));
        *relock(&shared.tasks) = Some(Tasks {
            reader: reader_task,
            worker,
        });
        let hat = Hat { shared };

        let started = async {
            match mode {
                StartMode::Listing => {
                    hat.shared.writer.write_command(&commands::deselect_all()).await?;
                    hat.shared.begin_listing();
                    hat.shared.writer.write_command(&commands::list()).await?;
                }
                StartMode::Reboot => {
                    hat.shared.writer.write_command(&commands::reboot()).await?;
                }
            }
            wait_ready(&mut ready, 0, startup).await
        };
        if let Err(e) = started.await {
            warn!("HAT did not become ready: {e}");
            // The listing will never finish; do not let it hold up the reader.
            hat.shared.lock_ports().listing = None;
            if let Err(shutdown_error) = hat.shutdown().await {
                debug!("Shutdown after failed start: {shutdown_error}");
            }
            return Err(e);
        }
        Ok(hat)
    }
}

#[cfg(test)]
pub(crate) fn shared_for_test() -> (Arc<Shared>, tokio::io::DuplexStream) {
    let (ours, theirs) = tokio::io::duplex(4096);
    let (_reader, writer) = link::split(ours);
    let (queue, _worker) = dispatch::spawn_worker();
    let shared = Arc::new(Shared::new(HatConfig::default(), writer, queue));
    (shared, theirs)
}
