//! Generic device handle.
//!
//! A [`Device`] owns one port for as long as it lives. It checks on every
//! write that the device it was created for is still attached, keeps track
//! of the selected mode, and registers itself with the engine so that its
//! configuration is replayed after a HAT reboot and the port is powered down
//! when the handle goes away.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use hatlink_core::PortId;
//! use hatlink_hardware::{Device, Hat};
//!
//! # async fn example(hat: &Hat) -> hatlink_core::Result<()> {
//! let sensor = Device::acquire(hat, PortId::new(1)?, "ColorSensor")?;
//! sensor.mode_combi(&[(6, 0), (5, 0)]).await?;
//! let sample = sensor.get(Duration::from_secs(1)).await?;
//! sensor.release().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, trace};

use hatlink_core::{
    HatError, PortId, Result, Sample, device_description, device_name,
    constants::{MATRIX_BLANK, MATRIX_TYPE_ID},
    types::UNKNOWN_NAME,
};
use hatlink_protocol::CommandBuilder;

use crate::dispatch::Callback;
use crate::engine::Hat;
use crate::registry::{Ownership, PortOwner};

/// Combi slot used for composite modes.
const COMBI_INDEX: u8 = 0;

/// Data mode of a port.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    None,
    Simple(u8),
    /// `(mode, dataset)` pairs read together.
    Combi(Vec<(u8, u8)>),
}

impl Mode {
    /// Mode number to `select`/`selonce`.
    fn select_index(&self) -> Option<u8> {
        match self {
            Mode::None => None,
            Mode::Simple(mode) => Some(*mode),
            Mode::Combi(_) => Some(COMBI_INDEX),
        }
    }
}

#[derive(Debug)]
struct DeviceState {
    type_id: i32,
    mode: Mode,
    /// A continuous `select` is active.
    streaming: bool,
    /// Setup commands in the order first written, replaced by key.
    setup: Vec<(&'static str, String)>,
}

/// The part of a device the engine holds on to.
#[derive(Debug)]
struct DeviceOwner {
    state: Mutex<DeviceState>,
}

impl DeviceOwner {
    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PortOwner for DeviceOwner {
    fn shutdown_commands(&self, port: PortId) -> Vec<String> {
        let state = self.lock();
        let command = CommandBuilder::for_port(port).select(None);
        let command = if state.type_id == MATRIX_TYPE_ID {
            command.write1(&MATRIX_BLANK)
        } else {
            command.off()
        };
        vec![command.build()]
    }

    fn reset_commands(&self, port: PortId) -> Vec<String> {
        let state = self.lock();
        let mut commands: Vec<String> = state.setup.iter().map(|(_, c)| c.clone()).collect();
        if let Mode::Combi(pairs) = &state.mode {
            commands.push(CommandBuilder::for_port(port).combi(COMBI_INDEX, pairs).build());
        }
        if state.streaming
            && let Some(mode) = state.mode.select_index()
        {
            commands.push(CommandBuilder::for_port(port).select(Some(mode)).build());
        }
        commands
    }
}

/// Exclusive handle onto the device attached to one port.
pub struct Device {
    hat: Hat,
    port: PortId,
    type_id: i32,
    owner: Arc<DeviceOwner>,
    ownership: Ownership,
    /// Strong half of the registered callback; the engine only holds it weakly.
    callback: Mutex<Option<Callback>>,
    released: AtomicBool,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("port", &self.port)
            .field("type_id", &self.type_id)
            .field("mode", &self.mode())
            .field("released", &self.released.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Take ownership of `port`, which must carry a device of class
    /// `expected` (as named by [`device_name`]). Devices outside the
    /// catalogue are accepted for any class.
    ///
    /// # Errors
    /// - `HatError::DeviceNotFound` if the port is empty or carries another class
    /// - `HatError::PortInUse` if another handle owns the port
    pub fn acquire(hat: &Hat, port: PortId, expected: &str) -> Result<Self> {
        let info = hat.port_info(port);
        if !info.connected {
            return Err(HatError::device_not_found(port, expected, info.name));
        }
        if info.name != UNKNOWN_NAME && info.name != expected {
            return Err(HatError::device_not_found(port, expected, info.name));
        }

        let owner = Arc::new(DeviceOwner {
            state: Mutex::new(DeviceState {
                type_id: info.type_id,
                mode: Mode::None,
                streaming: false,
                setup: Vec::new(),
            }),
        });
        let ownership = hat.acquire(port, Arc::clone(&owner) as Arc<dyn PortOwner>)?;
        debug!(%port, type_id = info.type_id, name = info.name, "Device acquired");

        Ok(Self {
            hat: hat.clone(),
            port,
            type_id: info.type_id,
            owner,
            ownership,
            callback: Mutex::new(None),
            released: AtomicBool::new(false),
        })
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    /// Type id the device had when acquired.
    pub fn type_id(&self) -> i32 {
        self.type_id
    }

    pub fn name(&self) -> &'static str {
        device_name(self.type_id)
    }

    pub fn description(&self) -> &'static str {
        device_description(self.type_id)
    }

    pub fn hat(&self) -> &Hat {
        &self.hat
    }

    pub fn mode(&self) -> Mode {
        self.owner.lock().mode.clone()
    }

    /// True if the device this handle was created for is still attached.
    pub fn is_connected(&self) -> bool {
        self.ensure_connected().is_ok()
    }

    /// Check that this handle still owns the port and the same device is
    /// attached.
    ///
    /// # Errors
    /// - `HatError::InvalidArgument` after [`release`](Self::release)
    /// - `HatError::DeviceNotFound` if the device was unplugged
    /// - `HatError::DeviceChanged` if another device took its place
    pub fn ensure_connected(&self) -> Result<()> {
        if self.released.load(Ordering::Acquire) || !self.hat.is_owner(&self.ownership) {
            return Err(HatError::invalid_argument(format!(
                "port {} was released",
                self.port
            )));
        }
        let info = self.hat.port_info(self.port);
        if !info.connected {
            return Err(HatError::device_not_found(self.port, self.name(), info.name));
        }
        if info.type_id != self.type_id {
            return Err(HatError::DeviceChanged {
                port: self.port,
                expected: self.type_id,
                found: info.type_id,
            });
        }
        Ok(())
    }

    /// Write a command after checking the device is still there.
    pub async fn send(&self, command: CommandBuilder) -> Result<()> {
        self.ensure_connected()?;
        self.hat.send(&command.build()).await
    }

    /// Write a setup command and remember it under `key`, so it is replayed
    /// after a HAT reboot. A later call with the same key replaces it.
    pub async fn configure(&self, key: &'static str, command: CommandBuilder) -> Result<()> {
        let line = command.build();
        self.ensure_connected()?;
        self.hat.send(&line).await?;
        let mut state = self.owner.lock();
        match state.setup.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = line,
            None => state.setup.push((key, line)),
        }
        Ok(())
    }

    fn port_command(&self) -> CommandBuilder {
        CommandBuilder::for_port(self.port)
    }

    /// Read single mode `mode` from now on.
    ///
    /// # Errors
    /// See [`ensure_connected`](Self::ensure_connected).
    pub async fn mode_simple(&self, mode: u8) -> Result<()> {
        self.ensure_connected()?;
        let had_combi = matches!(self.owner.lock().mode, Mode::Combi(_));
        if had_combi {
            self.send(self.port_command().combi(COMBI_INDEX, &[])).await?;
        }
        self.owner.lock().mode = Mode::Simple(mode);
        Ok(())
    }

    /// Read the `(mode, dataset)` pairs together from now on.
    ///
    /// # Errors
    /// Returns `HatError::InvalidArgument` for an empty list.
    pub async fn mode_combi(&self, pairs: &[(u8, u8)]) -> Result<()> {
        if pairs.is_empty() {
            return Err(HatError::invalid_argument("combi mode needs at least one pair"));
        }
        self.send(self.port_command().combi(COMBI_INDEX, pairs)).await?;
        self.owner.lock().mode = Mode::Combi(pairs.to_vec());
        Ok(())
    }

    fn select_index(&self) -> Result<u8> {
        self.owner
            .lock()
            .mode
            .select_index()
            .ok_or(HatError::InvalidMode { port: self.port })
    }

    /// Start streaming the current mode.
    pub async fn select(&self) -> Result<()> {
        let mode = self.select_index()?;
        self.send(self.port_command().select(Some(mode))).await?;
        self.owner.lock().streaming = true;
        Ok(())
    }

    /// Stop streaming.
    pub async fn deselect(&self) -> Result<()> {
        self.send(self.port_command().select(None)).await?;
        self.owner.lock().streaming = false;
        Ok(())
    }

    /// Request one sample of the current mode.
    ///
    /// # Errors
    /// - `HatError::InvalidMode` if no mode was set
    /// - `HatError::Timeout` if no sample arrives within `timeout`
    /// - `HatError::ChecksumMismatch` / `HatError::Cancelled` if the device
    ///   drops off the link while waiting
    pub async fn get(&self, timeout: Duration) -> Result<Sample> {
        let mode = self.select_index()?;
        self.ensure_connected()?;
        let pending = self.hat.expect_sample(self.port);
        self.send(self.port_command().selonce(mode)).await?;
        pending.wait(timeout).await
    }

    /// Power the device at full limit.
    pub async fn on(&self) -> Result<()> {
        self.send(self.port_command().plimit(1.0).on()).await
    }

    pub async fn off(&self) -> Result<()> {
        self.send(self.port_command().off()).await
    }

    /// Drive the device in reverse at full limit.
    pub async fn reverse(&self) -> Result<()> {
        self.send(self.port_command().plimit(1.0).set(-1.0)).await
    }

    /// Send raw bytes to the device.
    pub async fn write1(&self, bytes: &[u8]) -> Result<()> {
        self.send(self.port_command().write1(bytes)).await
    }

    /// Call `callback` with every sample of the current mode, or stop with
    /// `None`. Callbacks run on the dispatch worker, never on the reader, and
    /// each returned future finishes before the next sample is dispatched.
    ///
    /// # Errors
    /// Returns `HatError::InvalidMode` when setting a callback with no mode.
    pub async fn set_callback(&self, callback: Option<Callback>) -> Result<()> {
        match callback {
            Some(callback) => {
                self.select_index()?;
                self.ensure_connected()?;
                self.hat
                    .set_callback(self.port, Some(Arc::downgrade(&callback)));
                *self.lock_callback() = Some(callback);
                self.select().await
            }
            None => {
                let result = self.deselect().await;
                self.hat.set_callback(self.port, None);
                *self.lock_callback() = None;
                result
            }
        }
    }

    fn lock_callback(&self) -> MutexGuard<'_, Option<Callback>> {
        self.callback.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Give the port up: pending waits are cancelled and, if the device is
    /// still attached, it is deselected and switched off. Idempotent.
    pub async fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(port = %self.port, "Releasing device");
        *self.lock_callback() = None;
        self.hat.release(self.ownership).await
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let hat = self.hat.clone();
        let ownership = self.ownership;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = hat.release(ownership).await {
                        debug!("Release of dropped device failed: {e}");
                    }
                });
            }
            Err(_) => {
                trace!(port = %self.port, "No runtime, abandoning port");
                hat.abandon(ownership);
            }
        }
    }
}
