//! Completion table: one-shot waits resolved by the reader loop.
//!
//! A caller that needs to block on an asynchronous completion registers a
//! [`Pending`] *before* writing the command that triggers it, so the reply
//! can never race ahead of the waiter. The reader loop then resolves it:
//!
//! ```text
//! caller                         reader loop
//!   │ register_ramp(port)             │
//!   │ write "set ramp ..."            │
//!   │ pending.wait(timeout) ...       │
//!   │                                 │◄── "P0: ramp done"
//!   │                                 │ fulfil_ramp(port)
//!   │◄────────── Ok(()) ──────────────│
//! ```
//!
//! Data and voltage replies are broadcast to every waiter registered when
//! they arrive. Ramp and pulse completions answer exactly one command each,
//! so they resolve the oldest waiter only. Every wait is bounded: an
//! unfulfilled [`Pending`] fails with `HatError::Timeout`, and a waiter
//! dropped by [`CompletionTable::cancel_port`] fails with
//! `HatError::Cancelled`.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use hatlink_core::{HatError, PortId, Result, Sample, WaitKind, constants::NUM_PORTS};

type Waiter<T> = oneshot::Sender<Result<T>>;

/// A registered wait for one completion.
#[derive(Debug)]
#[must_use = "a pending completion does nothing unless waited on"]
pub struct Pending<T> {
    kind: WaitKind,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Pending<T> {
    /// Which completion this waits for.
    pub fn kind(&self) -> WaitKind {
        self.kind
    }

    /// Wait for the completion, at most `timeout`.
    ///
    /// # Errors
    /// - `HatError::Timeout` if nothing arrived in time
    /// - `HatError::Cancelled` if the wait was abandoned
    /// - any error the reader loop resolved the wait with
    pub async fn wait(self, timeout: Duration) -> Result<T> {
        match tokio::time::timeout(timeout, self.rx).await {
            Err(_) => Err(HatError::timeout(self.kind, timeout)),
            Ok(Err(_)) => Err(HatError::cancelled(self.kind)),
            Ok(Ok(result)) => result,
        }
    }
}

#[derive(Default)]
struct PortWaiters {
    data: Vec<Waiter<Sample>>,
    ramp: VecDeque<Waiter<()>>,
    pulse: VecDeque<Waiter<()>>,
}

impl PortWaiters {
    fn prune(&mut self) {
        self.data.retain(|tx| !tx.is_closed());
        self.ramp.retain(|tx| !tx.is_closed());
        self.pulse.retain(|tx| !tx.is_closed());
    }
}

#[derive(Default)]
struct Inner {
    ports: [PortWaiters; NUM_PORTS],
    voltage: Vec<Waiter<f64>>,
}

/// Pending completions for every port and the supply voltage.
#[derive(Default)]
pub struct CompletionTable {
    inner: Mutex<Inner>,
}

impl CompletionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending<T>(kind: WaitKind) -> (Waiter<T>, Pending<T>) {
        let (tx, rx) = oneshot::channel();
        (tx, Pending { kind, rx })
    }

    /// Wait for the next data sample on `port`.
    pub fn register_data(&self, port: PortId) -> Pending<Sample> {
        let (tx, pending) = Self::pending(WaitKind::PortData);
        let mut inner = self.lock();
        let waiters = &mut inner.ports[port.index()];
        waiters.prune();
        waiters.data.push(tx);
        pending
    }

    /// Wait for the next `ramp done` on `port`.
    pub fn register_ramp(&self, port: PortId) -> Pending<()> {
        let (tx, pending) = Self::pending(WaitKind::RampDone);
        let mut inner = self.lock();
        let waiters = &mut inner.ports[port.index()];
        waiters.prune();
        waiters.ramp.push_back(tx);
        pending
    }

    /// Wait for the next `pulse done` on `port`.
    pub fn register_pulse(&self, port: PortId) -> Pending<()> {
        let (tx, pending) = Self::pending(WaitKind::PulseDone);
        let mut inner = self.lock();
        let waiters = &mut inner.ports[port.index()];
        waiters.prune();
        waiters.pulse.push_back(tx);
        pending
    }

    /// Wait for the next supply voltage reply.
    pub fn register_voltage(&self) -> Pending<f64> {
        let (tx, pending) = Self::pending(WaitKind::SupplyVoltage);
        let mut inner = self.lock();
        inner.voltage.retain(|tx| !tx.is_closed());
        inner.voltage.push(tx);
        pending
    }

    /// Deliver a sample to every data waiter on `port`. Returns how many were woken.
    pub fn fulfil_data(&self, port: PortId, sample: &Sample) -> usize {
        let waiters = std::mem::take(&mut self.lock().ports[port.index()].data);
        waiters
            .into_iter()
            .map(|tx| tx.send(Ok(sample.clone())).is_ok())
            .filter(|delivered| *delivered)
            .count()
    }

    /// Resolve the oldest live ramp waiter on `port`.
    pub fn fulfil_ramp(&self, port: PortId) -> bool {
        let mut inner = self.lock();
        Self::pop_live(&mut inner.ports[port.index()].ramp)
    }

    /// Resolve the oldest live pulse waiter on `port`.
    pub fn fulfil_pulse(&self, port: PortId) -> bool {
        let mut inner = self.lock();
        Self::pop_live(&mut inner.ports[port.index()].pulse)
    }

    fn pop_live(queue: &mut VecDeque<Waiter<()>>) -> bool {
        while let Some(tx) = queue.pop_front() {
            if tx.send(Ok(())).is_ok() {
                return true;
            }
        }
        false
    }

    /// Deliver a voltage to every voltage waiter. Returns how many were woken.
    pub fn fulfil_voltage(&self, volts: f64) -> usize {
        let waiters = std::mem::take(&mut self.lock().voltage);
        waiters
            .into_iter()
            .map(|tx| tx.send(Ok(volts)).is_ok())
            .filter(|delivered| *delivered)
            .count()
    }

    /// Fail every data waiter on `port` with an error built by `error`.
    pub fn fail_data(&self, port: PortId, error: impl Fn() -> HatError) {
        let waiters = std::mem::take(&mut self.lock().ports[port.index()].data);
        for tx in waiters {
            let _ = tx.send(Err(error()));
        }
    }

    /// Abandon every wait on `port`.
    pub fn cancel_port(&self, port: PortId) {
        let waiters = std::mem::take(&mut self.lock().ports[port.index()]);
        Self::cancel(waiters);
    }

    /// Abandon every wait, including voltage.
    pub fn cancel_all(&self) {
        let mut inner = self.lock();
        let ports = std::mem::take(&mut inner.ports);
        let voltage = std::mem::take(&mut inner.voltage);
        drop(inner);

        for waiters in ports {
            Self::cancel(waiters);
        }
        for tx in voltage {
            let _ = tx.send(Err(HatError::cancelled(WaitKind::SupplyVoltage)));
        }
    }

    fn cancel(waiters: PortWaiters) {
        for tx in waiters.data {
            let _ = tx.send(Err(HatError::cancelled(WaitKind::PortData)));
        }
        for tx in waiters.ramp {
            let _ = tx.send(Err(HatError::cancelled(WaitKind::RampDone)));
        }
        for tx in waiters.pulse {
            let _ = tx.send(Err(HatError::cancelled(WaitKind::PulseDone)));
        }
    }

    /// Number of live waiters on `port`, across all kinds.
    pub fn pending_on(&self, port: PortId) -> usize {
        let mut inner = self.lock();
        let waiters = &mut inner.ports[port.index()];
        waiters.prune();
        waiters.data.len() + waiters.ramp.len() + waiters.pulse.len()
    }
}

impl std::fmt::Debug for CompletionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionTable").finish_non_exhaustive()
    }
}
