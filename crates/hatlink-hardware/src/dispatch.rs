//! Callback dispatch worker.
//!
//! User callbacks never run on the reader loop. The reader enqueues a
//! [`CallbackEvent`] per data line and a dedicated worker task awaits them
//! one at a time, in arrival order. A callback returns a future, so it can
//! call back into the engine (send a command, wait for a sample) before the
//! next event is dispatched, while the reader keeps delivering the
//! completions it waits on.
//!
//! ```
//! use hatlink_hardware::dispatch::{self, Callback};
//!
//! let callback: Callback = dispatch::callback(|values| async move {
//!     println!("{values:?}");
//! });
//! ```
//!
//! Events hold the callback weakly: if its owner dropped it between enqueue
//! and dispatch, the event is skipped.

use std::future::Future;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use hatlink_core::{PortId, Sample};

/// The function behind a [`Callback`].
pub type CallbackFn = dyn Fn(Sample) -> BoxFuture<'static, ()> + Send + Sync;

/// A data callback. Receives the values of one data line; the worker awaits
/// the returned future before dispatching the next event.
pub type Callback = Arc<CallbackFn>;

/// Wrap an async closure as a [`Callback`].
pub fn callback<F, Fut>(f: F) -> Callback
where
    F: Fn(Sample) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |values| f(values).boxed())
}

/// One queued invocation.
pub struct CallbackEvent {
    pub port: PortId,
    pub callback: Weak<CallbackFn>,
    pub values: Sample,
}

impl std::fmt::Debug for CallbackEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackEvent")
            .field("port", &self.port)
            .field("values", &self.values)
            .finish_non_exhaustive()
    }
}

/// Sending side of the callback queue, held by the reader loop.
#[derive(Debug, Clone)]
pub struct CallbackQueue {
    tx: mpsc::UnboundedSender<CallbackEvent>,
}

impl CallbackQueue {
    /// Queue an event. Returns `false` once the worker has stopped.
    pub fn enqueue(&self, event: CallbackEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Spawn the worker. It runs until every [`CallbackQueue`] clone is dropped,
/// then drains what is left and exits.
pub fn spawn_worker() -> (CallbackQueue, JoinHandle<usize>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<CallbackEvent>();

    let handle = tokio::spawn(async move {
        let mut invoked = 0usize;
        while let Some(event) = rx.recv().await {
            match event.callback.upgrade() {
                Some(callback) => {
                    trace!(port = %event.port, "Dispatching callback");
                    callback(event.values).await;
                    invoked += 1;
                }
                None => trace!(port = %event.port, "Callback dropped before dispatch"),
            }
        }
        debug!(invoked, "Callback worker stopped");
        invoked
    });

    (CallbackQueue { tx }, handle)
}
