//! Unbuffered pipeline between the sync client and its consumers.
//!
//! A pipeline is a rendezvous point: [`PipelineSender::send`] parks until a
//! consumer has taken the item, so nothing is ever queued behind a slow
//! consumer. Only the owning side can close it; consumers holding a
//! [`PipelineHandle`] observe the close as `None` from `recv`.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Creates a connected sender/handle pair for the given epoch.
pub(crate) fn channel<T>(epoch: u64) -> (PipelineSender<T>, PipelineHandle<T>) {
    let shared = Arc::new(Shared {
        epoch,
        state: Mutex::new(State {
            slot: None,
            closed: false,
        }),
        item_ready: Condvar::new(),
        item_taken: Condvar::new(),
    });
    (
        PipelineSender {
            shared: Arc::clone(&shared),
        },
        PipelineHandle { shared },
    )
}

struct Shared<T> {
    epoch: u64,
    state: Mutex<State<T>>,
    item_ready: Condvar,
    item_taken: Condvar,
}

struct State<T> {
    slot: Option<T>,
    closed: bool,
}

/// Outcome of [`PipelineHandle::recv_timeout`].
#[derive(Debug, PartialEq, Eq)]
pub enum RecvTimeout<T> {
    /// An item was received.
    Item(T),
    /// No item arrived before the timeout.
    TimedOut,
    /// The pipeline was closed.
    Closed,
}

/// Read side of a pipeline. Cheap to clone.
pub struct PipelineHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for PipelineHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> PipelineHandle<T> {
    /// Reconnect epoch this handle belongs to.
    pub fn epoch(&self) -> u64 {
        self.shared.epoch
    }

    /// Returns true once the owner has closed this handle.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Blocks until an item is handed over or the pipeline closes.
    ///
    /// Returns `None` once closed; the caller should fetch the current
    /// pipeline from the client again.
    pub fn recv(&self) -> Option<T> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(item) = state.slot.take() {
                self.shared.item_taken.notify_all();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.shared.item_ready.wait(&mut state);
        }
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> RecvTimeout<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(item) = state.slot.take() {
                self.shared.item_taken.notify_all();
                return RecvTimeout::Item(item);
            }
            if state.closed {
                return RecvTimeout::Closed;
            }
            if self
                .shared
                .item_ready
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return match state.slot.take() {
                    Some(item) => {
                        self.shared.item_taken.notify_all();
                        RecvTimeout::Item(item)
                    }
                    None if state.closed => RecvTimeout::Closed,
                    None => RecvTimeout::TimedOut,
                };
            }
        }
    }
}

impl<T> std::fmt::Debug for PipelineHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("epoch", &self.shared.epoch)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Write side of a pipeline, owned by the sync client.
pub(crate) struct PipelineSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for PipelineSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> PipelineSender<T> {
    pub(crate) fn epoch(&self) -> u64 {
        self.shared.epoch
    }

    /// Hands `item` to a consumer, parking until it has been taken.
    ///
    /// If the pipeline is closed first the item is returned in `Err`.
    pub(crate) fn send(&self, item: T) -> Result<(), T> {
        let mut state = self.shared.state.lock();

        // Single producer per pipeline, but stay correct if a previous
        // hand-off is somehow still pending.
        while state.slot.is_some() && !state.closed {
            self.shared.item_taken.wait(&mut state);
        }
        if state.closed {
            return Err(item);
        }

        state.slot = Some(item);
        self.shared.item_ready.notify_one();

        while state.slot.is_some() {
            if state.closed {
                return match state.slot.take() {
                    Some(item) => Err(item),
                    None => Ok(()),
                };
            }
            self.shared.item_taken.wait(&mut state);
        }
        Ok(())
    }

    /// Closes the pipeline and wakes every parked sender and receiver.
    pub(crate) fn close(&self) {
        let mut state = self.shared.state.lock();
        if !state.closed {
            state.closed = true;
            self.shared.item_ready.notify_all();
            self.shared.item_taken.notify_all();
        }
    }
}
