//! Latest-wins single-worker scheduler.
//!
//! Producers call [`Enqueuer::enqueue`]; a single worker inside
//! [`CoalescingScheduler::run`] hands the pending item to the handler. The
//! pending slot holds at most one item, so when the handler is slow every
//! enqueue made in the meantime replaces the previous one and only the newest
//! is delivered.

use crate::cancel::CancelSignal;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::thread;
use tracing::debug;

/// Observable state of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Parked or not yet started, nothing being handled.
    Idle,
    /// The handler is executing.
    Running,
    /// Cancellation was observed. Terminal.
    Terminated,
}

/// Counters kept by the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Items passed to `enqueue`.
    pub enqueued: u64,
    /// Items passed to the handler.
    pub delivered: u64,
    /// Items overwritten before the worker picked them up.
    pub superseded: u64,
}

struct Slot<T> {
    pending: Option<T>,
    terminated: bool,
    running: bool,
    stats: SchedulerStats,
}

impl<T> Slot<T> {
    fn state(&self) -> SchedulerState {
        if self.terminated {
            SchedulerState::Terminated
        } else if self.running {
            SchedulerState::Running
        } else {
            SchedulerState::Idle
        }
    }
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock()
    }
}

/// Producer side of a [`CoalescingScheduler`]. Cheap to clone.
pub struct Enqueuer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Enqueuer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Enqueuer<T> {
    /// Replaces the pending item with `item` and wakes the worker.
    ///
    /// Never waits on the handler. Items enqueued after termination are
    /// accepted and never delivered.
    pub fn enqueue(&self, item: T) {
        let mut slot = self.shared.lock();
        if slot.pending.replace(item).is_some() {
            slot.stats.superseded += 1;
        }
        slot.stats.enqueued += 1;
        self.shared.cond.notify_one();
    }

    /// Current scheduler state.
    pub fn state(&self) -> SchedulerState {
        self.shared.lock().state()
    }

    /// Current counters.
    pub fn stats(&self) -> SchedulerStats {
        self.shared.lock().stats
    }
}

/// Runs a handler serially against a one-slot, latest-wins queue.
pub struct CoalescingScheduler<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> CoalescingScheduler<T> {
    /// Creates a scheduler and the enqueuer bound to it.
    pub fn create() -> (CoalescingScheduler<T>, Enqueuer<T>) {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot {
                pending: None,
                terminated: false,
                running: false,
                stats: SchedulerStats::default(),
            }),
            cond: Condvar::new(),
        });
        (
            CoalescingScheduler {
                shared: Arc::clone(&shared),
            },
            Enqueuer { shared },
        )
    }

    /// Returns another enqueuer bound to this scheduler.
    pub fn enqueuer(&self) -> Enqueuer<T> {
        Enqueuer {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Current scheduler state.
    pub fn state(&self) -> SchedulerState {
        self.shared.lock().state()
    }

    /// Invokes `handler` with the freshest pending item until `cancel` fires.
    ///
    /// The handler runs on the calling thread without the scheduler lock
    /// held. A cancellation that fires while the worker is parked wakes it
    /// immediately; one that fires during a handler call takes effect once
    /// that call returns. If the handler panics the scheduler terminates and
    /// the panic propagates out of `run` once the watcher has exited.
    pub fn run<F>(self, cancel: &CancelSignal, mut handler: F)
    where
        F: FnMut(&CancelSignal, T),
    {
        let stop = cancel.child();

        thread::scope(|scope| {
            scope.spawn(|| {
                stop.wait();
                let mut slot = self.shared.lock();
                slot.terminated = true;
                self.shared.cond.notify_all();
            });

            // Releases the watcher on every exit path, unwinding included.
            let _stop_on_exit = stop.clone().drop_guard();

            let mut slot = self.shared.lock();
            loop {
                if slot.terminated || cancel.is_cancelled() {
                    slot.terminated = true;
                    break;
                }

                match slot.pending.take() {
                    Some(item) => {
                        slot.running = true;
                        slot.stats.delivered += 1;
                        MutexGuard::unlocked(&mut slot, || handler(cancel, item));
                        slot.running = false;
                    }
                    None => self.shared.cond.wait(&mut slot),
                }
            }

            debug!(
                delivered = slot.stats.delivered,
                superseded = slot.stats.superseded,
                "coalescing scheduler terminated"
            );
        });
    }
}
