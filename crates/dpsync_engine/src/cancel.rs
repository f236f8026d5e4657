//! Shared cancellation signal.

use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// A cloneable, one-shot cancellation signal shared between threads.
///
/// Once fired it stays fired. Waiters parked in [`wait`](Self::wait) or
/// [`wait_timeout`](Self::wait_timeout) are woken immediately. Signals made
/// with [`child`](Self::child) fire with their parent but can also be fired
/// on their own.
#[derive(Clone, Default)]
pub struct CancelSignal {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

#[derive(Default)]
struct State {
    cancelled: bool,
    children: Vec<Weak<Inner>>,
}

impl CancelSignal {
    /// Creates a signal that has not fired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal and every live child. Idempotent.
    pub fn cancel(&self) {
        let children = {
            let mut state = self.inner.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            self.inner.cond.notify_all();
            std::mem::take(&mut state.children)
        };

        for child in children.iter().filter_map(Weak::upgrade) {
            CancelSignal { inner: child }.cancel();
        }
    }

    /// Returns true once the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }

    /// Creates a signal that fires when this one does.
    ///
    /// Cancelling the child leaves the parent untouched. A child of an
    /// already fired signal starts out fired.
    pub fn child(&self) -> CancelSignal {
        let child = CancelSignal::new();
        let mut state = self.inner.state.lock();
        if state.cancelled {
            child.inner.state.lock().cancelled = true;
        } else {
            state.children.retain(|c| c.strong_count() > 0);
            state.children.push(Arc::downgrade(&child.inner));
        }
        child
    }

    /// Returns a guard that fires this signal when dropped, including
    /// during unwinding.
    pub fn drop_guard(self) -> CancelGuard {
        CancelGuard { signal: self }
    }

    /// Blocks until the signal fires.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        while !state.cancelled {
            self.inner.cond.wait(&mut state);
        }
    }

    /// Blocks for at most `timeout`.
    ///
    /// Returns true if the signal fired, false if the timeout elapsed first.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.cancelled {
            if self
                .inner
                .cond
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.cancelled;
            }
        }
        true
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Fires a [`CancelSignal`] when dropped.
#[derive(Debug)]
#[must_use = "the signal fires as soon as the guard is dropped"]
pub struct CancelGuard {
    signal: CancelSignal,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.signal.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn starts_clear() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn cancel_is_sticky_and_shared() {
        let signal = CancelSignal::new();
        let clone = signal.clone();
        clone.cancel();
        clone.cancel();
        assert!(signal.is_cancelled());
        assert!(signal.wait_timeout(Duration::from_secs(10)));
        signal.wait();
    }

    #[test]
    fn wakes_parked_waiter() {
        let signal = CancelSignal::new();
        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let fired = signal.wait_timeout(Duration::from_secs(30));
                (fired, start.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(20));
        signal.cancel();

        let (fired, waited) = waiter.join().unwrap();
        assert!(fired);
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn child_follows_parent() {
        let parent = CancelSignal::new();
        let child = parent.child();
        let grandchild = child.child();

        let waiter = {
            let grandchild = grandchild.clone();
            thread::spawn(move || grandchild.wait())
        };
        parent.cancel();
        waiter.join().unwrap();

        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert!(parent.child().is_cancelled());
    }

    #[test]
    fn child_cancel_leaves_parent() {
        let parent = CancelSignal::new();
        let child = parent.child();
        child.cancel();

        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn drop_guard_fires_on_unwind() {
        let signal = CancelSignal::new();
        let result = {
            let guard = signal.clone().drop_guard();
            thread::spawn(move || {
                let _guard = guard;
                panic!("handler failed");
            })
            .join()
        };

        assert!(result.is_err());
        assert!(signal.is_cancelled());
    }
}
