//! Server-side update log.

use dpsync_protocol::{DataplaneStats, UpdateEnvelope, UpdateKind};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// What a waiting session should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// New updates past the session's cursor.
    Updates(Vec<UpdateEnvelope>),
    /// Sessions from an older generation must drop their connection.
    Disconnect,
    /// The server is shutting down.
    Shutdown,
    /// Nothing happened before the timeout.
    Idle,
}

struct LogState {
    updates: Vec<UpdateEnvelope>,
    next_sequence: u64,
    generation: u64,
    shutdown: bool,
    reports: Vec<DataplaneStats>,
}

/// Ordered, append-only log of updates served to every subscriber.
///
/// The log maintains:
/// - All updates in publish order, each with a server-assigned sequence
/// - A generation counter; bumping it tells live sessions to disconnect
/// - A shutdown flag
/// - Statistics reports received from subscribers, in arrival order
pub struct UpdateLog {
    state: Mutex<LogState>,
    changed: Condvar,
}

impl UpdateLog {
    /// Creates an empty log. The first update gets sequence 1.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LogState {
                updates: Vec::new(),
                next_sequence: 1,
                generation: 0,
                shutdown: false,
                reports: Vec::new(),
            }),
            changed: Condvar::new(),
        }
    }

    /// Appends an update and wakes waiting sessions. Returns its sequence.
    pub fn publish(&self, kind: UpdateKind, key: impl Into<String>, body: Vec<u8>) -> u64 {
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state
            .updates
            .push(UpdateEnvelope::new(sequence, kind, key, body));
        self.changed.notify_all();
        sequence
    }

    /// Number of updates in the log.
    pub fn len(&self) -> usize {
        self.state.lock().updates.len()
    }

    /// Returns true if nothing has been published.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence of the most recent update, or 0.
    pub fn last_sequence(&self) -> u64 {
        self.state.lock().next_sequence - 1
    }

    /// Current session generation.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Returns the updates at positions `from..` in the log.
    pub fn updates_from(&self, from: usize) -> Vec<UpdateEnvelope> {
        let state = self.state.lock();
        state.updates.get(from..).unwrap_or_default().to_vec()
    }

    /// Stores a statistics report received from a subscriber.
    pub fn record_report(&self, stats: DataplaneStats) {
        debug!(
            src = %stats.src_ip,
            dst = %stats.dst_ip,
            allowed = stats.http_requests_allowed,
            denied = stats.http_requests_denied,
            "dataplane stats reported"
        );
        self.state.lock().reports.push(stats);
    }

    /// Statistics reports received so far.
    pub fn reports(&self) -> Vec<DataplaneStats> {
        self.state.lock().reports.clone()
    }

    /// Tells every live session to drop its connection.
    pub fn disconnect_all(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        self.changed.notify_all();
    }

    /// Marks the log as shut down and wakes all sessions.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.changed.notify_all();
    }

    /// Returns true once [`shutdown`](Self::shutdown) was called.
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Waits until there is something for a session at log position `from`
    /// that joined in `generation`.
    pub fn wait(&self, from: usize, generation: u64, timeout: Duration) -> LogEvent {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return LogEvent::Shutdown;
            }
            if state.generation != generation {
                return LogEvent::Disconnect;
            }
            if state.updates.len() > from {
                return LogEvent::Updates(state.updates[from..].to_vec());
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return LogEvent::Idle;
            }
        }
    }
}

impl Default for UpdateLog {
    fn default() -> Self {
        Self::new()
    }
}
