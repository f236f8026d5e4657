//! Bounded backlog of unreported dataplane statistics.
//!
//! Statistics arrive in aggregated sets, one per flush period of whatever
//! collects them. The backlog keeps the newest [`MAX_STATS_BACKLOG`] sets and
//! drops the oldest first, so a long outage loses old data rather than
//! growing without bound. It outlives any single connection: whatever was
//! not reported before a stream broke is reported after the reconnect.

use crate::error::SyncResult;
use dpsync_protocol::DataplaneStats;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Default number of unreported stats sets kept.
pub const MAX_STATS_BACKLOG: usize = 5;

struct StatsSet {
    id: u64,
    stats: VecDeque<DataplaneStats>,
}

struct Inner {
    sets: VecDeque<StatsSet>,
    next_id: u64,
    dropped_sets: u64,
}

/// Thread-safe queue of stats sets waiting to be reported.
pub struct StatsBacklog {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl StatsBacklog {
    /// Creates a backlog holding at most [`MAX_STATS_BACKLOG`] sets.
    pub fn new() -> Self {
        Self::with_capacity(MAX_STATS_BACKLOG)
    }

    /// Creates a backlog holding at most `capacity` sets (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                sets: VecDeque::new(),
                next_id: 0,
                dropped_sets: 0,
            }),
        }
    }

    /// Maximum number of sets kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queues one aggregated set, dropping the oldest sets beyond capacity.
    ///
    /// Empty reports are discarded; a set with nothing left is not queued.
    pub fn push(&self, set: impl IntoIterator<Item = DataplaneStats>) {
        let stats: VecDeque<_> = set.into_iter().filter(|s| !s.is_empty()).collect();
        if stats.is_empty() {
            return;
        }

        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.sets.push_back(StatsSet { id, stats });

        let excess = inner.sets.len().saturating_sub(self.capacity);
        if excess > 0 {
            warn!(dropped = excess, "dropping old unreported statistics");
            inner.sets.drain(..excess);
            inner.dropped_sets += excess as u64;
        }
    }

    /// Number of sets waiting.
    pub fn len(&self) -> usize {
        self.inner.lock().sets.len()
    }

    /// Returns true if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of individual reports waiting across all sets.
    pub fn pending_reports(&self) -> usize {
        self.inner.lock().sets.iter().map(|s| s.stats.len()).sum()
    }

    /// Sets dropped so far because the backlog was full.
    pub fn dropped_sets(&self) -> u64 {
        self.inner.lock().dropped_sets
    }

    /// Reports queued stats oldest first until the backlog is empty or
    /// `report` fails.
    ///
    /// Each report is removed only after `report` accepted it, so a failure
    /// leaves it at the head for the next flush. `report` runs without the
    /// backlog lock held. Returns how many reports were sent.
    pub fn flush<F>(&self, mut report: F) -> SyncResult<usize>
    where
        F: FnMut(&DataplaneStats) -> SyncResult<()>,
    {
        let mut sent = 0;
        loop {
            let head = {
                let inner = self.inner.lock();
                inner
                    .sets
                    .front()
                    .and_then(|set| set.stats.front().map(|stats| (set.id, stats.clone())))
            };
            let Some((id, next)) = head else {
                break;
            };

            report(&next)?;
            sent += 1;

            let mut inner = self.inner.lock();
            // The set may have been aged out while the report was in flight.
            if inner.sets.front().map(|s| s.id) == Some(id) {
                if let Some(set) = inner.sets.front_mut() {
                    set.stats.pop_front();
                    if set.stats.is_empty() {
                        inner.sets.pop_front();
                    }
                }
            }
        }

        if sent > 0 {
            debug!(sent, "reported aggregated statistics");
        }
        Ok(sent)
    }
}

impl Default for StatsBacklog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StatsBacklog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsBacklog")
            .field("capacity", &self.capacity)
            .field("sets", &self.len())
            .finish()
    }
}
