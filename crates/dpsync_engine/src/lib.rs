//! # dpsync Engine
//!
//! Sync client and update scheduling for dataplane agents.
//!
//! This crate provides:
//! - A reconnecting streaming client (connecting → streaming → retry)
//! - A swappable pipeline handed to consumers, replaced on reconnect
//! - Liveness tracking driven by update arrival
//! - A single-worker, latest-wins coalescing scheduler
//! - A bounded backlog of dataplane statistics reported upstream
//! - A cooperative cancellation signal shared by all of the above
//! - Transport abstraction with TCP and scripted mock implementations
//!
//! ## Architecture
//!
//! The client relays updates from a policy server to whoever holds the
//! current pipeline:
//! 1. Dial the server and open a subscription
//! 2. Forward every update, in receive order, into the current pipeline
//! 3. On failure, mark unhealthy, swap in a new pipeline, wait, retry
//!
//! Downstream, a [`CoalescingScheduler`] lets a slow dataplane writer skip
//! intermediate states: only the newest pending item is ever applied.
//!
//! ## Key Invariants
//!
//! - At most one handler invocation runs at a time
//! - A pending item is replaced, never queued behind another
//! - Liveness is true only after an update arrived on the current stream
//! - Cancellation stops every loop, including a blocked forward

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backlog;
mod cancel;
mod client;
mod config;
mod error;
mod pipeline;
mod scheduler;
mod state;
mod tcp;
mod transport;

pub use backlog::{StatsBacklog, MAX_STATS_BACKLOG};
pub use cancel::{CancelGuard, CancelSignal};
pub use client::{ClientStats, SyncClient};
pub use config::{SyncClientConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_RETRY_DELAY};
pub use error::{SyncError, SyncResult};
pub use pipeline::{PipelineHandle, RecvTimeout};
pub use scheduler::{CoalescingScheduler, Enqueuer, SchedulerState, SchedulerStats};
pub use state::{ClientEvent, ClientState};
pub use tcp::{TcpConnection, TcpTransport, TcpUpdateStream, DEFAULT_READ_POLL};
pub use transport::{
    MockConnection, MockSession, MockStream, MockTransport, SyncConnection, SyncTransport,
    UpdateStream,
};
