//! # dpsync Server
//!
//! Reference streaming sync server for dpsync agents.
//!
//! This crate provides:
//! - An ordered in-memory update log with server-assigned sequences
//! - A TCP listener speaking the length-prefixed CBOR frames of
//!   `dpsync_protocol`
//! - Per-subscriber sessions: full snapshot, in-sync marker, then live
//!   updates
//! - Intake of dataplane statistics reports from subscribers
//! - Forced disconnects, used to exercise client reconnection
//!
//! # Protocol
//!
//! 1. Subscriber connects and sends a `Subscribe` frame
//! 2. Server replays every update in the log, then an `InSync` marker
//! 3. Server streams new updates as they are published, while the
//!    subscriber may send `Report` frames with dataplane statistics
//! 4. On shutdown the server sends an `Error` frame and closes

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod log;
mod server;
mod session;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use log::{LogEvent, UpdateLog};
pub use server::SyncServer;
