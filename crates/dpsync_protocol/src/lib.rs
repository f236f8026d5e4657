//! # dpsync Protocol
//!
//! Envelope types and framing for the dpsync policy feed.
//!
//! This crate provides:
//! - `SyncRequest`, the subscription descriptor sent when a stream opens
//! - `UpdateEnvelope` and `UpdateKind` for updates pushed by the server
//! - `DataplaneStats`, reported back by clients that support it
//! - `Frame`, the unit carried on the wire
//! - Length-prefixed CBOR encoding/decoding of frames
//!
//! This is a pure protocol crate with no threads. Update bodies are opaque
//! here; their meaning belongs to whoever programs the dataplane.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod framing;
mod messages;

pub use error::{ProtocolError, ProtocolResult};
pub use framing::{
    decode_frame, encode_frame, read_frame, write_frame, LENGTH_PREFIX_LEN, MAX_FRAME_LEN,
};
pub use messages::{DataplaneStats, Frame, SyncRequest, UpdateEnvelope, UpdateKind};
