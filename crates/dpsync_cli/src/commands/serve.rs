//! Serve command implementation.
//!
//! Feed files hold one update per line:
//!
//! ```text
//! {"kind": "ipset_update", "key": "web-pods", "body": ["10.0.0.1", "10.0.0.2"]}
//! {"kind": "policy_update", "key": "default/allow-web", "body": {"action": "allow"}}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped. `body` is any JSON
//! value and is forwarded as its compact JSON encoding.

use super::wait_for_ctrl_c;
use dpsync_protocol::UpdateKind;
use dpsync_server::{ServerConfig, SyncServer};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Errors reading a feed file.
#[derive(Error, Debug)]
pub enum FeedError {
    /// Feed file could not be read.
    #[error("cannot read feed: {0}")]
    Io(#[from] std::io::Error),

    /// A line is not a valid update.
    #[error("feed line {line}: {message}")]
    InvalidLine {
        /// 1-based line number.
        line: usize,
        /// What was wrong with it.
        message: String,
    },
}

/// One update as written in a feed file.
#[derive(Debug, Deserialize)]
struct FeedLine {
    kind: String,
    key: String,
    #[serde(default)]
    body: serde_json::Value,
}

/// A parsed feed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    /// Update kind.
    pub kind: UpdateKind,
    /// Object key.
    pub key: String,
    /// Encoded body.
    pub body: Vec<u8>,
}

/// Reads a JSON-lines feed file.
pub fn read_feed(path: &Path) -> Result<Vec<FeedEntry>, FeedError> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let invalid = |message: String| FeedError::InvalidLine {
            line: index + 1,
            message,
        };
        let parsed: FeedLine = serde_json::from_str(trimmed).map_err(|e| invalid(e.to_string()))?;
        let kind: UpdateKind = parsed.kind.parse().map_err(|e| invalid(format!("{e}")))?;
        if kind == UpdateKind::InSync {
            return Err(invalid("in_sync markers are generated by the server".into()));
        }
        let body = if parsed.body.is_null() {
            Vec::new()
        } else {
            serde_json::to_vec(&parsed.body).map_err(|e| invalid(e.to_string()))?
        };

        entries.push(FeedEntry {
            kind,
            key: parsed.key,
            body,
        });
    }

    Ok(entries)
}

/// Runs the serve command.
pub fn run(
    bind: SocketAddr,
    feed: Option<&Path>,
    max_connections: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = SyncServer::start(ServerConfig::new(bind).with_max_connections(max_connections))?;

    if let Some(path) = feed {
        let entries = read_feed(path)?;
        let count = entries.len();
        for entry in entries {
            server.publish(entry.kind, entry.key, entry.body);
        }
        info!(path = %path.display(), count, "preloaded feed");
    }

    info!(addr = %server.local_addr(), "serving, press Ctrl-C to stop");
    let waited = wait_for_ctrl_c();
    info!(reports = server.reports().len(), "statistics reports received");
    server.shutdown();
    waited
}
