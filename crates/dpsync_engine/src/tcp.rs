//! TCP transport speaking length-prefixed CBOR frames.

use crate::error::{SyncError, SyncResult};
use crate::transport::{SyncConnection, SyncTransport, UpdateStream};
use bytes::BytesMut;
use dpsync_protocol::{
    decode_frame, write_frame, DataplaneStats, Frame, ProtocolError, SyncRequest, UpdateEnvelope,
};
use std::io::{ErrorKind, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

const READ_CHUNK: usize = 8 * 1024;

/// Default upper bound on a single blocking read.
pub const DEFAULT_READ_POLL: Duration = Duration::from_millis(200);

/// Transport that dials the sync service over plain TCP.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    nodelay: bool,
    read_poll: Duration,
}

impl TcpTransport {
    /// Creates a transport with `TCP_NODELAY` enabled.
    pub fn new() -> Self {
        Self {
            nodelay: true,
            read_poll: DEFAULT_READ_POLL,
        }
    }

    /// Sets `TCP_NODELAY` on dialled sockets.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Sets how long a read may block before
    /// [`recv`](UpdateStream::recv) returns `Ok(None)`. Must be non-zero.
    pub fn with_read_poll(mut self, poll: Duration) -> Self {
        self.read_poll = poll;
        self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncTransport for TcpTransport {
    type Connection = TcpConnection;

    fn dial(&self, target: &str, timeout: Duration) -> SyncResult<TcpConnection> {
        let addrs = target
            .to_socket_addrs()
            .map_err(|e| SyncError::dial(target, e.to_string()))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(self.nodelay)?;
                    stream.set_read_timeout(Some(self.read_poll))?;
                    debug!(%addr, "connected to sync service");
                    return Ok(TcpConnection { stream });
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(SyncError::dial(
            target,
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "address resolved to nothing".into()),
        ))
    }
}

/// An open TCP connection, before subscribing.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
}

impl SyncConnection for TcpConnection {
    type Stream = TcpUpdateStream;

    fn subscribe(mut self, request: &SyncRequest) -> SyncResult<TcpUpdateStream> {
        write_frame(&mut self.stream, &Frame::Subscribe(request.clone()))
            .map_err(|e| SyncError::Subscribe(e.to_string()))?;

        Ok(TcpUpdateStream {
            stream: self.stream,
            buf: BytesMut::with_capacity(READ_CHUNK),
        })
    }
}

/// Update stream over a subscribed TCP connection.
#[derive(Debug)]
pub struct TcpUpdateStream {
    stream: TcpStream,
    buf: BytesMut,
}

impl UpdateStream for TcpUpdateStream {
    fn recv(&mut self) -> SyncResult<Option<UpdateEnvelope>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = decode_frame(&mut self.buf)? {
                return match frame {
                    Frame::Update(update) => Ok(Some(update)),
                    Frame::Error(message) => Err(SyncError::Stream(message)),
                    other => Err(ProtocolError::UnexpectedFrame {
                        expected: "update",
                        actual: other.kind_name(),
                    }
                    .into()),
                };
            }

            let n = match self.stream.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None)
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                return Err(SyncError::Stream("closed by server".into()));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn report(&mut self, stats: &DataplaneStats) -> SyncResult<()> {
        write_frame(&mut self.stream, &Frame::Report(stats.clone()))
            .map_err(|e| SyncError::Report(e.to_string()))
    }
}
