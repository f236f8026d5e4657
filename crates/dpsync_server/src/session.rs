//! Per-subscriber session handling.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::log::{LogEvent, UpdateLog};
use bytes::BytesMut;
use dpsync_protocol::{decode_frame, read_frame, write_frame, Frame, SyncRequest, UpdateEnvelope};
use std::io::{ErrorKind, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const WAIT_SLICE: Duration = Duration::from_millis(250);
const REJECT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);
const READ_CHUNK: usize = 4 * 1024;

/// Serves one subscriber until it disconnects, the log moves past
/// `generation`, or the server shuts down.
///
/// The subscriber first receives the whole log as a snapshot, then an
/// in-sync marker, then live updates as they are published. Statistics
/// reports sent back on the same connection are recorded in the log.
pub(crate) fn serve(
    mut socket: TcpStream,
    log: &UpdateLog,
    config: &ServerConfig,
    generation: u64,
) -> ServerResult<()> {
    // Reads poll in slices so a quiet peer still sees disconnects and
    // shutdown.
    socket.set_read_timeout(Some(WAIT_SLICE))?;
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let request = match read_subscription(
        &mut socket,
        &mut buf,
        log,
        generation,
        config.subscribe_timeout,
    )? {
        Some(request) => request,
        None => {
            debug!("dropped before subscribing");
            return Ok(());
        }
    };
    info!(
        subscription = %request.subscription,
        stats = request.supports_dataplane_stats,
        "subscriber connected"
    );

    let reader = socket.try_clone()?;
    let peer_gone = AtomicBool::new(false);
    thread::scope(|scope| {
        scope.spawn(|| {
            match read_reports(reader, buf, log) {
                Ok(()) => debug!("subscriber closed its side"),
                Err(e) if e.is_client_error() => {
                    warn!(error = %e, "dropping misbehaving subscriber")
                }
                Err(e) => debug!(error = %e, "report reader stopped"),
            }
            peer_gone.store(true, Ordering::SeqCst);
        });

        let result = stream_updates(&mut socket, log, &request, generation, &peer_gone);
        // Unblocks the reader.
        let _ = socket.shutdown(Shutdown::Both);
        result
    })
}

fn stream_updates(
    socket: &mut TcpStream,
    log: &UpdateLog,
    request: &SyncRequest,
    generation: u64,
    peer_gone: &AtomicBool,
) -> ServerResult<()> {
    let snapshot = log.updates_from(0);
    let mut cursor = snapshot.len();
    let mut last_sequence = 0;
    for update in snapshot {
        last_sequence = update.sequence;
        write_frame(socket, &Frame::Update(update))?;
    }
    write_frame(socket, &Frame::Update(UpdateEnvelope::in_sync(last_sequence)))?;
    debug!(cursor, "snapshot sent");

    while !peer_gone.load(Ordering::SeqCst) {
        match log.wait(cursor, generation, WAIT_SLICE) {
            LogEvent::Updates(updates) => {
                cursor += updates.len();
                for update in updates {
                    write_frame(socket, &Frame::Update(update))?;
                }
            }
            LogEvent::Idle => {}
            LogEvent::Disconnect => {
                info!(subscription = %request.subscription, "dropping subscriber on request");
                return Ok(());
            }
            LogEvent::Shutdown => {
                let _ = write_frame(socket, &Frame::Error("server shutting down".into()));
                return Err(ServerError::ShuttingDown);
            }
        }
    }
    debug!(subscription = %request.subscription, "subscriber went away");
    Ok(())
}

/// Records `Report` frames until the subscriber closes the connection.
///
/// `buf` holds whatever arrived behind the subscribe frame. Any other frame
/// on an open subscription is a protocol violation.
fn read_reports(mut socket: TcpStream, mut buf: BytesMut, log: &UpdateLog) -> ServerResult<()> {
    loop {
        while let Some(frame) = decode_frame(&mut buf)? {
            match frame {
                Frame::Report(stats) => log.record_report(stats),
                other => {
                    return Err(ServerError::InvalidRequest(format!(
                        "unexpected {} frame on an open subscription",
                        other.kind_name()
                    )))
                }
            }
        }

        if !read_some(&mut socket, &mut buf)? {
            return Ok(());
        }
    }
}

/// Waits for the subscribe frame.
///
/// Returns `None` if the log generation changed first. A peer that sends
/// nothing within `timeout` is rejected.
fn read_subscription(
    socket: &mut TcpStream,
    buf: &mut BytesMut,
    log: &UpdateLog,
    generation: u64,
    timeout: Duration,
) -> ServerResult<Option<SyncRequest>> {
    let deadline = Instant::now() + timeout;
    let first = loop {
        if let Some(frame) = decode_frame(buf)? {
            break frame;
        }
        if log.is_shutdown() {
            return Err(ServerError::ShuttingDown);
        }
        if log.generation() != generation {
            return Ok(None);
        }
        if Instant::now() >= deadline {
            return Err(ServerError::InvalidRequest(format!(
                "no subscribe frame within {timeout:?}"
            )));
        }
        if !read_some(socket, buf)? {
            return Err(ServerError::InvalidRequest("closed before subscribing".into()));
        }
    };

    let error = match first {
        Frame::Subscribe(request) if !request.subscription.is_empty() => return Ok(Some(request)),
        Frame::Subscribe(_) => ServerError::InvalidRequest("empty subscription".into()),
        other => ServerError::InvalidRequest(format!(
            "expected subscribe frame, got {}",
            other.kind_name()
        )),
    };
    let _ = write_frame(socket, &Frame::Error(error.to_string()));
    Err(error)
}

/// Appends whatever arrives within one read timeout to `buf`.
///
/// Returns false once the peer has closed its side.
fn read_some(socket: &mut TcpStream, buf: &mut BytesMut) -> ServerResult<bool> {
    let mut chunk = [0u8; READ_CHUNK];
    match socket.read(&mut chunk) {
        Ok(0) => Ok(false),
        Ok(n) => {
            buf.extend_from_slice(&chunk[..n]);
            Ok(true)
        }
        Err(e)
            if matches!(
                e.kind(),
                ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
            ) =>
        {
            Ok(true)
        }
        Err(e) => Err(e.into()),
    }
}

/// Rejects a connection with an error frame.
///
/// The subscribe frame is drained first so closing the socket does not
/// reset the connection before the subscriber reads the error. A peer that
/// sends nothing is given [`REJECT_DRAIN_TIMEOUT`].
pub(crate) fn reject(mut socket: TcpStream, error: &ServerError) {
    let _ = socket.set_read_timeout(Some(REJECT_DRAIN_TIMEOUT));
    let _ = read_frame(&mut socket);
    let _ = write_frame(&mut socket, &Frame::Error(error.to_string()));
    let _ = socket.shutdown(Shutdown::Write);
}
