//! Main sync server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::log::UpdateLog;
use crate::session;
use dpsync_protocol::{DataplaneStats, UpdateKind};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// The sync server.
///
/// Accepts subscribers over TCP and streams the contents of its
/// [`UpdateLog`] to each of them.
///
/// # Example
///
/// ```no_run
/// use dpsync_protocol::{DataplaneStats, UpdateKind};
/// use dpsync_server::{ServerConfig, SyncServer};
///
/// let server = SyncServer::start(ServerConfig::default()).unwrap();
/// server.publish(UpdateKind::PolicyUpdate, "default/allow-dns", b"{}".to_vec());
/// // ...
/// server.shutdown();
/// ```
pub struct SyncServer {
    config: ServerConfig,
    local_addr: SocketAddr,
    log: Arc<UpdateLog>,
    sessions: Arc<AtomicUsize>,
    acceptor: Option<JoinHandle<()>>,
}

impl SyncServer {
    /// Binds the listener and starts accepting subscribers.
    pub fn start(config: ServerConfig) -> ServerResult<Self> {
        Self::start_with_log(config, Arc::new(UpdateLog::new()))
    }

    /// Starts a server that serves an existing log.
    pub fn start_with_log(config: ServerConfig, log: Arc<UpdateLog>) -> ServerResult<Self> {
        let listener = TcpListener::bind(config.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let sessions = Arc::new(AtomicUsize::new(0));

        let acceptor = {
            let config = config.clone();
            let log = Arc::clone(&log);
            let sessions = Arc::clone(&sessions);
            thread::Builder::new()
                .name("dpsync-accept".into())
                .spawn(move || accept_loop(listener, config, log, sessions))?
        };

        info!(addr = %local_addr, "sync server listening");
        Ok(Self {
            config,
            local_addr,
            log,
            sessions,
            acceptor: Some(acceptor),
        })
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Gets the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Gets the update log.
    pub fn log(&self) -> &Arc<UpdateLog> {
        &self.log
    }

    /// Publishes an update to every subscriber. Returns its sequence.
    pub fn publish(&self, kind: UpdateKind, key: impl Into<String>, body: Vec<u8>) -> u64 {
        self.log.publish(kind, key, body)
    }

    /// Statistics reports received from subscribers so far.
    pub fn reports(&self) -> Vec<DataplaneStats> {
        self.log.reports()
    }

    /// Drops every connected subscriber. New connections are still accepted.
    pub fn disconnect_all(&self) {
        self.log.disconnect_all();
    }

    /// Number of live subscriber sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Stops accepting, ends all sessions and waits for the acceptor.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.log.shutdown();
        if let Some(acceptor) = self.acceptor.take() {
            if acceptor.join().is_err() {
                warn!("accept thread panicked");
            }
            info!(addr = %self.local_addr, "sync server stopped");
        }
    }
}

impl Drop for SyncServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    config: ServerConfig,
    log: Arc<UpdateLog>,
    sessions: Arc<AtomicUsize>,
) {
    while !log.is_shutdown() {
        match listener.accept() {
            Ok((socket, peer)) => {
                if let Err(e) = spawn_session(socket, peer, &config, &log, &sessions) {
                    warn!(%peer, error = %e, "failed to start session");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(config.accept_poll_interval);
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                thread::sleep(config.accept_poll_interval);
            }
        }
    }
}

fn spawn_session(
    socket: TcpStream,
    peer: SocketAddr,
    config: &ServerConfig,
    log: &Arc<UpdateLog>,
    sessions: &Arc<AtomicUsize>,
) -> ServerResult<()> {
    socket.set_nonblocking(false)?;
    socket.set_nodelay(true)?;
    socket.set_write_timeout(Some(config.write_timeout))?;

    if sessions.fetch_add(1, Ordering::SeqCst) >= config.max_connections {
        sessions.fetch_sub(1, Ordering::SeqCst);
        // Draining a silent peer must not stall the accept loop.
        let limit = config.max_connections;
        thread::Builder::new()
            .name("dpsync-reject".into())
            .spawn(move || session::reject(socket, &ServerError::TooManyConnections(limit)))?;
        return Err(ServerError::TooManyConnections(limit));
    }

    // Taken before the thread starts so a disconnect issued right after
    // accept still reaches the session.
    let generation = log.generation();
    let log = Arc::clone(log);
    let counter = Arc::clone(sessions);
    let session_config = config.clone();
    let spawned = thread::Builder::new()
        .name(format!("dpsync-session-{peer}"))
        .spawn(move || {
            match session::serve(socket, &log, &session_config, generation) {
                Ok(()) | Err(ServerError::ShuttingDown) => debug!(%peer, "session ended"),
                Err(e) if e.is_client_error() => warn!(%peer, error = %e, "rejected subscriber"),
                Err(e) => debug!(%peer, error = %e, "session closed"),
            }
            counter.fetch_sub(1, Ordering::SeqCst);
        });

    if let Err(e) = spawned {
        sessions.fetch_sub(1, Ordering::SeqCst);
        return Err(e.into());
    }
    Ok(())
}
