//! Reconnecting sync client.
//!
//! [`SyncClient::run`] owns the connection lifecycle: dial, subscribe, relay
//! every received update into the current pipeline, and on any failure wait
//! a fixed delay and start over. Consumers never see transport errors; they
//! see a pipeline that closes when the stream breaks and a fresh one that
//! [`SyncClient::get_pipeline`] returns afterwards.
//!
//! Updates are relayed in receive order within one connection. Nothing is
//! deduplicated or replayed across a reconnect, so the feed must carry
//! self-describing state rather than bare deltas.
//!
//! When the subscription advertises dataplane statistics, the client also
//! drains its [`StatsBacklog`] upstream between receives. A failed report
//! breaks the stream like a failed receive does.

use crate::backlog::StatsBacklog;
use crate::cancel::CancelSignal;
use crate::config::SyncClientConfig;
use crate::error::{SyncError, SyncResult};
use crate::pipeline::{self, PipelineHandle, PipelineSender};
use crate::state::{ClientEvent, ClientState};
use crate::transport::{SyncConnection, SyncTransport, UpdateStream};
use dpsync_protocol::UpdateEnvelope;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Statistics about the client's connection history.
#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    /// Connection attempts made.
    pub dial_attempts: u64,
    /// Attempts that ended in an error (dial, subscribe, stream or report).
    pub failed_attempts: u64,
    /// Subscription streams successfully opened.
    pub streams_opened: u64,
    /// Updates handed to a consumer.
    pub updates_forwarded: u64,
    /// Pipelines replaced after a broken stream.
    pub pipeline_rotations: u64,
    /// Statistics reports sent upstream.
    pub stats_reported: u64,
    /// Last error message.
    pub last_error: Option<String>,
    /// Time the last update was received.
    pub last_update_time: Option<Instant>,
}

struct CurrentPipeline {
    sender: PipelineSender<UpdateEnvelope>,
    handle: PipelineHandle<UpdateEnvelope>,
}

type HealthObserver = Box<dyn Fn(bool) + Send + Sync>;

/// Streaming sync client that survives connection churn.
pub struct SyncClient<T: SyncTransport> {
    config: SyncClientConfig,
    transport: T,
    state: RwLock<ClientState>,
    healthy: AtomicBool,
    running: AtomicBool,
    health_observer: Option<HealthObserver>,
    current: Mutex<CurrentPipeline>,
    backlog: StatsBacklog,
    stats: RwLock<ClientStats>,
}

impl<T: SyncTransport> SyncClient<T> {
    /// Creates a new sync client. Nothing is dialled until [`run`](Self::run).
    pub fn new(config: SyncClientConfig, transport: T) -> Self {
        let (sender, handle) = pipeline::channel(0);
        Self {
            config,
            transport,
            state: RwLock::new(ClientState::Disconnected),
            healthy: AtomicBool::new(false),
            running: AtomicBool::new(false),
            health_observer: None,
            current: Mutex::new(CurrentPipeline { sender, handle }),
            backlog: StatsBacklog::new(),
            stats: RwLock::new(ClientStats::default()),
        }
    }

    /// Registers a callback invoked on every liveness update.
    pub fn with_health_observer(mut self, observer: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.health_observer = Some(Box::new(observer));
        self
    }

    /// Gets the configuration.
    pub fn config(&self) -> &SyncClientConfig {
        &self.config
    }

    /// Gets the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Gets the current connection state.
    pub fn state(&self) -> ClientState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> ClientStats {
        self.stats.read().clone()
    }

    /// Gets the backlog of statistics waiting to be reported.
    ///
    /// Push aggregated sets here; they are sent while a stream is open and
    /// kept across reconnects until sent or aged out.
    pub fn stats_backlog(&self) -> &StatsBacklog {
        &self.backlog
    }

    /// Returns true while updates are flowing.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Returns the pipeline consumers should currently read from.
    ///
    /// The handle closes when the stream feeding it breaks; call this again
    /// to pick up its successor.
    pub fn get_pipeline(&self) -> PipelineHandle<UpdateEnvelope> {
        self.current.lock().handle.clone()
    }

    /// Runs the reconnect loop until `cancel` fires.
    ///
    /// Retryable errors are logged and retried after
    /// [`retry_delay`](SyncClientConfig::retry_delay). Any other error is
    /// logged and stops the client as if it had been cancelled. On return the
    /// current pipeline is closed.
    pub fn run(&self, cancel: &CancelSignal) {
        if self.state().is_terminal() {
            warn!("sync client was stopped and cannot be restarted");
            return;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("sync client is already running");
            return;
        }

        info!(remote = %self.config.target, subscription = %self.config.request.subscription, "starting sync client");

        let stop = cancel.child();
        thread::scope(|scope| {
            // A forward parked on an absent consumer only wakes when its
            // pipeline closes.
            scope.spawn(|| {
                stop.wait();
                self.current.lock().sender.close();
            });
            // Releases the watcher when the loop gives up on its own.
            let _stop_on_exit = stop.clone().drop_guard();
            self.reconnect_loop(&stop);
        });

        self.current.lock().sender.close();
        self.set_healthy(false);
        if let Err(e) = self.transition(ClientEvent::Cancel) {
            debug!(error = %e, "state already terminal");
        }
        self.running.store(false, Ordering::SeqCst);
        info!("sync client stopped");
    }

    fn reconnect_loop(&self, cancel: &CancelSignal) {
        while !cancel.is_cancelled() {
            match self.sync_once(cancel) {
                Ok(()) => {}
                Err(SyncError::Cancelled) => break,
                Err(e) if !e.is_retryable() => {
                    error!(error = %e, "sync client cannot continue, stopping");
                    let mut stats = self.stats.write();
                    stats.failed_attempts += 1;
                    stats.last_error = Some(e.to_string());
                    break;
                }
                Err(e) => {
                    warn!(error = %e, delay = ?self.config.retry_delay, "sync stream unavailable, will retry");
                    let mut stats = self.stats.write();
                    stats.failed_attempts += 1;
                    stats.last_error = Some(e.to_string());
                }
            }

            if cancel.wait_timeout(self.config.retry_delay) {
                break;
            }
        }
    }

    /// One connection epoch: dial, subscribe, relay until the stream breaks.
    fn sync_once(&self, cancel: &CancelSignal) -> SyncResult<()> {
        self.transition(ClientEvent::Connect)?;
        self.stats.write().dial_attempts += 1;

        let opened = self
            .transport
            .dial(&self.config.target, self.config.connect_timeout)
            .and_then(|conn| conn.subscribe(&self.config.request));
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                self.set_healthy(false);
                self.transition(ClientEvent::ConnectFailed)?;
                return Err(e);
            }
        };

        self.transition(ClientEvent::Subscribed)?;
        self.stats.write().streams_opened += 1;
        info!("synchronizing with sync service");

        match self.relay(&mut stream, cancel) {
            Err(SyncError::Cancelled) => Err(SyncError::Cancelled),
            Err(e) => {
                self.set_healthy(false);
                self.transition(ClientEvent::StreamFailed)?;
                self.rotate_pipeline();
                self.transition(ClientEvent::PipelineRotated)?;
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    /// Relays updates and flushes statistics until the stream breaks or
    /// `cancel` fires.
    fn relay<S: UpdateStream>(&self, stream: &mut S, cancel: &CancelSignal) -> SyncResult<()> {
        let sender = self.current.lock().sender.clone();
        let report_stats = self.config.request.supports_dataplane_stats;
        loop {
            if report_stats && !self.backlog.is_empty() {
                self.backlog.flush(|stats| {
                    stream.report(stats)?;
                    self.stats.write().stats_reported += 1;
                    Ok(())
                })?;
            }

            match stream.recv()? {
                None if cancel.is_cancelled() => return Err(SyncError::Cancelled),
                None => {}
                Some(update) => {
                    self.set_healthy(true);
                    self.transition(ClientEvent::Received)?;
                    debug!(
                        sequence = update.sequence,
                        kind = update.kind.as_str(),
                        epoch = sender.epoch(),
                        "received update"
                    );

                    if sender.send(update).is_err() {
                        // Only the cancellation watcher closes a live pipeline.
                        return Err(SyncError::Cancelled);
                    }

                    let mut stats = self.stats.write();
                    stats.updates_forwarded += 1;
                    stats.last_update_time = Some(Instant::now());
                }
            }
        }
    }

    /// Publishes a fresh pipeline, then closes the old one.
    fn rotate_pipeline(&self) {
        let old = {
            let mut current = self.current.lock();
            let (sender, handle) = pipeline::channel(current.sender.epoch() + 1);
            current.handle = handle;
            std::mem::replace(&mut current.sender, sender)
        };
        old.close();

        self.stats.write().pipeline_rotations += 1;
        debug!(closed_epoch = old.epoch(), "rotated pipeline");
    }

    fn transition(&self, event: ClientEvent) -> SyncResult<()> {
        let mut state = self.state.write();
        *state = state.apply(event)?;
        Ok(())
    }

    fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
        if let Some(observer) = &self.health_observer {
            observer(healthy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RecvTimeout;
    use crate::transport::{MockSession, MockTransport};
    use dpsync_protocol::{DataplaneStats, SyncRequest, UpdateKind};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    const RETRY: Duration = Duration::from_millis(30);
    const WAIT: Duration = Duration::from_secs(5);

    fn update(seq: u64) -> UpdateEnvelope {
        UpdateEnvelope::new(seq, UpdateKind::PolicyUpdate, format!("policy-{seq}"), vec![seq as u8])
    }

    fn client(sessions: Vec<MockSession>) -> Arc<SyncClient<MockTransport>> {
        let config =
            SyncClientConfig::new("mock://policy", SyncRequest::new("test")).with_retry_delay(RETRY);
        Arc::new(SyncClient::new(config, MockTransport::with_sessions(sessions)))
    }

    fn spawn_run(
        client: &Arc<SyncClient<MockTransport>>,
        cancel: &CancelSignal,
    ) -> thread::JoinHandle<()> {
        let client = Arc::clone(client);
        let cancel = cancel.clone();
        thread::spawn(move || client.run(&cancel))
    }

    fn expect_item(handle: &PipelineHandle<UpdateEnvelope>) -> UpdateEnvelope {
        match handle.recv_timeout(WAIT) {
            RecvTimeout::Item(item) => item,
            other => panic!("expected an update, got {other:?}"),
        }
    }

    #[test]
    fn initial_state() {
        let client = client(vec![]);
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(!client.is_healthy());
        assert_eq!(client.get_pipeline().epoch(), 0);
        assert!(!client.get_pipeline().is_closed());
    }

    #[test]
    fn relays_updates_in_order() {
        let client = client(vec![MockSession::stream((1..=5).map(update).collect())]);
        let cancel = CancelSignal::new();
        let runner = spawn_run(&client, &cancel);

        let handle = client.get_pipeline();
        let seqs: Vec<u64> = (0..5).map(|_| expect_item(&handle).sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

        cancel.cancel();
        runner.join().unwrap();
        assert_eq!(client.stats().updates_forwarded, 5);
    }

    #[test]
    fn liveness_follows_failures_then_success() {
        let observed = Arc::new(Mutex::new(Vec::new()));
        let config =
            SyncClientConfig::new("mock://policy", SyncRequest::new("test")).with_retry_delay(RETRY);
        let transport = MockTransport::with_sessions([
            MockSession::DialFails("connection refused".into()),
            MockSession::DialFails("connection refused".into()),
            MockSession::SubscribeFails("not ready".into()),
            MockSession::stream(vec![update(1)]),
        ]);
        let client = Arc::new(SyncClient::new(config, transport).with_health_observer({
            let observed = Arc::clone(&observed);
            move |healthy| observed.lock().push(healthy)
        }));

        let cancel = CancelSignal::new();
        let runner = spawn_run(&client, &cancel);

        assert_eq!(expect_item(&client.get_pipeline()).sequence, 1);
        cancel.cancel();
        runner.join().unwrap();

        let observed = observed.lock().clone();
        assert_eq!(observed[..4], [false, false, false, true]);

        let dials = client.transport().dial_times();
        assert!(dials.len() >= 4);
        for pair in dials[..4].windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= RETRY);
        }

        let stats = client.stats();
        assert!(stats.failed_attempts >= 3);
        assert_eq!(stats.streams_opened, 1);
    }

    #[test]
    fn broken_stream_rotates_pipeline() {
        let client = client(vec![
            MockSession::stream(vec![update(1), update(2)]),
            MockSession::stream(vec![update(3), update(4)]),
        ]);
        let cancel = CancelSignal::new();
        let runner = spawn_run(&client, &cancel);

        let first = client.get_pipeline();
        assert_eq!(expect_item(&first).sequence, 1);
        assert_eq!(expect_item(&first).sequence, 2);
        assert_eq!(first.recv_timeout(WAIT), RecvTimeout::Closed);
        assert!(first.is_closed());

        let second = client.get_pipeline();
        assert!(second.epoch() > first.epoch());
        assert_eq!(expect_item(&second).sequence, 3);
        assert_eq!(expect_item(&second).sequence, 4);

        cancel.cancel();
        runner.join().unwrap();
        assert!(client.stats().pipeline_rotations >= 1);
    }

    #[test]
    fn cancel_releases_forward_without_consumer() {
        let client = client(vec![MockSession::stream(vec![update(1)])]);
        let cancel = CancelSignal::new();
        let runner = spawn_run(&client, &cancel);

        // Nobody reads; the client parks in the hand-off.
        while !client.is_healthy() {
            thread::sleep(Duration::from_millis(5));
        }
        cancel.cancel();
        runner.join().unwrap();

        assert_eq!(client.state(), ClientState::Stopped);
        assert!(!client.is_healthy());
        assert!(client.get_pipeline().is_closed());
    }

    #[test]
    fn cancel_interrupts_retry_wait() {
        let config = SyncClientConfig::new("mock://policy", SyncRequest::new("test"))
            .with_retry_delay(Duration::from_secs(60));
        let client = Arc::new(SyncClient::new(config, MockTransport::new()));
        let cancel = CancelSignal::new();
        let runner = spawn_run(&client, &cancel);

        while client.transport().dial_count() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        let started = Instant::now();
        cancel.cancel();
        runner.join().unwrap();

        assert!(started.elapsed() < WAIT);
        assert_eq!(client.transport().dial_count(), 1);
        assert_eq!(client.state(), ClientState::Stopped);
    }

    fn flow(src_port: u16) -> DataplaneStats {
        DataplaneStats::new("10.1.0.4", "10.2.0.9", src_port, 443, "tcp").with_http_requests(4, 1)
    }

    #[test]
    fn failed_report_forces_reconnect() {
        let config = SyncClientConfig::new(
            "mock://policy",
            SyncRequest::new("test").with_dataplane_stats(true),
        )
        .with_retry_delay(RETRY);
        let transport = MockTransport::with_sessions([
            MockSession::ReportFails("broken pipe".into()),
            MockSession::stream(vec![update(1)]),
        ]);
        let client = Arc::new(SyncClient::new(config, transport));
        client.stats_backlog().push([flow(40001), flow(40002)]);

        let first = client.get_pipeline();
        let cancel = CancelSignal::new();
        let runner = spawn_run(&client, &cancel);

        assert_eq!(first.recv_timeout(WAIT), RecvTimeout::Closed);
        assert_eq!(expect_item(&client.get_pipeline()).sequence, 1);
        cancel.cancel();
        runner.join().unwrap();

        // Nothing was lost with the first stream; all of it went out on the second.
        assert_eq!(client.transport().reports(), vec![flow(40001), flow(40002)]);
        assert!(client.stats_backlog().is_empty());

        let stats = client.stats();
        assert_eq!(stats.stats_reported, 2);
        assert!(stats.pipeline_rotations >= 1);
        assert!(stats.last_error.is_some());
        assert!(client.transport().dial_count() >= 2);
    }

    #[test]
    fn stats_held_without_capability() {
        let config = SyncClientConfig::new(
            "mock://policy",
            SyncRequest::new("test").with_dataplane_stats(false),
        )
        .with_retry_delay(RETRY);
        let transport = MockTransport::with_sessions([MockSession::stream(vec![update(1)])]);
        let client = Arc::new(SyncClient::new(config, transport));
        client.stats_backlog().push([flow(40001)]);

        let cancel = CancelSignal::new();
        let runner = spawn_run(&client, &cancel);
        assert_eq!(expect_item(&client.get_pipeline()).sequence, 1);
        cancel.cancel();
        runner.join().unwrap();

        assert!(client.transport().reports().is_empty());
        assert_eq!(client.stats_backlog().pending_reports(), 1);
    }

    /// Transport whose every dial fails with an error retrying cannot fix.
    #[derive(Default)]
    struct WedgedTransport {
        dials: AtomicUsize,
    }

    impl SyncTransport for WedgedTransport {
        type Connection = crate::transport::MockConnection;

        fn dial(&self, _target: &str, _timeout: Duration) -> SyncResult<Self::Connection> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::InvalidStateTransition {
                from: "Streaming".into(),
                event: "Connect".into(),
            })
        }
    }

    #[test]
    fn non_retryable_error_stops_client() {
        let config =
            SyncClientConfig::new("mock://policy", SyncRequest::new("test")).with_retry_delay(RETRY);
        let client = SyncClient::new(config, WedgedTransport::default());
        let cancel = CancelSignal::new();

        // Returns without anyone firing the signal.
        client.run(&cancel);

        assert!(!cancel.is_cancelled());
        assert_eq!(client.transport().dials.load(Ordering::SeqCst), 1);
        assert_eq!(client.state(), ClientState::Stopped);
        assert!(client.get_pipeline().is_closed());
        assert!(client
            .stats()
            .last_error
            .is_some_and(|e| e.contains("invalid state transition")));
    }

    #[test]
    fn run_after_stop_is_noop() {
        let client = client(vec![]);
        let cancel = CancelSignal::new();
        cancel.cancel();
        client.run(&cancel);
        assert_eq!(client.state(), ClientState::Stopped);

        client.run(&CancelSignal::new());
        assert_eq!(client.transport().dial_count(), 0);
    }
}
