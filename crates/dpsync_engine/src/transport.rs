//! Transport layer abstraction for the sync client.

use crate::error::{SyncError, SyncResult};
use dpsync_protocol::{DataplaneStats, SyncRequest, UpdateEnvelope};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A sync transport establishes connections to the remote sync service.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (TCP, gRPC, mock for testing, etc.).
pub trait SyncTransport: Send + Sync {
    /// Connection type produced by [`dial`](Self::dial).
    type Connection: SyncConnection;

    /// Connects to `target`.
    fn dial(&self, target: &str, timeout: Duration) -> SyncResult<Self::Connection>;
}

/// An established connection, able to open exactly one subscription stream.
pub trait SyncConnection: Send {
    /// Stream type produced by [`subscribe`](Self::subscribe).
    type Stream: UpdateStream;

    /// Opens the update stream. The stream owns the connection from here on.
    fn subscribe(self, request: &SyncRequest) -> SyncResult<Self::Stream>;
}

/// An open stream of updates.
pub trait UpdateStream: Send {
    /// Blocks until the next update arrives, the stream fails, or the
    /// implementation's poll interval elapses.
    ///
    /// `Ok(None)` means nothing arrived yet and the stream is still open;
    /// callers use it to check for cancellation.
    fn recv(&mut self) -> SyncResult<Option<UpdateEnvelope>>;

    /// Sends one statistics report upstream on the same stream.
    ///
    /// An error means the stream is no longer usable.
    fn report(&mut self, stats: &DataplaneStats) -> SyncResult<()>;
}

/// One scripted connection attempt for [`MockTransport`].
#[derive(Debug, Clone)]
pub enum MockSession {
    /// The dial itself fails.
    DialFails(String),
    /// The dial succeeds but opening the subscription fails.
    SubscribeFails(String),
    /// The stream yields `updates` in order, then fails with `error`.
    Stream {
        /// Updates delivered before the failure.
        updates: Vec<UpdateEnvelope>,
        /// Error returned once the updates are exhausted.
        error: String,
    },
    /// The subscription opens but every statistics report fails.
    ReportFails(String),
}

impl MockSession {
    /// A stream session that breaks after delivering `updates`.
    pub fn stream(updates: Vec<UpdateEnvelope>) -> Self {
        MockSession::Stream {
            updates,
            error: "connection reset by peer".into(),
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    script: Mutex<VecDeque<MockSession>>,
    dial_times: Mutex<Vec<Instant>>,
    requests: Mutex<Vec<SyncRequest>>,
    reports: Mutex<Vec<DataplaneStats>>,
}

/// A scripted transport for testing.
///
/// Each dial consumes the next [`MockSession`]. Once the script runs out,
/// every dial fails.
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    /// Creates a transport with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport that plays `sessions` in order.
    pub fn with_sessions(sessions: impl IntoIterator<Item = MockSession>) -> Self {
        let transport = Self::new();
        transport.state.script.lock().extend(sessions);
        transport
    }

    /// Appends a session to the script.
    pub fn push_session(&self, session: MockSession) {
        self.state.script.lock().push_back(session);
    }

    /// Number of dial attempts so far.
    pub fn dial_count(&self) -> usize {
        self.state.dial_times.lock().len()
    }

    /// Instants at which each dial happened.
    pub fn dial_times(&self) -> Vec<Instant> {
        self.state.dial_times.lock().clone()
    }

    /// Subscription requests received so far.
    pub fn requests(&self) -> Vec<SyncRequest> {
        self.state.requests.lock().clone()
    }

    /// Statistics reports accepted so far, across all sessions.
    pub fn reports(&self) -> Vec<DataplaneStats> {
        self.state.reports.lock().clone()
    }
}

impl SyncTransport for MockTransport {
    type Connection = MockConnection;

    fn dial(&self, target: &str, _timeout: Duration) -> SyncResult<MockConnection> {
        self.state.dial_times.lock().push(Instant::now());

        match self.state.script.lock().pop_front() {
            None => Err(SyncError::dial(target, "no scripted session")),
            Some(MockSession::DialFails(message)) => Err(SyncError::dial(target, message)),
            Some(session) => Ok(MockConnection {
                session,
                state: Arc::clone(&self.state),
            }),
        }
    }
}

/// Connection handed out by [`MockTransport`].
#[derive(Debug)]
pub struct MockConnection {
    session: MockSession,
    state: Arc<MockState>,
}

impl SyncConnection for MockConnection {
    type Stream = MockStream;

    fn subscribe(self, request: &SyncRequest) -> SyncResult<MockStream> {
        self.state.requests.lock().push(request.clone());

        match self.session {
            MockSession::SubscribeFails(message) => Err(SyncError::Subscribe(message)),
            MockSession::Stream { updates, error } => Ok(MockStream {
                updates: updates.into(),
                error,
                report_error: None,
                state: self.state,
            }),
            MockSession::ReportFails(message) => Ok(MockStream {
                updates: VecDeque::new(),
                error: message.clone(),
                report_error: Some(message),
                state: self.state,
            }),
            MockSession::DialFails(message) => Err(SyncError::Subscribe(message)),
        }
    }
}

/// Stream handed out by [`MockConnection`].
#[derive(Debug)]
pub struct MockStream {
    updates: VecDeque<UpdateEnvelope>,
    error: String,
    report_error: Option<String>,
    state: Arc<MockState>,
}

impl UpdateStream for MockStream {
    fn recv(&mut self) -> SyncResult<Option<UpdateEnvelope>> {
        match self.updates.pop_front() {
            Some(update) => Ok(Some(update)),
            None => Err(SyncError::Stream(self.error.clone())),
        }
    }

    fn report(&mut self, stats: &DataplaneStats) -> SyncResult<()> {
        match &self.report_error {
            Some(message) => Err(SyncError::Report(message.clone())),
            None => {
                self.state.reports.lock().push(stats.clone());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpsync_protocol::UpdateKind;

    fn update(seq: u64) -> UpdateEnvelope {
        UpdateEnvelope::new(seq, UpdateKind::PolicyUpdate, format!("p{seq}"), vec![])
    }

    #[test]
    fn empty_script_fails_dial() {
        let transport = MockTransport::new();
        let result = transport.dial("remote:1", Duration::from_secs(1));
        assert!(matches!(result, Err(SyncError::Dial { .. })));
        assert_eq!(transport.dial_count(), 1);
    }

    #[test]
    fn scripted_sessions_in_order() {
        let transport = MockTransport::with_sessions([
            MockSession::DialFails("refused".into()),
            MockSession::SubscribeFails("unknown subscription".into()),
            MockSession::stream(vec![update(1), update(2)]),
        ]);
        let request = SyncRequest::new("egress");

        assert!(transport.dial("t", Duration::ZERO).is_err());

        let conn = transport.dial("t", Duration::ZERO).unwrap();
        assert!(matches!(
            conn.subscribe(&request),
            Err(SyncError::Subscribe(_))
        ));

        let mut stream = transport
            .dial("t", Duration::ZERO)
            .unwrap()
            .subscribe(&request)
            .unwrap();
        assert_eq!(stream.recv().unwrap().unwrap().sequence, 1);
        assert_eq!(stream.recv().unwrap().unwrap().sequence, 2);
        assert!(matches!(stream.recv(), Err(SyncError::Stream(_))));

        assert_eq!(transport.dial_count(), 3);
        assert_eq!(transport.requests(), vec![request.clone(), request]);
    }

    #[test]
    fn reports_recorded_unless_scripted_to_fail() {
        let transport = MockTransport::with_sessions([
            MockSession::ReportFails("broken pipe".into()),
            MockSession::stream(vec![update(1)]),
        ]);
        let request = SyncRequest::new("egress").with_dataplane_stats(true);
        let stats = DataplaneStats::new("10.0.0.1", "10.0.0.2", 40000, 443, "tcp")
            .with_http_requests(3, 1);

        let mut failing = transport
            .dial("t", Duration::ZERO)
            .unwrap()
            .subscribe(&request)
            .unwrap();
        assert!(matches!(
            failing.report(&stats),
            Err(SyncError::Report(_))
        ));

        let mut stream = transport
            .dial("t", Duration::ZERO)
            .unwrap()
            .subscribe(&request)
            .unwrap();
        stream.report(&stats).unwrap();
        assert_eq!(transport.reports(), vec![stats]);
    }
}
