//! Agent command implementation.

use super::cancel_on_ctrl_c;
use dpsync_engine::{
    CancelSignal, CoalescingScheduler, Enqueuer, RecvTimeout, SyncClient, SyncClientConfig,
    TcpTransport,
};
use dpsync_protocol::{SyncRequest, UpdateEnvelope, UpdateKind};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const POLL: Duration = Duration::from_millis(200);

/// Options for the agent command.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Sync service address.
    pub target: String,
    /// Subscription tag.
    pub subscription: String,
    /// Reconnect delay in milliseconds.
    pub retry_ms: u64,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Simulated apply time in milliseconds.
    pub apply_ms: u64,
}

/// Desired dataplane state folded from the update feed.
///
/// Objects are keyed by family and key, so a removal clears the object its
/// matching update created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataplaneView {
    /// Sequence of the last update folded in.
    pub sequence: u64,
    /// Set once the initial snapshot has been fully received.
    pub in_sync: bool,
    /// Object bodies by `(family, key)`.
    pub objects: BTreeMap<(&'static str, String), Vec<u8>>,
}

impl DataplaneView {
    /// Folds one update into the view.
    pub fn apply(&mut self, update: UpdateEnvelope) {
        self.sequence = update.sequence;
        match update.kind {
            UpdateKind::InSync => self.in_sync = true,
            kind if kind.is_removal() => {
                self.objects.remove(&(kind.family(), update.key));
            }
            kind => {
                self.objects.insert((kind.family(), update.key), update.body);
            }
        }
    }

    /// Number of objects of one family.
    pub fn count(&self, family: &str) -> usize {
        self.objects.keys().filter(|(f, _)| *f == family).count()
    }

    /// Starts over after a reconnect; the new stream replays a full snapshot.
    pub fn reset(&mut self) {
        self.in_sync = false;
        self.objects.clear();
    }
}

/// Runs the agent command.
pub fn run(options: AgentOptions) -> Result<(), Box<dyn std::error::Error>> {
    let config = SyncClientConfig::new(&options.target, SyncRequest::new(&options.subscription))
        .with_retry_delay(Duration::from_millis(options.retry_ms))
        .with_connect_timeout(Duration::from_millis(options.connect_timeout_ms));
    let client = Arc::new(SyncClient::new(config, TcpTransport::new()));
    let cancel = CancelSignal::new();

    let (scheduler, enqueuer) = CoalescingScheduler::<Arc<DataplaneView>>::create();
    let apply_time = Duration::from_millis(options.apply_ms);

    let client_thread = {
        let client = Arc::clone(&client);
        let cancel = cancel.clone();
        thread::Builder::new()
            .name("dpsync-client".into())
            .spawn(move || {
                // A client that gives up stops the whole agent.
                let _stop_agent = cancel.clone().drop_guard();
                client.run(&cancel);
            })?
    };
    let consumer_thread = {
        let client = Arc::clone(&client);
        let cancel = cancel.clone();
        thread::Builder::new()
            .name("dpsync-consumer".into())
            .spawn(move || consume(&client, &cancel, &enqueuer))?
    };
    let writer_thread = {
        let cancel = cancel.clone();
        thread::Builder::new()
            .name("dpsync-writer".into())
            .spawn(move || {
                scheduler.run(&cancel, |_, view| program_dataplane(&view, apply_time));
            })?
    };

    info!(target_addr = %options.target, "agent started, press Ctrl-C to stop");
    let waited = cancel_on_ctrl_c(&cancel);

    for (name, handle) in [
        ("client", client_thread),
        ("consumer", consumer_thread),
        ("writer", writer_thread),
    ] {
        if handle.join().is_err() {
            warn!(thread = name, "worker thread panicked");
        }
    }

    let stats = client.stats();
    info!(
        dial_attempts = stats.dial_attempts,
        streams_opened = stats.streams_opened,
        updates = stats.updates_forwarded,
        "agent stopped"
    );
    waited
}

/// Reads the client's current pipeline, re-fetching it whenever it closes,
/// and hands every in-sync view to the writer.
fn consume(
    client: &SyncClient<TcpTransport>,
    cancel: &CancelSignal,
    enqueuer: &Enqueuer<Arc<DataplaneView>>,
) {
    let mut view = DataplaneView::default();
    while !cancel.is_cancelled() {
        let pipeline = client.get_pipeline();
        debug!(epoch = pipeline.epoch(), "reading pipeline");
        loop {
            match pipeline.recv_timeout(POLL) {
                RecvTimeout::Item(update) => {
                    view.apply(update);
                    if view.in_sync {
                        enqueuer.enqueue(Arc::new(view.clone()));
                    }
                }
                RecvTimeout::TimedOut if cancel.is_cancelled() => return,
                RecvTimeout::TimedOut => {}
                RecvTimeout::Closed => {
                    info!(healthy = client.is_healthy(), "sync stream lost, waiting for resync");
                    view.reset();
                    break;
                }
            }
        }
    }
}

fn program_dataplane(view: &DataplaneView, apply_time: Duration) {
    if !apply_time.is_zero() {
        thread::sleep(apply_time);
    }
    info!(
        sequence = view.sequence,
        ipsets = view.count("ipset"),
        profiles = view.count("profile"),
        policies = view.count("policy"),
        endpoints = view.count("endpoint"),
        routes = view.count("route"),
        "applied dataplane view"
    );
}
