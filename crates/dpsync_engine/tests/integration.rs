//! End-to-end tests: sync client against the reference server over TCP.

use dpsync_engine::{
    CancelSignal, CoalescingScheduler, PipelineHandle, RecvTimeout, SchedulerState, SyncClient,
    SyncClientConfig, TcpTransport,
};
use dpsync_protocol::{DataplaneStats, SyncRequest, UpdateEnvelope, UpdateKind};
use dpsync_server::{ServerConfig, SyncServer};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const RETRY: Duration = Duration::from_millis(50);
const WAIT: Duration = Duration::from_secs(5);

fn start_server() -> SyncServer {
    SyncServer::start(ServerConfig::new("127.0.0.1:0".parse().unwrap())).unwrap()
}

fn tcp_client(server: &SyncServer) -> Arc<SyncClient<TcpTransport>> {
    let config = SyncClientConfig::new(
        server.local_addr().to_string(),
        SyncRequest::new("integration"),
    )
    .with_retry_delay(RETRY)
    .with_connect_timeout(Duration::from_secs(1));
    Arc::new(SyncClient::new(config, TcpTransport::new()))
}

fn spawn_run(client: &Arc<SyncClient<TcpTransport>>, cancel: &CancelSignal) -> thread::JoinHandle<()> {
    let client = Arc::clone(client);
    let cancel = cancel.clone();
    thread::spawn(move || client.run(&cancel))
}

fn next(handle: &PipelineHandle<UpdateEnvelope>) -> UpdateEnvelope {
    match handle.recv_timeout(WAIT) {
        RecvTimeout::Item(update) => update,
        other => panic!("expected an update, got {other:?}"),
    }
}

/// Reads until the in-sync marker, returning the keys seen before it.
fn read_snapshot(handle: &PipelineHandle<UpdateEnvelope>) -> Vec<String> {
    let mut keys = Vec::new();
    loop {
        let update = next(handle);
        if update.kind == UpdateKind::InSync {
            return keys;
        }
        keys.push(update.key);
    }
}

#[test]
fn snapshot_then_live_updates() {
    let server = start_server();
    server.publish(UpdateKind::IpSetUpdate, "set-web", b"10.0.0.1".to_vec());
    server.publish(UpdateKind::PolicyUpdate, "default/web", b"allow".to_vec());

    let client = tcp_client(&server);
    let cancel = CancelSignal::new();
    let runner = spawn_run(&client, &cancel);

    let handle = client.get_pipeline();
    assert_eq!(read_snapshot(&handle), vec!["set-web", "default/web"]);
    assert!(client.is_healthy());

    server.publish(UpdateKind::EndpointUpdate, "wep-1", b"{}".to_vec());
    let live = next(&handle);
    assert_eq!(live.key, "wep-1");
    assert_eq!(live.sequence, 3);

    cancel.cancel();
    runner.join().unwrap();
    assert!(!client.is_healthy());
    assert!(handle.is_closed());
    server.shutdown();
}

#[test]
fn reconnects_after_forced_disconnect() {
    let server = start_server();
    server.publish(UpdateKind::PolicyUpdate, "default/a", vec![1]);

    let client = tcp_client(&server);
    let cancel = CancelSignal::new();
    let runner = spawn_run(&client, &cancel);

    let first = client.get_pipeline();
    assert_eq!(read_snapshot(&first), vec!["default/a"]);

    server.disconnect_all();
    assert!(matches!(first.recv_timeout(WAIT), RecvTimeout::Closed));

    server.publish(UpdateKind::PolicyUpdate, "default/b", vec![2]);
    let second = client.get_pipeline();
    assert_eq!(second.epoch(), first.epoch() + 1);
    assert_eq!(read_snapshot(&second), vec!["default/a", "default/b"]);

    let stats = client.stats();
    assert_eq!(stats.pipeline_rotations, 1);
    assert!(stats.streams_opened >= 2);

    cancel.cancel();
    runner.join().unwrap();
    server.shutdown();
}

#[test]
fn retries_until_server_appears() {
    // Reserve a port, then release it so the first dials are refused.
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let config = SyncClientConfig::new(addr.to_string(), SyncRequest::new("late"))
        .with_retry_delay(RETRY);
    let client = Arc::new(SyncClient::new(config, TcpTransport::new()));
    let cancel = CancelSignal::new();
    let runner = spawn_run(&client, &cancel);

    let deadline = Instant::now() + WAIT;
    while client.stats().failed_attempts < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(client.stats().failed_attempts >= 2);
    assert!(!client.is_healthy());

    let server = SyncServer::start(ServerConfig::new(addr)).unwrap();
    server.publish(UpdateKind::ProfileUpdate, "profile-1", vec![]);
    assert_eq!(read_snapshot(&client.get_pipeline()), vec!["profile-1"]);
    assert!(client.is_healthy());

    cancel.cancel();
    runner.join().unwrap();
    server.shutdown();
}

#[test]
fn coalescing_scheduler_applies_latest_view() {
    let server = start_server();
    for i in 0..20u8 {
        server.publish(UpdateKind::RouteUpdate, format!("route-{i}"), vec![i]);
    }

    let client = tcp_client(&server);
    let cancel = CancelSignal::new();
    let runner = spawn_run(&client, &cancel);

    let (scheduler, enqueuer) = CoalescingScheduler::<u64>::create();
    let applied = Arc::new(Mutex::new(Vec::new()));
    let worker = {
        let applied = Arc::clone(&applied);
        let cancel = cancel.clone();
        thread::spawn(move || {
            scheduler.run(&cancel, |_, sequence| {
                thread::sleep(Duration::from_millis(5));
                applied.lock().push(sequence);
            })
        })
    };

    // Feed every received sequence; the writer only needs the newest.
    let handle = client.get_pipeline();
    let mut last = 0;
    loop {
        let update = next(&handle);
        if update.kind == UpdateKind::InSync {
            break;
        }
        last = update.sequence;
        enqueuer.enqueue(update.sequence);
    }
    assert_eq!(last, 20);

    let deadline = Instant::now() + WAIT;
    while applied.lock().last() != Some(&20) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }

    let applied = applied.lock().clone();
    assert_eq!(applied.last(), Some(&20));
    assert!(applied.windows(2).all(|w| w[0] < w[1]));

    cancel.cancel();
    worker.join().unwrap();
    runner.join().unwrap();
    assert_eq!(enqueuer.state(), SchedulerState::Terminated);
    server.shutdown();
}

#[test]
fn stats_backlog_reaches_server() {
    let server = start_server();
    let config = SyncClientConfig::new(
        server.local_addr().to_string(),
        SyncRequest::new("integration").with_dataplane_stats(true),
    )
    .with_retry_delay(RETRY);
    let client = Arc::new(SyncClient::new(config, TcpTransport::new()));

    let flows: Vec<_> = (0..3u16)
        .map(|i| {
            DataplaneStats::new("10.0.1.5", "10.0.2.7", 42000 + i, 443, "tcp")
                .with_http_requests(u64::from(i) + 1, 0)
        })
        .collect();
    client.stats_backlog().push(flows.clone());

    let cancel = CancelSignal::new();
    let runner = spawn_run(&client, &cancel);
    let handle = client.get_pipeline();
    assert!(read_snapshot(&handle).is_empty());

    // Queued while streaming; picked up on the next poll tick.
    let late =
        DataplaneStats::new("10.0.1.5", "10.0.2.8", 42010, 80, "tcp").with_http_requests(0, 9);
    client.stats_backlog().push([late.clone()]);

    let deadline = Instant::now() + WAIT;
    while server.reports().len() < 4 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }

    let mut expected = flows;
    expected.push(late);
    assert_eq!(server.reports(), expected);
    assert!(client.stats_backlog().is_empty());
    assert_eq!(client.stats().stats_reported, 4);

    cancel.cancel();
    runner.join().unwrap();
    server.shutdown();
}
