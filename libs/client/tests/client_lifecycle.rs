//! End-to-end lifecycle tests over in-memory transports: connect attempt
//! policy, reconnect/failover behavior, cascade teardown, and the
//! close-in-callback rules.

use config::TuningStore;
use courier::test_utils::{ConnectOutcome, FailingConnector, MemoryConnector};
use courier::{
    Client, ClientError, ClientOptions, Connection, ConnectionState, ExceptionKind,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use types::AckMode;

fn options() -> ClientOptions {
    ClientOptions::new("tcp://127.0.0.1:7222").with_username("admin")
}

async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn wait_for_state(connection: &Connection, state: ConnectionState) -> bool {
    wait_until(|| connection.state() == state, Duration::from_secs(5)).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_succeeds_on_first_attempt() {
    let store = Arc::new(TuningStore::new());
    let connector = MemoryConnector::new();
    let client = Client::with_connector(options(), store, connector.clone());

    let connection = client.connect().await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert!(connection.is_connected());
    assert_eq!(connector.attempts(), 1);

    connection.close().unwrap();
    assert_eq!(connection.state(), ConnectionState::Closed);
    // Idempotent
    connection.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_fails_after_exactly_n_attempts() {
    let store = Arc::new(TuningStore::new());
    store.set_connect_attempt_count(3).unwrap();
    store.set_connect_attempt_delay(10).unwrap();

    let connector = FailingConnector::new("connection refused");
    let client = Client::with_connector(options(), store, connector.clone());

    let err = client.connect().await.unwrap_err();
    match err {
        ClientError::ConnectFailed { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected ConnectFailed, got {other}"),
    }
    assert_eq!(connector.attempts(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_with_zero_attempts_fails_without_dialing() {
    let store = Arc::new(TuningStore::new());
    store.set_connect_attempt_count(0).unwrap();

    let connector = FailingConnector::new("unused");
    let client = Client::with_connector(options(), store, connector.clone());

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, ClientError::ConnectFailed { attempts: 0, .. }));
    assert_eq!(connector.attempts(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_attempt_timing_scenario() {
    // 3 attempts, 100ms apart, transport always fails: ConnectFailure
    // after roughly 2 delays and exactly 3 attempts.
    let store = Arc::new(TuningStore::new());
    store.set_connect_attempt_count(3).unwrap();
    store.set_connect_attempt_delay(100).unwrap();

    let connector = FailingConnector::new("no broker");
    let client = Client::with_connector(options(), store, connector.clone());

    let started = Instant::now();
    let err = client.connect().await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, ClientError::ConnectFailed { attempts: 3, .. }));
    assert_eq!(connector.attempts(), 3);
    assert!(
        elapsed >= Duration::from_millis(180) && elapsed < Duration::from_millis(600),
        "elapsed {elapsed:?} outside expected window"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overall_connect_timeout_cuts_attempts_short() {
    let store = Arc::new(TuningStore::new());
    store.set_connect_attempt_count(10).unwrap();
    store.set_connect_attempt_delay(50).unwrap();
    store.set_connect_attempt_timeout(120).unwrap();

    let connector = FailingConnector::new("no broker");
    let client = Client::with_connector(options(), store, connector.clone());

    let started = Instant::now();
    let err = client.connect().await.unwrap_err();

    assert!(matches!(err, ClientError::ConnectFailed { .. }));
    assert!(connector.attempts() < 10);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconnects_after_transport_loss() {
    let store = Arc::new(TuningStore::new());
    store.set_reconnect_attempt_count(4).unwrap();
    store.set_reconnect_attempt_delay(20).unwrap();

    let connector = MemoryConnector::new();
    connector.script([
        ConnectOutcome::Succeed,
        ConnectOutcome::Fail("still down".to_string()),
        ConnectOutcome::Fail("still down".to_string()),
        ConnectOutcome::Succeed,
    ]);
    let client = Client::with_connector(options(), store, connector.clone());

    let connection = client.connect().await.unwrap();
    let first = connector.latest_transport().unwrap();

    first.drop_link("broker went away");
    // 1 initial connect + 3 reconnect dials (two failures, one success)
    assert!(
        wait_until(|| connector.attempts() == 4, Duration::from_secs(5)).await,
        "reconnect dials never happened, attempts = {}",
        connector.attempts()
    );
    assert!(
        wait_for_state(&connection, ConnectionState::Connected).await,
        "connection never recovered, state = {:?}",
        connection.state()
    );
    assert_eq!(connection.reconnect_attempts(), 3);

    connection.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconnect_exhaustion_is_terminal_and_always_reported() {
    let store = Arc::new(TuningStore::new());
    store.set_reconnect_attempt_count(3).unwrap();
    store.set_reconnect_attempt_delay(50).unwrap();
    // FT gating off: the terminal event must be delivered regardless

    let connector = MemoryConnector::new();
    connector.script([
        ConnectOutcome::Succeed,
        ConnectOutcome::Fail("down".to_string()),
        ConnectOutcome::Fail("down".to_string()),
        ConnectOutcome::Fail("down".to_string()),
    ]);
    let client = Client::with_connector(options(), store, connector.clone());

    let connection = client.connect().await.unwrap();
    let session = connection.create_session(AckMode::Auto).unwrap();

    let terminal_at: Arc<parking_lot::Mutex<Option<Instant>>> =
        Arc::new(parking_lot::Mutex::new(None));
    let terminal_clone = terminal_at.clone();
    connection.set_exception_listener(move |event| {
        if event.kind == ExceptionKind::ReconnectExhausted {
            *terminal_clone.lock() = Some(Instant::now());
        }
    });

    let dropped_at = Instant::now();
    connector.latest_transport().unwrap().drop_link("gone");

    assert!(wait_for_state(&connection, ConnectionState::Closed).await);
    assert!(
        wait_until(|| terminal_at.lock().is_some(), Duration::from_secs(2)).await,
        "terminal event never delivered"
    );

    // K attempts with D between them: elapsed >= (K-1) * D
    let elapsed = terminal_at.lock().unwrap() - dropped_at;
    assert!(
        elapsed >= Duration::from_millis(100),
        "exhaustion reported too early: {elapsed:?}"
    );

    // Cascade: the session is closed and nothing else works
    assert!(session.is_closed());
    assert!(matches!(
        connection.create_session(AckMode::Auto),
        Err(ClientError::Closed)
    ));
    assert!(connection.last_error().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ft_events_are_gated_by_tunables() {
    let store = Arc::new(TuningStore::new());
    store.set_reconnect_attempt_count(2).unwrap();
    store.set_reconnect_attempt_delay(10).unwrap();
    store.set_exception_on_ft_switch(true).unwrap();
    store.set_exception_on_ft_events(true).unwrap();

    let connector = MemoryConnector::new();
    connector.script([
        ConnectOutcome::Succeed,
        ConnectOutcome::Fail("blip".to_string()),
        ConnectOutcome::Succeed,
    ]);
    let client = Client::with_connector(options(), store, connector.clone());
    let connection = client.connect().await.unwrap();

    let kinds: Arc<parking_lot::Mutex<Vec<ExceptionKind>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    let kinds_clone = kinds.clone();
    connection.set_exception_listener(move |event| {
        kinds_clone.lock().push(event.kind);
    });

    connector.latest_transport().unwrap().drop_link("blip");
    assert!(wait_for_state(&connection, ConnectionState::Connected).await);

    assert!(
        wait_until(
            || {
                let kinds = kinds.lock();
                kinds.contains(&ExceptionKind::ReconnectStarted)
                    && kinds.contains(&ExceptionKind::ReconnectSucceeded)
                    && kinds.contains(&ExceptionKind::FailoverSwitch)
            },
            Duration::from_secs(2)
        )
        .await,
        "expected all FT events, got {:?}",
        kinds.lock()
    );

    connection.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ft_events_are_suppressed_by_default() {
    let store = Arc::new(TuningStore::new());
    store.set_reconnect_attempt_count(2).unwrap();
    store.set_reconnect_attempt_delay(10).unwrap();

    let connector = MemoryConnector::new();
    connector.script([ConnectOutcome::Succeed, ConnectOutcome::Succeed]);
    let client = Client::with_connector(options(), store, connector.clone());
    let connection = client.connect().await.unwrap();

    let events = Arc::new(AtomicU32::new(0));
    let events_clone = events.clone();
    connection.set_exception_listener(move |_| {
        events_clone.fetch_add(1, Ordering::SeqCst);
    });

    connector.latest_transport().unwrap().drop_link("blip");
    assert!(wait_for_state(&connection, ConnectionState::Connected).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(events.load(Ordering::SeqCst), 0);
    connection.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sessions_cannot_outlive_their_connection() {
    let store = Arc::new(TuningStore::new());
    let connector = MemoryConnector::new();
    let client = Client::with_connector(options(), store, connector.clone());

    let connection = client.connect().await.unwrap();
    let first = connection.create_session(AckMode::Auto).unwrap();
    let second = connection.create_session(AckMode::Client).unwrap();
    assert_ne!(first.id(), second.id());

    connection.close().unwrap();
    assert!(first.is_closed());
    assert!(second.is_closed());
    assert!(matches!(
        connection.create_session(AckMode::Auto),
        Err(ClientError::Closed)
    ));
}
