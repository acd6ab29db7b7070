//! Dispatch-path and publish-path tests: per-consumer FIFO ordering,
//! cascade teardown stopping delivery, the close-in-callback rules, the
//! transacted publish path, request/reply, and the multicast exception
//! channel.

use config::TuningStore;
use courier::test_utils::{ConnectOutcome, MemoryConnector};
use courier::{Client, ClientError, ClientOptions, Connection, Consumer};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use types::{AckMode, DeliveryMode, Destination, DispatchMode, Message};

fn options() -> ClientOptions {
    ClientOptions::new("tcp://127.0.0.1:7222")
}

async fn connected_client() -> (Arc<MemoryConnector>, Client, Connection) {
    let store = Arc::new(TuningStore::new());
    connected_client_with_store(store).await
}

async fn connected_client_with_store(
    store: Arc<TuningStore>,
) -> (Arc<MemoryConnector>, Client, Connection) {
    let connector = MemoryConnector::new();
    let client = Client::with_connector(options(), store, connector.clone());
    let connection = client.connect().await.unwrap();
    (connector, client, connection)
}

fn message_for(destination: &Destination, body: &str) -> Message {
    let mut message = Message::text(body).unwrap();
    message.metadata.destination = Some(destination.clone());
    message
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

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_consumer_fifo_holds_under_interleaving() {
    let (connector, _client, connection) = connected_client().await;
    let session = connection.create_session(AckMode::Auto).unwrap();

    let orders = Destination::queue("orders").unwrap();
    let ticks = Destination::topic("ticks").unwrap();

    let received_orders: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let received_ticks: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let orders_log = received_orders.clone();
    let _orders_consumer = session
        .subscribe(orders.clone(), DispatchMode::Unicast, move |message| {
            orders_log.lock().push(message.as_text().unwrap().to_string());
        })
        .unwrap();

    let ticks_log = received_ticks.clone();
    let _ticks_consumer = session
        .subscribe(ticks.clone(), DispatchMode::Unicast, move |message| {
            ticks_log.lock().push(message.as_text().unwrap().to_string());
        })
        .unwrap();

    let transport = connector.latest_transport().unwrap();
    for i in 0..3 {
        transport.inject_message(&message_for(&orders, &format!("m{}", i + 1)));
        transport.inject_message(&message_for(&ticks, &format!("x{}", i + 1)));
    }

    assert!(
        wait_until(
            || received_orders.lock().len() == 3 && received_ticks.lock().len() == 3,
            Duration::from_secs(2)
        )
        .await
    );
    assert_eq!(*received_orders.lock(), vec!["m1", "m2", "m3"]);
    assert_eq!(*received_ticks.lock(), vec!["x1", "x2", "x3"]);

    connection.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_callback_fires_after_connection_close() {
    let (connector, _client, connection) = connected_client().await;
    let session = connection.create_session(AckMode::Auto).unwrap();
    let queue = Destination::queue("audit").unwrap();

    let delivered = Arc::new(AtomicU32::new(0));
    let counter = delivered.clone();
    let consumer = session
        .subscribe(queue.clone(), DispatchMode::Unicast, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let transport = connector.latest_transport().unwrap();
    transport.inject_message(&message_for(&queue, "one"));
    transport.inject_message(&message_for(&queue, "two"));
    assert!(wait_until(|| delivered.load(Ordering::SeqCst) == 2, Duration::from_secs(2)).await);

    connection.close().unwrap();
    assert!(session.is_closed());
    assert!(consumer.is_closed());

    // Traffic after close must not reach the callback
    transport.inject_message(&message_for(&queue, "three"));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_inside_callback_is_rejected_when_disallowed() {
    // allow_close_in_callback defaults to off
    let (connector, _client, connection) = connected_client().await;
    let session = connection.create_session(AckMode::Auto).unwrap();
    let queue = Destination::queue("jobs").unwrap();

    let consumer_slot: Arc<Mutex<Option<Consumer>>> = Arc::new(Mutex::new(None));
    let close_results: Arc<Mutex<Vec<Result<(), ClientError>>>> =
        Arc::new(Mutex::new(Vec::new()));

    let slot = consumer_slot.clone();
    let results = close_results.clone();
    let consumer = session
        .subscribe(queue.clone(), DispatchMode::Unicast, move |_| {
            if let Some(consumer) = slot.lock().as_ref() {
                results.lock().push(consumer.close());
            }
        })
        .unwrap();
    *consumer_slot.lock() = Some(consumer.clone());

    let transport = connector.latest_transport().unwrap();
    transport.inject_message(&message_for(&queue, "first"));

    assert!(wait_until(|| !close_results.lock().is_empty(), Duration::from_secs(2)).await);
    assert!(matches!(
        close_results.lock()[0],
        Err(ClientError::CloseInCallback)
    ));

    // The rejected close left the consumer fully operational
    assert!(!consumer.is_closed());
    transport.inject_message(&message_for(&queue, "second"));
    assert!(wait_until(|| close_results.lock().len() == 2, Duration::from_secs(2)).await);

    connection.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_inside_callback_is_honored_when_allowed() {
    let store = Arc::new(TuningStore::new());
    store.set_allow_close_in_callback(true).unwrap();
    let (connector, _client, connection) = connected_client_with_store(store).await;
    let session = connection.create_session(AckMode::Auto).unwrap();
    let queue = Destination::queue("jobs").unwrap();

    let consumer_slot: Arc<Mutex<Option<Consumer>>> = Arc::new(Mutex::new(None));
    let delivered = Arc::new(AtomicU32::new(0));

    let slot = consumer_slot.clone();
    let counter = delivered.clone();
    let consumer = session
        .subscribe(queue.clone(), DispatchMode::Unicast, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(consumer) = slot.lock().as_ref() {
                // Self-close from within the callback must not deadlock
                consumer.close().unwrap();
            }
        })
        .unwrap();
    *consumer_slot.lock() = Some(consumer.clone());

    let transport = connector.latest_transport().unwrap();
    transport.inject_message(&message_for(&queue, "first"));

    assert!(wait_until(|| consumer.is_closed(), Duration::from_secs(2)).await);
    assert_eq!(delivered.load(Ordering::SeqCst), 1);

    // Closed consumer receives nothing further
    transport.inject_message(&message_for(&queue, "second"));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 1);

    connection.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn external_close_waits_for_inflight_callback() {
    let (connector, _client, connection) = connected_client().await;
    let session = connection.create_session(AckMode::Auto).unwrap();
    let queue = Destination::queue("slow").unwrap();

    let completed = Arc::new(AtomicU32::new(0));
    let counter = completed.clone();
    let consumer = session
        .subscribe(queue.clone(), DispatchMode::Unicast, move |_| {
            std::thread::sleep(Duration::from_millis(150));
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let transport = connector.latest_transport().unwrap();
    transport.inject_message(&message_for(&queue, "busy"));
    // Let the dispatch task enter the callback
    tokio::time::sleep(Duration::from_millis(50)).await;

    let completed_check = completed.clone();
    let close_task = tokio::task::spawn_blocking(move || {
        let result = consumer.close();
        // By the time close returns, the in-flight callback has finished
        (result, completed_check.load(Ordering::SeqCst))
    });

    let (result, completed_at_close) = tokio::time::timeout(Duration::from_secs(3), close_task)
        .await
        .expect("close deadlocked")
        .unwrap();
    result.unwrap();
    assert_eq!(completed_at_close, 1);

    connection.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn producer_send_reaches_transport_with_defaults() {
    let (connector, _client, connection) = connected_client().await;
    let session = connection.create_session(AckMode::Auto).unwrap();
    let queue = Destination::queue("orders.outbound").unwrap();

    let producer = session.create_producer(queue.clone()).unwrap();
    producer.set_delivery_mode(DeliveryMode::Persistent);
    producer.set_delivery_delay(Duration::from_millis(250));
    producer.set_time_to_live(Some(Duration::from_secs(60)));

    producer.send(Message::text("payload").unwrap()).await.unwrap();

    let transport = connector.latest_transport().unwrap();
    let frames = transport.sent_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].destination, queue);
    assert_eq!(frames[0].delivery_mode, DeliveryMode::Persistent);
    assert_eq!(frames[0].delivery_delay_ms, 250);
    assert_eq!(frames[0].expiration_ms, 60_000);
    assert_eq!(frames[0].payload, b"payload");

    connection.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn send_fails_while_not_connected() {
    let store = Arc::new(TuningStore::new());
    store.set_reconnect_attempt_count(5).unwrap();
    store.set_reconnect_attempt_delay(500).unwrap();
    let connector = MemoryConnector::new();
    connector.script([
        ConnectOutcome::Succeed,
        ConnectOutcome::Fail("down".to_string()),
        ConnectOutcome::Fail("down".to_string()),
    ]);
    let client = Client::with_connector(options(), store, connector.clone());
    let connection = client.connect().await.unwrap();

    let session = connection.create_session(AckMode::Auto).unwrap();
    let producer = session
        .create_producer(Destination::queue("orders").unwrap())
        .unwrap();

    connector.latest_transport().unwrap().drop_link("gone");
    assert!(
        wait_until(
            || connection.state() == courier::ConnectionState::Reconnecting,
            Duration::from_secs(2)
        )
        .await
    );

    let err = producer.send(Message::text("late").unwrap()).await.unwrap_err();
    assert!(matches!(err, ClientError::SendFailed { .. }));

    connection.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transacted_sends_are_buffered_until_commit() {
    let (connector, _client, connection) = connected_client().await;
    let session = connection.create_session(AckMode::Transacted).unwrap();
    let queue = Destination::queue("ledger").unwrap();
    let producer = session.create_producer(queue.clone()).unwrap();

    producer.send(Message::text("debit").unwrap()).await.unwrap();
    producer.send(Message::text("credit").unwrap()).await.unwrap();

    let transport = connector.latest_transport().unwrap();
    assert_eq!(transport.sent_count(), 0);

    session.commit().await.unwrap();
    let frames = transport.sent_frames();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].payload, b"debit");
    assert_eq!(frames[1].payload, b"credit");

    // Rolled-back sends never reach the transport
    producer.send(Message::text("oops").unwrap()).await.unwrap();
    session.rollback().unwrap();
    session.commit().await.unwrap();
    assert_eq!(transport.sent_count(), 2);

    // Commit is only meaningful on transacted sessions
    let auto = connection.create_session(AckMode::Auto).unwrap();
    assert!(matches!(
        auto.commit().await,
        Err(ClientError::InvalidValue(_))
    ));

    connection.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_reply_round_trip() {
    let (connector, _client, connection) = connected_client().await;
    let session = connection.create_session(AckMode::Auto).unwrap();
    let service = Destination::queue("service.echo").unwrap();

    let request_session = session.clone();
    let request_task = tokio::spawn(async move {
        request_session
            .request(
                Destination::queue("service.echo").unwrap(),
                Message::text("ping").unwrap(),
                Duration::from_secs(3),
            )
            .await
    });

    // Play the broker: pick up the outbound request, answer on its
    // temporary reply queue with the same correlation id.
    let transport = connector.latest_transport().unwrap();
    assert!(wait_until(|| transport.sent_count() == 1, Duration::from_secs(2)).await);

    let request = &transport.sent_frames()[0];
    assert_eq!(request.destination, service);
    let reply_to = request.reply_to.clone().expect("request carries reply_to");
    assert!(reply_to.is_temporary());
    let correlation = request.correlation_id.clone().expect("request correlated");

    let mut reply = Message::text("pong").unwrap();
    reply.metadata.destination = Some(reply_to);
    reply.metadata.correlation_id = Some(correlation);
    transport.inject_message(&reply);

    let response = request_task.await.unwrap().unwrap();
    assert_eq!(response.as_text(), Some("pong"));

    connection.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_times_out_without_reply() {
    let (_connector, _client, connection) = connected_client().await;
    let session = connection.create_session(AckMode::Auto).unwrap();

    let err = session
        .request(
            Destination::queue("service.void").unwrap(),
            Message::text("anyone?").unwrap(),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)));

    connection.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pull_consumer_recv_timeout() {
    let (connector, _client, connection) = connected_client().await;
    let session = connection.create_session(AckMode::Auto).unwrap();
    let queue = Destination::queue("inbox").unwrap();
    let receiver = session
        .create_receiver(queue.clone(), DispatchMode::Unicast)
        .unwrap();

    let err = receiver
        .recv_timeout(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)));

    connector
        .latest_transport()
        .unwrap()
        .inject_message(&message_for(&queue, "mail"));
    let message = receiver.recv_timeout(Duration::from_secs(1)).await.unwrap();
    assert_eq!(message.as_text(), Some("mail"));

    connection.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multicast_exceptions_reach_the_listener_without_closing_consumers() {
    let store = Arc::new(TuningStore::new());
    store.set_multicast_enabled(true).unwrap();
    store.set_multicast_daemon("239.1.1.1:7777").unwrap();

    let connector = MemoryConnector::new();
    let client = Client::with_connector(options(), store, connector.clone());

    let exceptions: Arc<Mutex<Vec<(u64, i32, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let log = exceptions.clone();
    client.set_multicast_exception_listener(move |exception| {
        log.lock().push((
            exception.consumer,
            exception.status,
            exception.description.clone(),
        ));
    });

    let connection = client.connect().await.unwrap();
    let session = connection.create_session(AckMode::Auto).unwrap();
    let feed = Destination::topic("market.feed").unwrap();

    let delivered = Arc::new(AtomicU32::new(0));
    let counter = delivered.clone();
    let consumer = session
        .subscribe(feed.clone(), DispatchMode::Multicast, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert!(consumer.is_multicast());

    let transport = connector.latest_transport().unwrap();
    transport.inject_multicast_gap(7, "sequence gap, retransmission requested");

    assert!(wait_until(|| !exceptions.lock().is_empty(), Duration::from_secs(2)).await);
    {
        let exceptions = exceptions.lock();
        assert_eq!(exceptions[0].0, consumer.id());
        assert_eq!(exceptions[0].1, 7);
        assert!(exceptions[0].2.contains("retransmission"));
    }

    // Non-fatal: delivery continues after the gap report
    assert!(!consumer.is_closed());
    transport.inject_message(&message_for(&feed, "tick"));
    assert!(wait_until(|| delivered.load(Ordering::SeqCst) == 1, Duration::from_secs(2)).await);

    connection.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multicast_subscribe_requires_the_toggle() {
    let (_connector, _client, connection) = connected_client().await;
    let session = connection.create_session(AckMode::Auto).unwrap();

    let err = session
        .subscribe(
            Destination::topic("market.feed").unwrap(),
            DispatchMode::Multicast,
            |_| {},
        )
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidValue(_)));

    connection.close().unwrap();
}
