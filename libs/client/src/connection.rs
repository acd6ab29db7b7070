//! Connection lifecycle: connect with attempt policy, the transport
//! reader, the background reconnect loop, and deterministic teardown.
//!
//! ## Locking discipline
//!
//! Connection state and the session registry sit behind per-connection
//! `parking_lot` mutexes. Listener callbacks are always invoked with
//! every lock released, so a listener may call back into the client
//! without deadlocking.

use crate::consumer::Route;
use crate::error::{ClientError, SendContext};
use crate::listener::{
    ExceptionEvent, ExceptionKind, ExceptionListener, MulticastException,
    MulticastExceptionListener,
};
use crate::metrics::ClientMetrics;
use crate::options::ClientOptions;
use crate::session::{self, Session, SessionInner};
use crate::transport::{TcpConnector, Transport, TransportConnector, TransportEvent, WireFrame};
use bytes::Bytes;
use config::{Tuning, TuningStore};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info, warn};
use types::{AckMode, ConnectionId};

/// Observable lifecycle states of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    /// Check if the connection can carry traffic
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Check if the connection is permanently done
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

#[derive(Debug)]
struct StateCell {
    state: ConnectionState,
    reconnect_attempts: u32,
    last_error: Option<String>,
}

/// Entry point for opening connections. Reads the tuning store once per
/// `connect` call; later store mutation does not affect open connections.
pub struct Client {
    options: ClientOptions,
    store: Arc<TuningStore>,
    connector: Option<Arc<dyn TransportConnector>>,
    multicast_listener: Mutex<Option<MulticastExceptionListener>>,
    metrics: Arc<ClientMetrics>,
    next_connection_id: AtomicU64,
}

impl Client {
    pub fn new(options: ClientOptions, store: Arc<TuningStore>) -> Self {
        Self {
            options,
            store,
            connector: None,
            multicast_listener: Mutex::new(None),
            metrics: Arc::new(ClientMetrics::new()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Use a custom transport connector instead of TCP. This is the seam
    /// the connect/reconnect policy is exercised through in tests.
    pub fn with_connector(
        options: ClientOptions,
        store: Arc<TuningStore>,
        connector: Arc<dyn TransportConnector>,
    ) -> Self {
        let mut client = Self::new(options, store);
        client.connector = Some(connector);
        client
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn metrics(&self) -> Arc<ClientMetrics> {
        self.metrics.clone()
    }

    /// Install the process-wide multicast exception listener. New
    /// connections inherit it; [`Connection::set_multicast_exception_listener`]
    /// overrides it per connection.
    pub fn set_multicast_exception_listener<F>(&self, listener: F)
    where
        F: Fn(&MulticastException) + Send + Sync + 'static,
    {
        *self.multicast_listener.lock() = Some(Arc::new(listener));
    }

    pub fn clear_multicast_exception_listener(&self) {
        *self.multicast_listener.lock() = None;
    }

    /// Open a connection, attempting up to `connect_attempt_count` times
    /// with `connect_attempt_delay` between attempts, bounded overall by
    /// `connect_attempt_timeout`.
    pub async fn connect(&self) -> Result<Connection, ClientError> {
        let tuning = self.store.snapshot();
        let connector: Arc<dyn TransportConnector> = match &self.connector {
            Some(connector) => connector.clone(),
            None => Arc::new(TcpConnector::new(self.options.endpoint()?, tuning.clone())),
        };

        let count = tuning.connect_attempt_count;
        let delay = tuning.connect_attempt_delay;
        let deadline = tuning.connect_attempt_timeout.map(|t| Instant::now() + t);
        let mut last_error = "no attempts permitted (connect_attempt_count = 0)".to_string();

        for attempt in 1..=count {
            ClientMetrics::incr(&self.metrics.connection_attempts);
            debug!(
                attempt,
                count,
                endpoint = %connector.endpoint(),
                "connect attempt"
            );

            let result = match deadline {
                Some(deadline) => match timeout_at(deadline, connector.connect()).await {
                    Ok(result) => result,
                    Err(_) => {
                        ClientMetrics::incr(&self.metrics.failed_connects);
                        warn!(attempt, endpoint = %connector.endpoint(), "overall connect timeout");
                        return Err(ClientError::connect_failed(
                            attempt,
                            "overall connect timeout elapsed",
                        ));
                    }
                },
                None => connector.connect().await,
            };

            match result {
                Ok(transport) => {
                    ClientMetrics::incr(&self.metrics.successful_connects);
                    let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                    info!(
                        connection = id,
                        attempt,
                        endpoint = %connector.endpoint(),
                        "connected"
                    );
                    return Ok(Connection::establish(
                        id,
                        connector.endpoint(),
                        tuning,
                        connector,
                        transport,
                        self.metrics.clone(),
                        self.multicast_listener.lock().clone(),
                    ));
                }
                Err(e) => {
                    ClientMetrics::incr(&self.metrics.failed_connects);
                    warn!(attempt, count, "connect attempt failed: {e}");
                    last_error = e.to_string();

                    if attempt < count {
                        sleep(delay).await;
                        if let Some(deadline) = deadline {
                            if Instant::now() >= deadline {
                                return Err(ClientError::connect_failed(
                                    attempt,
                                    "overall connect timeout elapsed",
                                ));
                            }
                        }
                    }
                }
            }
        }

        Err(ClientError::connect_failed(count, last_error))
    }
}

/// An open connection to a broker endpoint. Cheap to clone; all clones
/// refer to the same underlying connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    pub(crate) id: ConnectionId,
    endpoint: String,
    pub(crate) tuning: Tuning,
    connector: Arc<dyn TransportConnector>,
    state: Mutex<StateCell>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    /// Destination name -> consumer routes
    pub(crate) routes: DashMap<String, Vec<Route>>,
    /// Creation-order session registry
    pub(crate) sessions: Mutex<Vec<Arc<SessionInner>>>,
    pub(crate) next_session_id: AtomicU64,
    pub(crate) next_temp_id: AtomicU64,
    exception_listener: Mutex<Option<ExceptionListener>>,
    multicast_listener: Mutex<Option<MulticastExceptionListener>>,
    pub(crate) metrics: Arc<ClientMetrics>,
    closed_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    fn establish(
        id: ConnectionId,
        endpoint: String,
        tuning: Tuning,
        connector: Arc<dyn TransportConnector>,
        transport: Arc<dyn Transport>,
        metrics: Arc<ClientMetrics>,
        multicast_listener: Option<MulticastExceptionListener>,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        let inner = Arc::new(ConnectionInner {
            id,
            endpoint,
            tuning,
            connector,
            state: Mutex::new(StateCell {
                state: ConnectionState::Connected,
                reconnect_attempts: 0,
                last_error: None,
            }),
            transport: RwLock::new(Some(transport.clone())),
            routes: DashMap::new(),
            sessions: Mutex::new(Vec::new()),
            next_session_id: AtomicU64::new(1),
            next_temp_id: AtomicU64::new(1),
            exception_listener: Mutex::new(None),
            multicast_listener: Mutex::new(multicast_listener),
            metrics,
            closed_tx,
            tasks: Mutex::new(Vec::new()),
        });

        ConnectionInner::spawn_reader(&inner, transport);
        Connection { inner }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_active()
    }

    /// Reconnect attempts made in the current/last reconnect episode.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.state.lock().reconnect_attempts
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.state.lock().last_error.clone()
    }

    /// Install the failover/exception listener. Invoked outside every
    /// connection lock; it may call back into the connection.
    pub fn set_exception_listener<F>(&self, listener: F)
    where
        F: Fn(&ExceptionEvent) + Send + Sync + 'static,
    {
        *self.inner.exception_listener.lock() = Some(Arc::new(listener));
    }

    /// Override the multicast exception listener for this connection.
    pub fn set_multicast_exception_listener<F>(&self, listener: F)
    where
        F: Fn(&MulticastException) + Send + Sync + 'static,
    {
        *self.inner.multicast_listener.lock() = Some(Arc::new(listener));
    }

    /// Create a session multiplexed over this connection.
    pub fn create_session(&self, ack_mode: AckMode) -> Result<Session, ClientError> {
        session::create(&self.inner, ack_mode)
    }

    /// Close the connection and cascade to every session, consumer, and
    /// producer, in creation order. Idempotent.
    ///
    /// With `allow_close_in_callback` off, calling this from inside a
    /// consumer callback is rejected with [`ClientError::CloseInCallback`];
    /// from any other thread it waits for in-flight callbacks to return.
    pub fn close(&self) -> Result<(), ClientError> {
        self.inner.guard_close_in_callback()?;

        {
            let mut cell = self.inner.state.lock();
            if cell.state == ConnectionState::Closed {
                return Ok(());
            }
            cell.state = ConnectionState::Closed;
        }
        let _ = self.inner.closed_tx.send(true);

        self.inner.close_sessions_cascade();

        let handles = std::mem::take(&mut *self.inner.tasks.lock());
        for handle in handles {
            handle.abort();
        }
        self.inner.transport.write().take();

        info!(connection = self.inner.id, "connection closed");
        Ok(())
    }
}

impl ConnectionInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().state == ConnectionState::Closed
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state.lock().state
    }

    /// Hand one encoded frame to the transport, guarded by connection state.
    pub(crate) async fn send_frame(
        &self,
        frame: Bytes,
        context: SendContext,
    ) -> Result<(), ClientError> {
        if !self.state.lock().state.is_active() {
            ClientMetrics::incr(&self.metrics.messages_failed);
            return Err(ClientError::send_failed_with_context(
                "connection is not connected",
                context,
            ));
        }

        let transport = self.transport.read().clone();
        let Some(transport) = transport else {
            ClientMetrics::incr(&self.metrics.messages_failed);
            return Err(ClientError::send_failed_with_context(
                "transport unavailable",
                context,
            ));
        };

        match transport.send(frame).await {
            Ok(()) => {
                ClientMetrics::incr(&self.metrics.messages_sent);
                Ok(())
            }
            Err(e) => {
                ClientMetrics::incr(&self.metrics.messages_failed);
                Err(ClientError::send_failed_with_context(e.to_string(), context))
            }
        }
    }

    fn spawn_reader(inner: &Arc<ConnectionInner>, transport: Arc<dyn Transport>) {
        let reader = inner.clone();
        let mut closed_rx = inner.closed_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = closed_rx.changed() => {
                        if changed.is_err() || *closed_rx.borrow() {
                            break;
                        }
                    }
                    event = transport.recv() => match event {
                        TransportEvent::Frame(bytes) => reader.dispatch_frame(bytes),
                        TransportEvent::MulticastGap { status, description } => {
                            reader.report_multicast_gap(status, &description);
                        }
                        TransportEvent::Closed { reason } => {
                            if !reader.is_closed() {
                                warn!(connection = reader.id, %reason, "transport lost");
                                ConnectionInner::spawn_reconnect(&reader, reason);
                            }
                            break;
                        }
                    }
                }
            }
        });
        inner.tasks.lock().push(handle);
    }

    /// Route one inbound frame to the consumers subscribed to its
    /// destination. Full queues drop the message for that consumer only.
    fn dispatch_frame(&self, bytes: Bytes) {
        let frame = match WireFrame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(connection = self.id, "discarding undecodable frame: {e}");
                return;
            }
        };

        let name = frame.destination.name().to_string();
        let message = frame.into_message();

        let targets: Vec<Route> = match self.routes.get(&name) {
            Some(routes) => routes.value().clone(),
            None => {
                debug!(connection = self.id, destination = %name, "no consumer for destination");
                return;
            }
        };

        for route in targets {
            match route.sender.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    ClientMetrics::incr(&self.metrics.messages_dropped);
                    warn!(
                        connection = self.id,
                        destination = %name,
                        "consumer queue full, message dropped"
                    );
                }
                // Consumer is tearing down; its route disappears shortly
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Fan a multicast-level transport exception out to the process-wide
    /// listener, once per live multicast consumer.
    fn report_multicast_gap(&self, status: i32, description: &str) {
        let listener = self.multicast_listener.lock().clone();
        let Some(listener) = listener else {
            debug!(
                connection = self.id,
                status, description, "multicast gap with no listener installed"
            );
            return;
        };

        let mut targets = Vec::new();
        for entry in self.routes.iter() {
            for route in entry.value() {
                if let Some(consumer) = route.consumer.upgrade() {
                    if consumer.is_multicast() && !consumer.is_closed() {
                        targets.push((consumer.session_id, consumer.id));
                    }
                }
            }
        }

        for (session, consumer) in targets {
            ClientMetrics::incr(&self.metrics.exceptions_reported);
            listener(&MulticastException {
                connection: self.id,
                session,
                consumer,
                status,
                description: description.to_string(),
            });
        }
    }

    fn spawn_reconnect(inner: &Arc<ConnectionInner>, reason: String) {
        {
            let mut cell = inner.state.lock();
            if cell.state == ConnectionState::Closed {
                return;
            }
            cell.state = ConnectionState::Reconnecting;
            cell.reconnect_attempts = 0;
            cell.last_error = Some(reason.clone());
        }
        inner.transport.write().take();
        inner.emit_exception(
            ExceptionKind::ReconnectStarted,
            format!("transport lost: {reason}"),
        );

        let task_inner = inner.clone();
        let handle = tokio::spawn(async move {
            ConnectionInner::run_reconnect(task_inner).await;
        });
        inner.tasks.lock().push(handle);
    }

    async fn run_reconnect(inner: Arc<ConnectionInner>) {
        let count = inner.tuning.reconnect_attempt_count;
        let delay = inner.tuning.reconnect_attempt_delay;
        let deadline = inner
            .tuning
            .reconnect_attempt_timeout
            .map(|t| Instant::now() + t);
        let mut closed_rx = inner.closed_tx.subscribe();
        let mut last_error = "no attempts permitted (reconnect_attempt_count = 0)".to_string();

        for attempt in 1..=count {
            {
                let mut cell = inner.state.lock();
                if cell.state == ConnectionState::Closed {
                    return;
                }
                cell.reconnect_attempts = attempt;
            }
            ClientMetrics::incr(&inner.metrics.reconnect_attempts);
            debug!(
                connection = inner.id,
                attempt,
                count,
                endpoint = %inner.connector.endpoint(),
                "reconnect attempt"
            );

            let connect = inner.connector.connect();
            let result = tokio::select! {
                // Explicit close cancels the loop between awaits
                _ = closed_rx.changed() => return,
                result = async {
                    match deadline {
                        Some(deadline) => timeout_at(deadline, connect)
                            .await
                            .unwrap_or_else(|_| Err(ClientError::Timeout(Duration::ZERO))),
                        None => connect.await,
                    }
                } => result,
            };

            match result {
                Ok(transport) => {
                    *inner.transport.write() = Some(transport.clone());
                    {
                        let mut cell = inner.state.lock();
                        if cell.state == ConnectionState::Closed {
                            return;
                        }
                        cell.state = ConnectionState::Connected;
                        cell.last_error = None;
                    }
                    info!(connection = inner.id, attempt, "reconnected");
                    inner.emit_exception(
                        ExceptionKind::ReconnectSucceeded,
                        format!("reconnected on attempt {attempt}"),
                    );
                    inner.emit_exception(
                        ExceptionKind::FailoverSwitch,
                        format!("failover to {} complete", inner.connector.endpoint()),
                    );
                    ConnectionInner::spawn_reader(&inner, transport);
                    return;
                }
                Err(e) => {
                    let deadline_hit =
                        deadline.is_some() && matches!(e, ClientError::Timeout(_));
                    warn!(connection = inner.id, attempt, count, "reconnect attempt failed: {e}");
                    last_error = if deadline_hit {
                        "overall reconnect timeout elapsed".to_string()
                    } else {
                        e.to_string()
                    };
                    if deadline_hit {
                        break;
                    }

                    if attempt < count {
                        tokio::select! {
                            _ = closed_rx.changed() => return,
                            _ = sleep(delay) => {}
                        }
                        if let Some(deadline) = deadline {
                            if Instant::now() >= deadline {
                                last_error = "overall reconnect timeout elapsed".to_string();
                                break;
                            }
                        }
                    }
                }
            }
        }

        inner.give_up(last_error);
    }

    /// Terminal transition after reconnect exhaustion.
    fn give_up(&self, reason: String) {
        let terminal = ClientError::ReconnectExhausted(reason.clone());
        {
            let mut cell = self.state.lock();
            if cell.state == ConnectionState::Closed {
                return;
            }
            cell.state = ConnectionState::Closed;
            cell.last_error = Some(terminal.to_string());
        }
        let _ = self.closed_tx.send(true);
        error!(connection = self.id, %reason, "reconnect attempts exhausted, connection closed");

        self.close_sessions_cascade();
        self.transport.write().take();
        // Terminal status is always delivered, regardless of FT gating
        self.emit_exception(ExceptionKind::ReconnectExhausted, reason);
    }

    /// Close all sessions in creation order, cascading to their consumers
    /// and producers.
    pub(crate) fn close_sessions_cascade(&self) {
        let sessions: Vec<Arc<SessionInner>> = std::mem::take(&mut *self.sessions.lock());
        for session in sessions {
            session.close_cascade();
        }
    }

    /// Reject a close issued from inside a consumer callback when the
    /// `allow_close_in_callback` tunable is off.
    pub(crate) fn guard_close_in_callback(&self) -> Result<(), ClientError> {
        if self.tuning.allow_close_in_callback {
            return Ok(());
        }
        let current = std::thread::current().id();
        let sessions = self.sessions.lock().clone();
        for session in sessions {
            if session.has_callback_on_thread(current) {
                return Err(ClientError::CloseInCallback);
            }
        }
        Ok(())
    }

    /// Deliver a fault-tolerance event to the exception listener, honoring
    /// the gating toggles. The listener runs with no locks held.
    pub(crate) fn emit_exception(&self, kind: ExceptionKind, description: String) {
        let deliver = match kind {
            ExceptionKind::ReconnectExhausted => true,
            ExceptionKind::FailoverSwitch => self.tuning.exception_on_ft_switch,
            ExceptionKind::ReconnectStarted | ExceptionKind::ReconnectSucceeded => {
                self.tuning.exception_on_ft_events
            }
        };
        if !deliver {
            debug!(connection = self.id, ?kind, "exception event suppressed by FT gating");
            return;
        }

        let listener = self.exception_listener.lock().clone();
        if let Some(listener) = listener {
            ClientMetrics::incr(&self.metrics.exceptions_reported);
            listener(&ExceptionEvent {
                connection: self.id,
                kind,
                status: kind.code(),
                description,
            });
        }
    }
}
