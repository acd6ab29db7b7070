//! Consumers and the dispatch path.
//!
//! Each consumer owns a bounded queue fed by the connection's transport
//! reader. Callback consumers drain it on a dedicated dispatch task, so a
//! stalled callback stalls only its own consumer; pull consumers drain it
//! with [`Consumer::recv`] / [`Consumer::recv_timeout`]. Delivery is FIFO
//! per consumer; nothing is ordered across consumers.

use crate::connection::ConnectionInner;
use crate::error::ClientError;
use crate::metrics::ClientMetrics;
use crate::session::SessionInner;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use types::{ConsumerId, Destination, DispatchMode, Message, SessionId};

/// Capacity of each consumer's dispatch queue. When full, further
/// messages for that consumer are dropped (other consumers are
/// unaffected).
pub(crate) const DISPATCH_QUEUE_CAPACITY: usize = 1024;

/// Consumer message callback. Runs on the consumer's dispatch task.
pub type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;

/// One routing fan-out target: a consumer's queue plus a back-reference
/// for multicast exception reporting.
#[derive(Clone)]
pub(crate) struct Route {
    pub(crate) consumer: Weak<ConsumerInner>,
    pub(crate) sender: mpsc::Sender<Message>,
}

pub(crate) fn subscribe(
    session: &Arc<SessionInner>,
    destination: Destination,
    mode: DispatchMode,
    callback: Option<MessageCallback>,
) -> Result<Consumer, ClientError> {
    let conn = session.connection()?;
    if session.is_closed() || conn.is_closed() {
        return Err(ClientError::Closed);
    }
    if mode == DispatchMode::Multicast && !conn.tuning.multicast_enabled {
        return Err(ClientError::invalid_value(
            "multicast is disabled (multicast_enabled = false)",
        ));
    }

    let id = session.next_consumer_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::channel(DISPATCH_QUEUE_CAPACITY);

    let mut pull_rx = None;
    let mut dispatch_rx = None;
    if callback.is_some() {
        dispatch_rx = Some(rx);
    } else {
        pull_rx = Some(rx);
    }

    let inner = Arc::new(ConsumerInner {
        id,
        session_id: session.id,
        destination: destination.clone(),
        dispatch_mode: mode,
        allow_close_in_callback: conn.tuning.allow_close_in_callback,
        closed: AtomicBool::new(false),
        callback_thread: Mutex::new(None),
        callback_gate: Mutex::new(()),
        receiver: tokio::sync::Mutex::new(pull_rx),
        session: Arc::downgrade(session),
        conn: Arc::downgrade(&conn),
    });

    conn.routes
        .entry(destination.name().to_string())
        .or_default()
        .push(Route {
            consumer: Arc::downgrade(&inner),
            sender: tx,
        });
    session.consumers.lock().push(inner.clone());

    if let (Some(callback), Some(rx)) = (callback, dispatch_rx) {
        spawn_dispatch(inner.clone(), conn.metrics.clone(), callback, rx);
    }

    debug!(
        connection = conn.id,
        session = session.id,
        consumer = id,
        destination = %destination,
        ?mode,
        "consumer subscribed"
    );
    Ok(Consumer { inner })
}

/// The dispatch loop: one task per callback consumer, draining its queue
/// in FIFO order. The callback gate is held for the duration of each
/// invocation so close() can wait for an in-flight callback.
fn spawn_dispatch(
    inner: Arc<ConsumerInner>,
    metrics: Arc<ClientMetrics>,
    callback: MessageCallback,
    mut rx: mpsc::Receiver<Message>,
) {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            {
                // The closed check happens under the gate: a concurrent
                // close either sees the callback through or prevents it,
                // never races past it
                let _gate = inner.callback_gate.lock();
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                *inner.callback_thread.lock() = Some(std::thread::current().id());
                callback(&message);
                *inner.callback_thread.lock() = None;
            }
            ClientMetrics::incr(&metrics.messages_delivered);

            // A permitted self-close from inside the callback lands here
            if inner.closed.load(Ordering::SeqCst) {
                break;
            }
        }
        debug!(consumer = inner.id, "dispatch loop ended");
    });
}

/// A subscription handle. Cheap to clone; all clones refer to the same
/// consumer.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

pub(crate) struct ConsumerInner {
    pub(crate) id: ConsumerId,
    pub(crate) session_id: SessionId,
    destination: Destination,
    dispatch_mode: DispatchMode,
    allow_close_in_callback: bool,
    closed: AtomicBool,
    /// Thread currently executing this consumer's callback, if any
    callback_thread: Mutex<Option<ThreadId>>,
    /// Held for the duration of each callback invocation
    callback_gate: Mutex<()>,
    /// Present only for pull-style consumers
    receiver: tokio::sync::Mutex<Option<mpsc::Receiver<Message>>>,
    session: Weak<SessionInner>,
    conn: Weak<ConnectionInner>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.inner.id)
            .field("destination", &self.inner.destination)
            .field("dispatch_mode", &self.inner.dispatch_mode)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl Consumer {
    pub fn id(&self) -> ConsumerId {
        self.inner.id
    }

    pub fn destination(&self) -> &Destination {
        &self.inner.destination
    }

    /// Whether this consumer receives over a multicast group.
    pub fn is_multicast(&self) -> bool {
        self.inner.is_multicast()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Wait for the next message on a pull-style consumer.
    pub async fn recv(&self) -> Result<Message, ClientError> {
        self.pull(None).await
    }

    /// Wait up to `timeout` for the next message on a pull-style consumer.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Message, ClientError> {
        self.pull(Some(timeout)).await
    }

    async fn pull(&self, timeout: Option<Duration>) -> Result<Message, ClientError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        let mut guard = self.inner.receiver.lock().await;
        let rx = guard
            .as_mut()
            .ok_or_else(|| ClientError::invalid_value("consumer uses callback dispatch"))?;

        let received = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(received) => received,
                Err(_) => return Err(ClientError::Timeout(timeout)),
            },
            None => rx.recv().await,
        };

        match received {
            Some(message) => {
                if let Some(conn) = self.inner.conn.upgrade() {
                    ClientMetrics::incr(&conn.metrics.messages_delivered);
                }
                Ok(message)
            }
            None => Err(ClientError::Closed),
        }
    }

    /// Close the consumer and release its route. Idempotent.
    ///
    /// Called from outside a callback this waits for any in-flight
    /// callback to return. Called from *inside* this consumer's callback
    /// it is rejected with [`ClientError::CloseInCallback`] unless the
    /// `allow_close_in_callback` tunable is on, in which case the close
    /// takes effect when the callback returns.
    pub fn close(&self) -> Result<(), ClientError> {
        self.inner.close_common(false)
    }
}

impl ConsumerInner {
    pub(crate) fn is_multicast(&self) -> bool {
        self.dispatch_mode == DispatchMode::Multicast
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn callback_on_thread(&self, thread: ThreadId) -> bool {
        *self.callback_thread.lock() == Some(thread)
    }

    /// Cascade closes come from session/connection teardown; the
    /// close-in-callback guard has already run at that level.
    pub(crate) fn close_for_cascade(&self) {
        let _ = self.close_common(true);
    }

    fn close_common(&self, cascade: bool) -> Result<(), ClientError> {
        let self_close = self.callback_on_thread(std::thread::current().id());
        if self_close && !self.allow_close_in_callback {
            return Err(ClientError::CloseInCallback);
        }

        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.unregister_route();
        if !cascade {
            if let Some(session) = self.session.upgrade() {
                session.remove_consumer(self.id);
            }
        }

        if !self_close {
            // Wait for an in-flight callback before reporting the
            // consumer released
            drop(self.callback_gate.lock());
        }

        debug!(consumer = self.id, self_close, "consumer closed");
        Ok(())
    }

    fn unregister_route(&self) {
        let Some(conn) = self.conn.upgrade() else {
            return;
        };
        let name = self.destination.name();
        let self_ptr = self as *const ConsumerInner;
        if let Some(mut routes) = conn.routes.get_mut(name) {
            routes.retain(|route| !std::ptr::eq(route.consumer.as_ptr(), self_ptr));
        }
        conn.routes.remove_if(name, |_, routes| routes.is_empty());
    }
}
