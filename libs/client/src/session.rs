//! Sessions: logical channels multiplexed over one connection.
//!
//! A session cannot outlive its connection. Closing a connection closes
//! its sessions in creation order, and each session cascades to its
//! consumers and producers, also in creation order.

use crate::connection::ConnectionInner;
use crate::consumer::{self, Consumer, ConsumerInner, MessageCallback};
use crate::error::{ClientError, SendContext};
use crate::producer::{self, Producer, ProducerInner};
use crate::transport::WireFrame;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use types::destination::TEMPORARY_PREFIX;
use types::{AckMode, ConsumerId, Destination, DispatchMode, Message, SessionId};

pub(crate) fn create(
    conn: &Arc<ConnectionInner>,
    ack_mode: AckMode,
) -> Result<Session, ClientError> {
    if conn.is_closed() {
        return Err(ClientError::Closed);
    }

    let id = conn.next_session_id.fetch_add(1, Ordering::Relaxed);
    let inner = Arc::new(SessionInner {
        id,
        ack_mode,
        conn: Arc::downgrade(conn),
        consumers: Mutex::new(Vec::new()),
        producers: Mutex::new(Vec::new()),
        next_consumer_id: AtomicU64::new(1),
        next_producer_id: AtomicU64::new(1),
        tx_buffer: Mutex::new(Vec::new()),
        closed: AtomicBool::new(false),
    });
    conn.sessions.lock().push(inner.clone());

    debug!(connection = conn.id, session = id, ?ack_mode, "session created");
    Ok(Session { inner })
}

/// A logical channel over a connection, owning consumers and producers.
/// Cheap to clone; all clones refer to the same session.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    pub(crate) id: SessionId,
    pub(crate) ack_mode: AckMode,
    pub(crate) conn: Weak<ConnectionInner>,
    /// Creation-order consumer registry
    pub(crate) consumers: Mutex<Vec<Arc<ConsumerInner>>>,
    /// Creation-order producer registry
    pub(crate) producers: Mutex<Vec<Arc<ProducerInner>>>,
    pub(crate) next_consumer_id: AtomicU64,
    pub(crate) next_producer_id: AtomicU64,
    /// Sends buffered while a transacted session awaits commit
    pub(crate) tx_buffer: Mutex<Vec<(Bytes, SendContext)>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("ack_mode", &self.inner.ack_mode)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn ack_mode(&self) -> AckMode {
        self.inner.ack_mode
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Subscribe a callback consumer. Messages for `destination` are
    /// delivered FIFO to `callback` on a dedicated dispatch task.
    pub fn subscribe<F>(
        &self,
        destination: Destination,
        mode: DispatchMode,
        callback: F,
    ) -> Result<Consumer, ClientError>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let callback: MessageCallback = Arc::new(callback);
        consumer::subscribe(&self.inner, destination, mode, Some(callback))
    }

    /// Create a pull-style consumer without a callback; messages are
    /// retrieved with [`Consumer::recv`] / [`Consumer::recv_timeout`].
    pub fn create_receiver(
        &self,
        destination: Destination,
        mode: DispatchMode,
    ) -> Result<Consumer, ClientError> {
        consumer::subscribe(&self.inner, destination, mode, None)
    }

    /// Create a producer with default delivery parameters for `destination`.
    pub fn create_producer(&self, destination: Destination) -> Result<Producer, ClientError> {
        producer::create(&self.inner, destination)
    }

    /// Request/reply: send `message` to `destination` with a temporary
    /// reply queue and correlation id, and wait up to `timeout` for the
    /// correlated reply.
    pub async fn request(
        &self,
        destination: Destination,
        mut message: Message,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        if self.inner.is_closed() {
            return Err(ClientError::Closed);
        }
        let conn = self.inner.connection()?;

        let seq = conn.next_temp_id.fetch_add(1, Ordering::Relaxed);
        let reply_to = Destination::queue(format!("{TEMPORARY_PREFIX}{}.{seq}", conn.id))?;
        let correlation = format!("req-{}-{seq}", conn.id);

        let replies = consumer::subscribe(&self.inner, reply_to.clone(), DispatchMode::Unicast, None)?;

        message.metadata.destination = Some(destination.clone());
        message.metadata.reply_to = Some(reply_to);
        message.metadata.correlation_id = Some(correlation.clone());

        let context = SendContext::new(message.size())
            .with_destination(destination.name())
            .with_correlation_id(correlation.clone());
        let frame = WireFrame::from_message(&message)?.encode()?;

        if let Err(e) = conn.send_frame(frame, context).await {
            let _ = replies.close();
            return Err(e);
        }

        let deadline = Instant::now() + timeout;
        let result = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match replies.recv_timeout(remaining).await {
                Ok(reply) if reply.metadata.correlation_id.as_deref() == Some(&correlation) => {
                    break Ok(reply);
                }
                Ok(_) => {
                    debug!(session = self.inner.id, "discarding uncorrelated reply");
                }
                Err(e) => break Err(e),
            }
        };

        let _ = replies.close();
        result
    }

    /// Flush buffered transacted sends to the broker. Fails with
    /// `SendFailed` when the connection is not connected; unsent messages
    /// stay buffered for a retried commit.
    pub async fn commit(&self) -> Result<(), ClientError> {
        if self.inner.ack_mode != AckMode::Transacted {
            return Err(ClientError::invalid_value(
                "commit on a non-transacted session",
            ));
        }
        if self.inner.is_closed() {
            return Err(ClientError::Closed);
        }
        let conn = self.inner.connection()?;

        let frames: Vec<(Bytes, SendContext)> = std::mem::take(&mut *self.inner.tx_buffer.lock());
        let total = frames.len();

        for (index, (frame, context)) in frames.into_iter().enumerate() {
            if let Err(e) = conn.send_frame(frame.clone(), context.clone()).await {
                // Re-buffer this frame and the rest for a retried commit
                let mut buffer = self.inner.tx_buffer.lock();
                let mut tail = vec![(frame, context)];
                tail.extend(std::mem::take(&mut *buffer));
                *buffer = tail;
                warn!(
                    session = self.inner.id,
                    sent = index,
                    total,
                    "commit aborted: {e}"
                );
                return Err(e);
            }
        }

        debug!(session = self.inner.id, total, "transaction committed");
        Ok(())
    }

    /// Discard buffered transacted sends.
    pub fn rollback(&self) -> Result<(), ClientError> {
        if self.inner.ack_mode != AckMode::Transacted {
            return Err(ClientError::invalid_value(
                "rollback on a non-transacted session",
            ));
        }
        let dropped = {
            let mut buffer = self.inner.tx_buffer.lock();
            std::mem::take(&mut *buffer).len()
        };
        debug!(session = self.inner.id, dropped, "transaction rolled back");
        Ok(())
    }

    /// Close the session, cascading to its consumers and producers in
    /// creation order. Idempotent.
    pub fn close(&self) -> Result<(), ClientError> {
        let conn = self.inner.conn.upgrade();

        let allow = conn
            .as_ref()
            .map(|c| c.tuning.allow_close_in_callback)
            .unwrap_or(true);
        if !allow && self.inner.has_callback_on_thread(std::thread::current().id()) {
            return Err(ClientError::CloseInCallback);
        }

        if let Some(conn) = &conn {
            conn.sessions.lock().retain(|s| s.id != self.inner.id);
        }
        self.inner.close_cascade();
        Ok(())
    }
}

impl SessionInner {
    pub(crate) fn connection(&self) -> Result<Arc<ConnectionInner>, ClientError> {
        self.conn.upgrade().ok_or(ClientError::Closed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn has_callback_on_thread(&self, thread: ThreadId) -> bool {
        self.consumers
            .lock()
            .iter()
            .any(|c| c.callback_on_thread(thread))
    }

    /// Close consumers then producers, each in creation order. Called
    /// both from `Session::close` and the connection-level cascade.
    pub(crate) fn close_cascade(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let consumers: Vec<Arc<ConsumerInner>> = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers {
            consumer.close_for_cascade();
        }

        let producers: Vec<Arc<ProducerInner>> = std::mem::take(&mut *self.producers.lock());
        for producer in producers {
            producer.mark_closed();
        }

        self.tx_buffer.lock().clear();
        debug!(session = self.id, "session closed");
    }

    pub(crate) fn remove_consumer(&self, id: ConsumerId) {
        self.consumers.lock().retain(|c| c.id != id);
    }

    pub(crate) fn remove_producer(&self, id: u64) {
        self.producers.lock().retain(|p| p.id != id);
    }
}
