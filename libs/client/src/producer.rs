//! Producers: the publish path.
//!
//! A producer carries default delivery parameters (mode, delivery delay,
//! time-to-live) that are stamped onto each message it sends. Sends are
//! synchronous with respect to the local hand-off to the transport; on a
//! transacted session they are buffered until [`crate::Session::commit`].

use crate::error::{ClientError, SendContext};
use crate::metrics::ClientMetrics;
use crate::session::SessionInner;
use crate::transport::WireFrame;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;
use types::{AckMode, DeliveryMode, Destination, Message};

pub(crate) fn create(
    session: &Arc<SessionInner>,
    destination: Destination,
) -> Result<Producer, ClientError> {
    let conn = session.connection()?;
    if session.is_closed() || conn.is_closed() {
        return Err(ClientError::Closed);
    }

    let id = session.next_producer_id.fetch_add(1, Ordering::Relaxed);
    let inner = Arc::new(ProducerInner {
        id,
        destination: destination.clone(),
        defaults: Mutex::new(DeliveryDefaults::default()),
        session: Arc::downgrade(session),
        closed: AtomicBool::new(false),
    });
    session.producers.lock().push(inner.clone());

    debug!(
        session = session.id,
        producer = id,
        destination = %destination,
        "producer created"
    );
    Ok(Producer { inner })
}

/// Default delivery parameters stamped onto every send.
#[derive(Debug, Clone)]
pub struct DeliveryDefaults {
    pub delivery_mode: DeliveryMode,
    pub delivery_delay: Duration,
    pub time_to_live: Option<Duration>,
}

impl Default for DeliveryDefaults {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::default(),
            delivery_delay: Duration::ZERO,
            time_to_live: None,
        }
    }
}

/// A publish handle for one destination. Cheap to clone.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

pub(crate) struct ProducerInner {
    pub(crate) id: u64,
    destination: Destination,
    defaults: Mutex<DeliveryDefaults>,
    session: Weak<SessionInner>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("id", &self.inner.id)
            .field("destination", &self.inner.destination)
            .finish()
    }
}

impl Producer {
    pub fn destination(&self) -> &Destination {
        &self.inner.destination
    }

    pub fn delivery_defaults(&self) -> DeliveryDefaults {
        self.inner.defaults.lock().clone()
    }

    pub fn set_delivery_mode(&self, mode: DeliveryMode) {
        self.inner.defaults.lock().delivery_mode = mode;
    }

    pub fn set_delivery_delay(&self, delay: Duration) {
        self.inner.defaults.lock().delivery_delay = delay;
    }

    pub fn set_time_to_live(&self, ttl: Option<Duration>) {
        self.inner.defaults.lock().time_to_live = ttl;
    }

    /// Send one message to this producer's destination.
    ///
    /// Fails with `SendFailed` when the connection is not in the
    /// Connected state. On a transacted session the message is buffered
    /// locally and only reaches the transport at commit.
    pub async fn send(&self, mut message: Message) -> Result<(), ClientError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        let session = self.inner.session.upgrade().ok_or(ClientError::Closed)?;
        if session.is_closed() {
            return Err(ClientError::Closed);
        }
        let conn = session.connection()?;

        let defaults = self.inner.defaults.lock().clone();
        message.metadata.destination = Some(self.inner.destination.clone());
        message.metadata.delivery_mode = defaults.delivery_mode;
        message.metadata.delivery_delay = defaults.delivery_delay;
        message.metadata.time_to_live = defaults.time_to_live;

        let mut context = SendContext::new(message.size())
            .with_destination(self.inner.destination.name());
        if let Some(id) = &message.metadata.correlation_id {
            context = context.with_correlation_id(id.clone());
        }

        let frame = WireFrame::from_message(&message)?.encode()?;

        // Sends require a live connection even when transacted
        if !conn.state().is_active() {
            ClientMetrics::incr(&conn.metrics.messages_failed);
            return Err(ClientError::send_failed_with_context(
                "connection is not connected",
                context,
            ));
        }

        if session.ack_mode == AckMode::Transacted {
            session.tx_buffer.lock().push((frame, context));
            debug!(
                session = session.id,
                producer = self.inner.id,
                "send buffered until commit"
            );
            return Ok(());
        }

        conn.send_frame(frame, context).await
    }

    /// Close the producer. Idempotent.
    pub fn close(&self) -> Result<(), ClientError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(session) = self.inner.session.upgrade() {
            session.remove_producer(self.inner.id);
        }
        debug!(producer = self.inner.id, "producer closed");
        Ok(())
    }
}

impl ProducerInner {
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
