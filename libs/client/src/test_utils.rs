//! In-memory transports for exercising connection policy, dispatch, and
//! teardown without sockets.

use crate::error::ClientError;
use crate::transport::{Transport, TransportConnector, TransportEvent, WireFrame};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use types::Message;

/// A transport that records outbound frames and replays injected events.
#[derive(Debug)]
pub struct MemoryTransport {
    outbound: Mutex<Vec<Bytes>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    fail_on_send: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            outbound: Mutex::new(Vec::new()),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            fail_on_send: AtomicBool::new(false),
        })
    }

    /// Queue an inbound frame for the connection's reader.
    pub fn inject_frame(&self, frame: &WireFrame) {
        let bytes = frame.encode().expect("frame encode");
        let _ = self.events_tx.send(TransportEvent::Frame(bytes));
    }

    /// Queue an inbound message for the connection's reader.
    pub fn inject_message(&self, message: &Message) {
        let frame = WireFrame::from_message(message).expect("message has destination");
        self.inject_frame(&frame);
    }

    /// Queue a multicast-level exception.
    pub fn inject_multicast_gap(&self, status: i32, description: impl Into<String>) {
        let _ = self.events_tx.send(TransportEvent::MulticastGap {
            status,
            description: description.into(),
        });
    }

    /// Simulate transport loss; the connection's reconnect policy kicks in.
    pub fn drop_link(&self, reason: impl Into<String>) {
        let _ = self.events_tx.send(TransportEvent::Closed {
            reason: reason.into(),
        });
    }

    /// Configure the next send to fail.
    pub fn fail_next_send(&self) {
        self.fail_on_send.store(true, Ordering::Relaxed);
    }

    /// Decoded frames handed to this transport, in send order.
    pub fn sent_frames(&self) -> Vec<WireFrame> {
        self.outbound
            .lock()
            .iter()
            .map(|bytes| WireFrame::decode(bytes).expect("recorded frame decodes"))
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.outbound.lock().len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: Bytes) -> Result<(), ClientError> {
        if self.fail_on_send.swap(false, Ordering::Relaxed) {
            return Err(ClientError::ConnectionLost(
                "simulated send failure".to_string(),
            ));
        }
        self.outbound.lock().push(frame);
        Ok(())
    }

    async fn recv(&self) -> TransportEvent {
        let mut rx = self.events_rx.lock().await;
        match rx.recv().await {
            Some(event) => event,
            // Unreachable while the transport is alive; it owns a sender
            None => TransportEvent::Closed {
                reason: "event channel dropped".to_string(),
            },
        }
    }

    async fn shutdown(&self) {}
}

/// Scripted outcome for one `connect()` call on [`MemoryConnector`].
#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    Succeed,
    Fail(String),
}

/// Connector with scriptable per-attempt outcomes. Unscripted attempts
/// succeed with a fresh [`MemoryTransport`].
#[derive(Debug)]
pub struct MemoryConnector {
    outcomes: Mutex<VecDeque<ConnectOutcome>>,
    connect_delay: Mutex<Option<Duration>>,
    attempts: AtomicU32,
    transports: Mutex<Vec<Arc<MemoryTransport>>>,
}

impl MemoryConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(VecDeque::new()),
            connect_delay: Mutex::new(None),
            attempts: AtomicU32::new(0),
            transports: Mutex::new(Vec::new()),
        })
    }

    /// Script the outcomes of the next connect calls, in order.
    pub fn script(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        self.outcomes.lock().extend(outcomes);
    }

    /// Make the next `n` connect calls fail.
    pub fn fail_next(&self, n: usize) {
        self.script((0..n).map(|i| ConnectOutcome::Fail(format!("scripted failure {i}"))));
    }

    /// Add a fixed delay to every connect call.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = Some(delay);
    }

    /// Number of connect calls observed so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Every transport this connector has produced, in creation order.
    pub fn transports(&self) -> Vec<Arc<MemoryTransport>> {
        self.transports.lock().clone()
    }

    /// The most recently produced transport.
    pub fn latest_transport(&self) -> Option<Arc<MemoryTransport>> {
        self.transports.lock().last().cloned()
    }
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, ClientError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);

        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = self
            .outcomes
            .lock()
            .pop_front()
            .unwrap_or(ConnectOutcome::Succeed);
        match outcome {
            ConnectOutcome::Succeed => {
                let transport = MemoryTransport::new();
                self.transports.lock().push(transport.clone());
                Ok(transport)
            }
            ConnectOutcome::Fail(reason) => Err(ClientError::Io(reason)),
        }
    }

    fn endpoint(&self) -> String {
        "memory://test".to_string()
    }
}

/// A connector that always fails, for exercising exhaustion paths.
#[derive(Debug)]
pub struct FailingConnector {
    reason: String,
    attempts: AtomicU32,
}

impl FailingConnector {
    pub fn new(reason: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            reason: reason.into(),
            attempts: AtomicU32::new(0),
        })
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TransportConnector for FailingConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, ClientError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        Err(ClientError::Io(self.reason.clone()))
    }

    fn endpoint(&self) -> String {
        "memory://failing".to_string()
    }
}
