//! Listener contracts: exception/failover events and the multicast
//! exception channel.
//!
//! Listeners are plain `Fn` closures; caller state that the original
//! C surface threaded through an opaque pointer is captured by the
//! closure instead.

use std::sync::Arc;
use types::{ConnectionId, ConsumerId, SessionId};

/// Fault-tolerance event classes surfaced to the exception listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    /// A failover transition completed (connection re-established).
    /// Gated by the `exception_on_ft_switch` tunable.
    FailoverSwitch,
    /// Transport was lost and the reconnect loop started.
    /// Gated by the `exception_on_ft_events` tunable.
    ReconnectStarted,
    /// A reconnect attempt succeeded.
    /// Gated by the `exception_on_ft_events` tunable.
    ReconnectSucceeded,
    /// Every reconnect attempt failed; the connection is Closed.
    /// Terminal, always delivered.
    ReconnectExhausted,
}

impl ExceptionKind {
    /// Numeric status code carried alongside the event.
    pub fn code(self) -> i32 {
        match self {
            ExceptionKind::FailoverSwitch => 1,
            ExceptionKind::ReconnectStarted => 2,
            ExceptionKind::ReconnectSucceeded => 3,
            ExceptionKind::ReconnectExhausted => 4,
        }
    }

    /// Whether this event terminates the connection.
    pub fn is_terminal(self) -> bool {
        matches!(self, ExceptionKind::ReconnectExhausted)
    }
}

/// An event delivered to a connection's exception listener.
#[derive(Debug, Clone)]
pub struct ExceptionEvent {
    pub connection: ConnectionId,
    pub kind: ExceptionKind,
    pub status: i32,
    pub description: String,
}

/// A transport-level exception observed by a multicast consumer
/// (e.g. packet loss requiring a retransmission request). Non-fatal:
/// delivery to the consumer continues.
#[derive(Debug, Clone)]
pub struct MulticastException {
    pub connection: ConnectionId,
    pub session: SessionId,
    pub consumer: ConsumerId,
    pub status: i32,
    pub description: String,
}

/// Listener for fault-tolerance and terminal connection events.
pub type ExceptionListener = Arc<dyn Fn(&ExceptionEvent) + Send + Sync>;

/// Process-wide listener for multicast transport exceptions.
pub type MulticastExceptionListener = Arc<dyn Fn(&MulticastException) + Send + Sync>;
