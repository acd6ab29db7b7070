//! # Courier Shared Types
//!
//! Message model and identifiers shared between the Courier client runtime
//! and its configuration layer: the protocol-agnostic [`Message`] wrapper,
//! destination naming, and the delivery/acknowledgment mode vocabulary.

pub mod destination;
pub mod message;

pub use destination::{AckMode, DeliveryMode, Destination, DispatchMode};
pub use message::{Message, MessageMetadata, MessagePriority, DEFAULT_MAX_MESSAGE_SIZE};

/// Errors produced when building or parsing shared types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TypesError {
    #[error("Message too large: {size}B exceeds limit of {limit}B")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("Invalid destination name: {0}")]
    InvalidDestination(String),

    #[error("Unknown delivery mode: {0}")]
    UnknownDeliveryMode(String),

    #[error("Unknown acknowledgment mode: {0}")]
    UnknownAckMode(String),
}

/// Unique identifier for a client connection.
pub type ConnectionId = u64;

/// Unique identifier for a session within a connection.
pub type SessionId = u64;

/// Unique identifier for a consumer within a session.
pub type ConsumerId = u64;
