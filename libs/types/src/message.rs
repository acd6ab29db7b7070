use crate::{DeliveryMode, Destination, TypesError};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Maximum message size in bytes (16MB default)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Protocol-agnostic message wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Raw message bytes (could be text, JSON, binary payloads)
    pub payload: Vec<u8>,

    /// Routing and delivery metadata
    pub metadata: MessageMetadata,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            payload: Vec::new(),
            metadata: MessageMetadata::default(),
        }
    }
}

impl Message {
    /// Create a new message with payload, validating size
    pub fn new(payload: Vec<u8>) -> Result<Self, TypesError> {
        Self::new_with_limit(payload, DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a new message with payload and custom size limit
    pub fn new_with_limit(payload: Vec<u8>, max_size: usize) -> Result<Self, TypesError> {
        if payload.len() > max_size {
            return Err(TypesError::MessageTooLarge {
                size: payload.len(),
                limit: max_size,
            });
        }

        Ok(Self {
            payload,
            metadata: MessageMetadata::new(),
        })
    }

    /// Create a new message from a UTF-8 string payload
    pub fn text(body: impl Into<String>) -> Result<Self, TypesError> {
        Self::new(body.into().into_bytes())
    }

    /// Create a new message with payload and metadata, validating size
    pub fn with_metadata(payload: Vec<u8>, metadata: MessageMetadata) -> Result<Self, TypesError> {
        if payload.len() > DEFAULT_MAX_MESSAGE_SIZE {
            return Err(TypesError::MessageTooLarge {
                size: payload.len(),
                limit: DEFAULT_MAX_MESSAGE_SIZE,
            });
        }

        Ok(Self { payload, metadata })
    }

    /// Create a new message without size validation (for internal use)
    pub fn new_unchecked(payload: Vec<u8>) -> Self {
        Self {
            payload,
            metadata: MessageMetadata::new(),
        }
    }

    /// Get message size in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Check if message exceeds size limit
    pub fn exceeds_limit(&self, limit: usize) -> bool {
        self.payload.len() > limit
    }

    /// Payload interpreted as UTF-8, if it is valid
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Destination this message was sent to or received from
    pub destination: Option<Destination>,

    /// Reply destination for request/reply exchanges
    pub reply_to: Option<Destination>,

    /// Correlation ID for tracing and request/reply matching
    pub correlation_id: Option<String>,

    /// Message priority for queueing
    pub priority: MessagePriority,

    /// Broker persistence policy
    pub delivery_mode: DeliveryMode,

    /// Broker-side delay before the message becomes deliverable
    pub delivery_delay: Duration,

    /// Time-to-live after which the broker discards the message
    pub time_to_live: Option<Duration>,

    /// Timestamp when created
    pub timestamp: SystemTime,
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageMetadata {
    pub fn new() -> Self {
        Self {
            destination: None,
            reply_to: None,
            correlation_id: None,
            priority: MessagePriority::Normal,
            delivery_mode: DeliveryMode::default(),
            delivery_delay: Duration::ZERO,
            time_to_live: None,
            timestamp: SystemTime::now(),
        }
    }

    /// Set destination
    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Set reply destination
    pub fn with_reply_to(mut self, reply_to: Destination) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// Set correlation ID
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set priority
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set delivery mode
    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Set delivery delay
    pub fn with_delivery_delay(mut self, delay: Duration) -> Self {
        self.delivery_delay = delay;
        self
    }

    /// Set time-to-live
    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MessagePriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Default for MessagePriority {
    fn default() -> Self {
        MessagePriority::Normal
    }
}
