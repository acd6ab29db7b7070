//! Destination naming and delivery mode vocabulary.
//!
//! Destinations form a flat string namespace: a name addresses either a
//! queue (point-to-point) or a topic (publish/subscribe). Temporary queues
//! used for request/reply live under the reserved `$TMP$.` prefix.

use crate::TypesError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reserved prefix for temporary (request/reply) queues.
pub const TEMPORARY_PREFIX: &str = "$TMP$.";

/// A named target for publish/subscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// Point-to-point queue
    Queue(String),
    /// One-to-many topic
    Topic(String),
}

impl Destination {
    /// Create a queue destination, rejecting empty names.
    pub fn queue(name: impl Into<String>) -> Result<Self, TypesError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Destination::Queue(name))
    }

    /// Create a topic destination, rejecting empty names.
    pub fn topic(name: impl Into<String>) -> Result<Self, TypesError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Destination::Topic(name))
    }

    fn validate(name: &str) -> Result<(), TypesError> {
        if name.is_empty() {
            return Err(TypesError::InvalidDestination("empty name".to_string()));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(TypesError::InvalidDestination(format!(
                "whitespace in name: {name:?}"
            )));
        }
        Ok(())
    }

    /// The flat namespace name, without queue/topic qualification.
    pub fn name(&self) -> &str {
        match self {
            Destination::Queue(name) | Destination::Topic(name) => name,
        }
    }

    /// Whether this is a temporary (request/reply) queue.
    pub fn is_temporary(&self) -> bool {
        matches!(self, Destination::Queue(name) if name.starts_with(TEMPORARY_PREFIX))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Queue(name) => write!(f, "queue:{name}"),
            Destination::Topic(name) => write!(f, "topic:{name}"),
        }
    }
}

/// Broker-side persistence policy for an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Message survives broker restart
    Persistent,
    /// Message may be dropped on broker restart
    NonPersistent,
    /// Fire-and-forget, no broker acknowledgment of the hand-off
    Reliable,
}

impl Default for DeliveryMode {
    fn default() -> Self {
        DeliveryMode::NonPersistent
    }
}

impl FromStr for DeliveryMode {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "persistent" => Ok(DeliveryMode::Persistent),
            "non_persistent" => Ok(DeliveryMode::NonPersistent),
            "reliable" => Ok(DeliveryMode::Reliable),
            other => Err(TypesError::UnknownDeliveryMode(other.to_string())),
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliveryMode::Persistent => "persistent",
            DeliveryMode::NonPersistent => "non_persistent",
            DeliveryMode::Reliable => "reliable",
        };
        f.write_str(s)
    }
}

/// Policy governing when a received message counts as consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Acknowledged on delivery to the callback
    Auto,
    /// Acknowledged explicitly by the application
    Client,
    /// Sends are buffered until an explicit commit
    Transacted,
}

impl Default for AckMode {
    fn default() -> Self {
        AckMode::Auto
    }
}

impl FromStr for AckMode {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(AckMode::Auto),
            "client" => Ok(AckMode::Client),
            "transacted" => Ok(AckMode::Transacted),
            other => Err(TypesError::UnknownAckMode(other.to_string())),
        }
    }
}

/// How inbound traffic reaches a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Dedicated per-consumer stream from the broker
    Unicast,
    /// Shared group address; subject to transport-level gap reporting
    Multicast,
}

impl Default for DispatchMode {
    fn default() -> Self {
        DispatchMode::Unicast
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_validation() {
        assert!(Destination::queue("orders.inbound").is_ok());
        assert!(Destination::topic("market.ticks").is_ok());
        assert!(Destination::queue("").is_err());
        assert!(Destination::topic("has space").is_err());
    }

    #[test]
    fn destination_name_and_temporary() {
        let q = Destination::queue("$TMP$.7.1").unwrap();
        assert!(q.is_temporary());
        assert_eq!(q.name(), "$TMP$.7.1");

        let t = Destination::topic("market.ticks").unwrap();
        assert!(!t.is_temporary());
    }

    #[test]
    fn delivery_mode_parsing() {
        assert_eq!(
            "persistent".parse::<DeliveryMode>().unwrap(),
            DeliveryMode::Persistent
        );
        assert_eq!(
            "NON_PERSISTENT".parse::<DeliveryMode>().unwrap(),
            DeliveryMode::NonPersistent
        );
        assert_eq!(
            "reliable".parse::<DeliveryMode>().unwrap(),
            DeliveryMode::Reliable
        );
        assert!("express".parse::<DeliveryMode>().is_err());
    }

    #[test]
    fn ack_mode_parsing() {
        assert_eq!("auto".parse::<AckMode>().unwrap(), AckMode::Auto);
        assert_eq!(
            "transacted".parse::<AckMode>().unwrap(),
            AckMode::Transacted
        );
        assert!("dups_ok".parse::<AckMode>().is_err());
    }
}
