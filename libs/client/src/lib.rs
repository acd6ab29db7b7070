//! # Courier Messaging Client
//!
//! A publish/subscribe messaging client core: connection lifecycle with
//! configurable connect/reconnect policy, session multiplexing, ordered
//! consumer dispatch, and a producer publish path.
//!
//! ## Architecture
//!
//! - [`Client`] opens connections, applying the connect-attempt policy
//!   from a [`config::TuningStore`] snapshot
//! - [`Connection`] owns the transport, its reader task, and the
//!   background reconnect loop; state transitions surface through the
//!   exception listener
//! - [`Session`]s are multiplexed over one connection and own consumers
//!   and producers; teardown cascades in creation order
//! - [`Consumer`]s drain per-consumer bounded queues: FIFO per consumer,
//!   no head-of-line blocking across consumers
//! - [`Producer`]s stamp default delivery parameters and hand frames to
//!   the transport, guarded by connection state
//!
//! ## Usage
//!
//! ```no_run
//! use courier::{Client, ClientOptions};
//! use config::TuningStore;
//! use types::{AckMode, Destination, DispatchMode, Message};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), courier::ClientError> {
//! let store = Arc::new(TuningStore::new());
//! store.set_connect_attempt_count(3)?;
//!
//! let client = Client::new(ClientOptions::new("tcp://127.0.0.1:7222"), store);
//! let connection = client.connect().await?;
//!
//! let session = connection.create_session(AckMode::Auto)?;
//! let queue = Destination::queue("orders.inbound")?;
//! let _consumer = session.subscribe(queue.clone(), DispatchMode::Unicast, |message| {
//!     println!("received {} bytes", message.size());
//! })?;
//!
//! let producer = session.create_producer(queue)?;
//! producer.send(Message::text("hello")?).await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod consumer;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod options;
pub mod producer;
pub mod session;
pub mod test_utils;
pub mod trace;
pub mod transport;

pub use connection::{Client, Connection, ConnectionState};
pub use consumer::{Consumer, MessageCallback};
pub use error::{ClientError, SendContext};
pub use listener::{
    ExceptionEvent, ExceptionKind, ExceptionListener, MulticastException,
    MulticastExceptionListener,
};
pub use metrics::ClientMetrics;
pub use options::ClientOptions;
pub use producer::{DeliveryDefaults, Producer};
pub use session::Session;
pub use trace::init_tracing;
pub use transport::{
    TcpConnector, TcpTransport, Transport, TransportConnector, TransportEvent, WireFrame,
    DEFAULT_MAX_FRAME_SIZE,
};

// Re-export the shared vocabulary for convenience
pub use types::{
    AckMode, DeliveryMode, Destination, DispatchMode, Message, MessageMetadata, MessagePriority,
};

/// Client runtime version, for diagnostics.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    #[test]
    fn version_matches_manifest() {
        assert_eq!(super::version(), env!("CARGO_PKG_VERSION"));
        assert!(!super::version().is_empty());
    }
}
