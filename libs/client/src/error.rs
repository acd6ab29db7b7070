use std::time::Duration;

/// Context information for send operations to aid in debugging
#[derive(Debug, Clone, Default)]
pub struct SendContext {
    /// Size of the message payload in bytes
    pub message_size: usize,
    /// Destination the send was aimed at, if known
    pub destination: Option<String>,
    /// Correlation ID for tracing, if available
    pub correlation_id: Option<String>,
}

impl SendContext {
    pub fn new(message_size: usize) -> Self {
        Self {
            message_size,
            destination: None,
            correlation_id: None,
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// Every configured connect attempt failed, or the overall connect
    /// deadline elapsed first.
    #[error("Connect failed after {attempts} attempt(s): {reason}")]
    ConnectFailed { attempts: u32, reason: String },

    /// The background reconnect loop gave up; the connection is Closed.
    #[error("Reconnect attempts exhausted: {0}")]
    ReconnectExhausted(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Send failed: {error} (size: {size}B, dest: {destination:?}, id: {correlation_id:?})",
            size = context.message_size,
            destination = context.destination,
            correlation_id = context.correlation_id)]
    SendFailed { error: String, context: SendContext },

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// The target connection, session, or consumer is already closed.
    #[error("Closed")]
    Closed,

    /// A close call was issued from inside a consumer callback while
    /// `allow_close_in_callback` is off.
    #[error("Close issued from within a consumer callback")]
    CloseInCallback,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(String),
}

impl ClientError {
    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionLost(_) | ClientError::Timeout(_)
        )
    }

    /// Check if this is a connection-related error
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectFailed { .. }
                | ClientError::ConnectionLost(_)
                | ClientError::ReconnectExhausted(_)
        )
    }

    /// Create a connect failed error
    pub fn connect_failed(attempts: u32, reason: impl Into<String>) -> Self {
        ClientError::ConnectFailed {
            attempts,
            reason: reason.into(),
        }
    }

    /// Create a send failed error with context
    pub fn send_failed_with_context(msg: impl Into<String>, context: SendContext) -> Self {
        ClientError::SendFailed {
            error: msg.into(),
            context,
        }
    }

    /// Create a send failed error with minimal context
    pub fn send_failed(msg: impl Into<String>) -> Self {
        ClientError::SendFailed {
            error: msg.into(),
            context: SendContext::default(),
        }
    }

    /// Create an invalid value error
    pub fn invalid_value(msg: impl Into<String>) -> Self {
        ClientError::InvalidValue(msg.into())
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(err.to_string())
    }
}

impl From<types::TypesError> for ClientError {
    fn from(err: types::TypesError) -> Self {
        ClientError::InvalidValue(err.to_string())
    }
}

impl From<config::ConfigError> for ClientError {
    fn from(err: config::ConfigError) -> Self {
        ClientError::InvalidValue(err.to_string())
    }
}
