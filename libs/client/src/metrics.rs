use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for monitoring client behavior
#[derive(Debug, Default)]
pub struct ClientMetrics {
    /// Total connection attempts
    pub connection_attempts: AtomicU64,
    /// Successful connections
    pub successful_connects: AtomicU64,
    /// Failed connection attempts
    pub failed_connects: AtomicU64,
    /// Background reconnection attempts
    pub reconnect_attempts: AtomicU64,
    /// Messages handed to the transport successfully
    pub messages_sent: AtomicU64,
    /// Messages that failed to send
    pub messages_failed: AtomicU64,
    /// Messages delivered to consumer callbacks or receivers
    pub messages_delivered: AtomicU64,
    /// Messages dropped because a consumer queue was full
    pub messages_dropped: AtomicU64,
    /// Exception events reported through listeners
    pub exceptions_reported: AtomicU64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get connection success rate
    pub fn connection_success_rate(&self) -> f64 {
        let total = self.connection_attempts.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        let successful = self.successful_connects.load(Ordering::Relaxed);
        successful as f64 / total as f64
    }

    /// Get message send success rate
    pub fn message_success_rate(&self) -> f64 {
        let sent = self.messages_sent.load(Ordering::Relaxed);
        let failed = self.messages_failed.load(Ordering::Relaxed);
        let total = sent + failed;
        if total == 0 {
            return 1.0;
        }
        sent as f64 / total as f64
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
