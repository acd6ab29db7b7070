//! # Courier Tuning Store
//!
//! Process-wide tunables consulted by the client runtime: connect and
//! reconnect attempt policy, socket buffer sizing, multicast toggles, and
//! callback behavior switches.
//!
//! The store is an explicit object, not a hidden global: construct a
//! [`TuningStore`] at process start and hand a reference to each client.
//! Every setter validates its argument and returns an explicit status;
//! an out-of-range value leaves the previous value in place.
//!
//! Values are snapshotted ([`TuningStore::snapshot`]) when a connection is
//! opened. Mutating the store afterwards is permitted but has no effect on
//! connections that are already open.

pub mod loader;
pub mod store;

pub use loader::{load_tuning, TuningOverlay};
pub use store::{Tuning, TuningStore};

/// Errors produced by the tuning store and its file loader.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// A setter was given an out-of-range or malformed argument.
    #[error("Invalid value for {option}: {reason}")]
    InvalidValue {
        option: &'static str,
        reason: String,
    },

    /// The tuning file could not be read or parsed.
    #[error("Failed to load tuning file: {0}")]
    Load(String),
}

impl ConfigError {
    pub(crate) fn invalid(option: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            option,
            reason: reason.into(),
        }
    }
}
