//! Tuning file loading.
//!
//! Loads a TOML overlay with environment-variable overrides (`COURIER_`
//! prefix) and applies it through the store's validating setters, so a bad
//! value in a file surfaces as the same [`ConfigError::InvalidValue`] a bad
//! setter call would.

use crate::{ConfigError, TuningStore};
use anyhow::{Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Optional overrides read from disk or the environment. Absent fields
/// leave the store untouched.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TuningOverlay {
    pub connect_attempt_count: Option<i32>,
    pub connect_attempt_delay_ms: Option<i64>,
    pub connect_attempt_timeout_ms: Option<i64>,

    pub reconnect_attempt_count: Option<i32>,
    pub reconnect_attempt_delay_ms: Option<i64>,
    pub reconnect_attempt_timeout_ms: Option<i64>,

    pub socket_receive_buffer_kb: Option<i32>,
    pub socket_send_buffer_kb: Option<i32>,

    pub multicast_enabled: Option<bool>,
    pub multicast_daemon: Option<String>,

    pub exception_on_ft_switch: Option<bool>,
    pub exception_on_ft_events: Option<bool>,

    pub allow_close_in_callback: Option<bool>,

    pub trace_file: Option<PathBuf>,
}

impl TuningOverlay {
    /// Load the overlay from an optional TOML file plus `COURIER_*`
    /// environment variables (environment wins).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if path.exists() {
                info!(path = %path.display(), "Loading tuning file");
                builder = builder.add_source(File::from(path));
            } else {
                warn!(path = %path.display(), "Tuning file not found, using defaults");
            }
        }

        builder = builder.add_source(Environment::with_prefix("COURIER").try_parsing(true));

        let config = builder.build().context("Failed to build tuning sources")?;

        config
            .try_deserialize()
            .context("Failed to deserialize tuning overlay")
    }

    /// Push every present field through the store's validating setter.
    pub fn apply(&self, store: &TuningStore) -> Result<(), ConfigError> {
        if let Some(v) = self.connect_attempt_count {
            store.set_connect_attempt_count(v)?;
        }
        if let Some(v) = self.connect_attempt_delay_ms {
            store.set_connect_attempt_delay(v)?;
        }
        if let Some(v) = self.connect_attempt_timeout_ms {
            store.set_connect_attempt_timeout(v)?;
        }
        if let Some(v) = self.reconnect_attempt_count {
            store.set_reconnect_attempt_count(v)?;
        }
        if let Some(v) = self.reconnect_attempt_delay_ms {
            store.set_reconnect_attempt_delay(v)?;
        }
        if let Some(v) = self.reconnect_attempt_timeout_ms {
            store.set_reconnect_attempt_timeout(v)?;
        }
        if let Some(v) = self.socket_receive_buffer_kb {
            store.set_socket_receive_buffer_kb(v)?;
        }
        if let Some(v) = self.socket_send_buffer_kb {
            store.set_socket_send_buffer_kb(v)?;
        }
        if let Some(v) = self.multicast_enabled {
            store.set_multicast_enabled(v)?;
        }
        if let Some(v) = &self.multicast_daemon {
            store.set_multicast_daemon(v)?;
        }
        if let Some(v) = self.exception_on_ft_switch {
            store.set_exception_on_ft_switch(v)?;
        }
        if let Some(v) = self.exception_on_ft_events {
            store.set_exception_on_ft_events(v)?;
        }
        if let Some(v) = self.allow_close_in_callback {
            store.set_allow_close_in_callback(v)?;
        }
        if let Some(v) = &self.trace_file {
            store.set_trace_file(v)?;
        }
        Ok(())
    }
}

/// Convenience: load an overlay and apply it to the store.
pub fn load_tuning(path: Option<&Path>, store: &TuningStore) -> Result<()> {
    let overlay = TuningOverlay::load(path)?;
    overlay.apply(store).context("Rejected tuning value")?;
    Ok(())
}
