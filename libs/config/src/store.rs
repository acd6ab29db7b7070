//! The tuning store: validated setters, getters, and snapshots.

use crate::ConfigError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Immutable snapshot of every tunable, taken at connection open.
///
/// `None` for a timeout means unbounded; `None` for a socket buffer size
/// means the OS default is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tuning {
    pub connect_attempt_count: u32,
    pub connect_attempt_delay: Duration,
    pub connect_attempt_timeout: Option<Duration>,

    pub reconnect_attempt_count: u32,
    pub reconnect_attempt_delay: Duration,
    pub reconnect_attempt_timeout: Option<Duration>,

    pub socket_receive_buffer_kb: Option<u32>,
    pub socket_send_buffer_kb: Option<u32>,

    pub multicast_enabled: bool,
    pub multicast_daemon: Option<String>,

    pub exception_on_ft_switch: bool,
    pub exception_on_ft_events: bool,

    pub allow_close_in_callback: bool,

    pub trace_file: Option<PathBuf>,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            connect_attempt_count: 2,
            connect_attempt_delay: Duration::from_millis(500),
            connect_attempt_timeout: None,
            reconnect_attempt_count: 4,
            reconnect_attempt_delay: Duration::from_millis(500),
            reconnect_attempt_timeout: None,
            socket_receive_buffer_kb: None,
            socket_send_buffer_kb: None,
            multicast_enabled: false,
            multicast_daemon: None,
            exception_on_ft_switch: false,
            exception_on_ft_events: false,
            allow_close_in_callback: false,
            trace_file: None,
        }
    }
}

/// Process-wide mutable tuning store.
///
/// Setters mirror the C-style surface of the original client: they take
/// plain integer arguments (milliseconds, kilobytes, counts) and reject
/// out-of-range input with [`ConfigError::InvalidValue`], leaving the
/// stored value unchanged.
#[derive(Debug, Default)]
pub struct TuningStore {
    values: RwLock<Tuning>,
}

impl TuningStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a store starting from explicit values.
    pub fn with_values(values: Tuning) -> Self {
        Self {
            values: RwLock::new(values),
        }
    }

    /// Snapshot every tunable. Connections read this once at open;
    /// later mutation of the store does not affect them.
    pub fn snapshot(&self) -> Tuning {
        self.values.read().clone()
    }

    // --- connect policy -------------------------------------------------

    pub fn connect_attempt_count(&self) -> u32 {
        self.values.read().connect_attempt_count
    }

    pub fn set_connect_attempt_count(&self, count: i32) -> Result<(), ConfigError> {
        let count = non_negative("connect_attempt_count", count)?;
        debug!(count, "set connect_attempt_count");
        self.values.write().connect_attempt_count = count;
        Ok(())
    }

    pub fn connect_attempt_delay(&self) -> Duration {
        self.values.read().connect_attempt_delay
    }

    pub fn set_connect_attempt_delay(&self, delay_ms: i64) -> Result<(), ConfigError> {
        let delay = non_negative_ms("connect_attempt_delay", delay_ms)?;
        debug!(?delay, "set connect_attempt_delay");
        self.values.write().connect_attempt_delay = delay;
        Ok(())
    }

    pub fn connect_attempt_timeout(&self) -> Option<Duration> {
        self.values.read().connect_attempt_timeout
    }

    /// Overall connect deadline in milliseconds; 0 disables the deadline.
    pub fn set_connect_attempt_timeout(&self, timeout_ms: i64) -> Result<(), ConfigError> {
        let timeout = optional_ms("connect_attempt_timeout", timeout_ms)?;
        debug!(?timeout, "set connect_attempt_timeout");
        self.values.write().connect_attempt_timeout = timeout;
        Ok(())
    }

    // --- reconnect policy -----------------------------------------------

    pub fn reconnect_attempt_count(&self) -> u32 {
        self.values.read().reconnect_attempt_count
    }

    pub fn set_reconnect_attempt_count(&self, count: i32) -> Result<(), ConfigError> {
        let count = non_negative("reconnect_attempt_count", count)?;
        debug!(count, "set reconnect_attempt_count");
        self.values.write().reconnect_attempt_count = count;
        Ok(())
    }

    pub fn reconnect_attempt_delay(&self) -> Duration {
        self.values.read().reconnect_attempt_delay
    }

    pub fn set_reconnect_attempt_delay(&self, delay_ms: i64) -> Result<(), ConfigError> {
        let delay = non_negative_ms("reconnect_attempt_delay", delay_ms)?;
        debug!(?delay, "set reconnect_attempt_delay");
        self.values.write().reconnect_attempt_delay = delay;
        Ok(())
    }

    pub fn reconnect_attempt_timeout(&self) -> Option<Duration> {
        self.values.read().reconnect_attempt_timeout
    }

    /// Overall reconnect deadline in milliseconds; 0 disables the deadline.
    pub fn set_reconnect_attempt_timeout(&self, timeout_ms: i64) -> Result<(), ConfigError> {
        let timeout = optional_ms("reconnect_attempt_timeout", timeout_ms)?;
        debug!(?timeout, "set reconnect_attempt_timeout");
        self.values.write().reconnect_attempt_timeout = timeout;
        Ok(())
    }

    // --- socket buffers -------------------------------------------------

    pub fn socket_receive_buffer_kb(&self) -> Option<u32> {
        self.values.read().socket_receive_buffer_kb
    }

    /// Receive buffer size in kilobytes; 0 keeps the OS default.
    pub fn set_socket_receive_buffer_kb(&self, kilobytes: i32) -> Result<(), ConfigError> {
        let kb = optional_kb("socket_receive_buffer_kb", kilobytes)?;
        debug!(?kb, "set socket_receive_buffer_kb");
        self.values.write().socket_receive_buffer_kb = kb;
        Ok(())
    }

    pub fn socket_send_buffer_kb(&self) -> Option<u32> {
        self.values.read().socket_send_buffer_kb
    }

    /// Send buffer size in kilobytes; 0 keeps the OS default.
    pub fn set_socket_send_buffer_kb(&self, kilobytes: i32) -> Result<(), ConfigError> {
        let kb = optional_kb("socket_send_buffer_kb", kilobytes)?;
        debug!(?kb, "set socket_send_buffer_kb");
        self.values.write().socket_send_buffer_kb = kb;
        Ok(())
    }

    // --- multicast ------------------------------------------------------

    pub fn multicast_enabled(&self) -> bool {
        self.values.read().multicast_enabled
    }

    pub fn set_multicast_enabled(&self, enabled: bool) -> Result<(), ConfigError> {
        debug!(enabled, "set multicast_enabled");
        self.values.write().multicast_enabled = enabled;
        Ok(())
    }

    pub fn multicast_daemon(&self) -> Option<String> {
        self.values.read().multicast_daemon.clone()
    }

    /// Multicast daemon address as `host:port`.
    pub fn set_multicast_daemon(&self, address: &str) -> Result<(), ConfigError> {
        validate_host_port("multicast_daemon", address)?;
        debug!(address, "set multicast_daemon");
        self.values.write().multicast_daemon = Some(address.to_string());
        Ok(())
    }

    // --- fault-tolerance event gating ----------------------------------

    pub fn exception_on_ft_switch(&self) -> bool {
        self.values.read().exception_on_ft_switch
    }

    /// Gate delivery of completed-failover events to the exception listener.
    pub fn set_exception_on_ft_switch(&self, enabled: bool) -> Result<(), ConfigError> {
        debug!(enabled, "set exception_on_ft_switch");
        self.values.write().exception_on_ft_switch = enabled;
        Ok(())
    }

    pub fn exception_on_ft_events(&self) -> bool {
        self.values.read().exception_on_ft_events
    }

    /// Gate delivery of the broader fault-tolerance event class
    /// (reconnect started/succeeded) to the exception listener.
    pub fn set_exception_on_ft_events(&self, enabled: bool) -> Result<(), ConfigError> {
        debug!(enabled, "set exception_on_ft_events");
        self.values.write().exception_on_ft_events = enabled;
        Ok(())
    }

    // --- callback behavior ---------------------------------------------

    pub fn allow_close_in_callback(&self) -> bool {
        self.values.read().allow_close_in_callback
    }

    pub fn set_allow_close_in_callback(&self, allow: bool) -> Result<(), ConfigError> {
        debug!(allow, "set allow_close_in_callback");
        self.values.write().allow_close_in_callback = allow;
        Ok(())
    }

    // --- tracing --------------------------------------------------------

    pub fn trace_file(&self) -> Option<PathBuf> {
        self.values.read().trace_file.clone()
    }

    pub fn set_trace_file(&self, path: &Path) -> Result<(), ConfigError> {
        if path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("trace_file", "empty path"));
        }
        debug!(path = %path.display(), "set trace_file");
        self.values.write().trace_file = Some(path.to_path_buf());
        Ok(())
    }
}

fn non_negative(option: &'static str, value: i32) -> Result<u32, ConfigError> {
    u32::try_from(value).map_err(|_| ConfigError::invalid(option, format!("negative: {value}")))
}

fn non_negative_ms(option: &'static str, value: i64) -> Result<Duration, ConfigError> {
    let ms =
        u64::try_from(value).map_err(|_| ConfigError::invalid(option, format!("negative: {value}")))?;
    Ok(Duration::from_millis(ms))
}

fn optional_ms(option: &'static str, value: i64) -> Result<Option<Duration>, ConfigError> {
    let duration = non_negative_ms(option, value)?;
    Ok((!duration.is_zero()).then_some(duration))
}

fn optional_kb(option: &'static str, value: i32) -> Result<Option<u32>, ConfigError> {
    let kb = non_negative(option, value)?;
    Ok((kb != 0).then_some(kb))
}

fn validate_host_port(option: &'static str, address: &str) -> Result<(), ConfigError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::invalid(option, format!("expected host:port, got {address:?}")))?;
    if host.is_empty() {
        return Err(ConfigError::invalid(option, "empty host"));
    }
    port.parse::<u16>()
        .map_err(|_| ConfigError::invalid(option, format!("bad port: {port:?}")))?;
    Ok(())
}
