//! Tracing initialization honoring the `trace_file` tunable.

use crate::error::ClientError;
use once_cell::sync::OnceCell;
use std::path::Path;
use tracing_subscriber::EnvFilter;

static INITIALIZED: OnceCell<()> = OnceCell::new();

/// Install the process-wide tracing subscriber: to `trace_file` when set
/// (append, no ANSI), to stderr otherwise. `RUST_LOG` refines the filter;
/// the default level is `info`. Subsequent calls are no-ops.
pub fn init_tracing(trace_file: Option<&Path>) -> Result<(), ClientError> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match trace_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| ClientError::Io(format!("open trace file {}: {e}", path.display())))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .try_init()
                .map_err(|e| ClientError::Io(format!("install subscriber: {e}")))?;
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| ClientError::Io(format!("install subscriber: {e}")))?;
        }
    }

    let _ = INITIALIZED.set(());
    Ok(())
}
