//! Logging infrastructure for plugin processes.
//!
//! Plugin binaries speak the framed protocol on standard output, so every
//! human-readable diagnostic must go to standard error. This module installs
//! a tracing subscriber writing there, filterable via `RUST_LOG` and
//! defaulting to `info`.

use std::io;

use tracing_subscriber::EnvFilter;

/// Initialize logging for a plugin binary.
///
/// Idempotent: a second call (e.g. from tests sharing a process) is a no-op
/// instead of a panic.
pub fn init_plugin_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_plugin_logging();
        // A second call must not panic on the already-set global subscriber.
        init_plugin_logging();
    }
}
