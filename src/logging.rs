//! Subscriber bootstrap for processes embedding the gate.
//!
//! The library itself only emits `tracing` events. Call [`init_logging`] once
//! at startup to print them; `RUST_LOG` overrides the default `info` filter.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Installs a global `fmt` subscriber filtered by `RUST_LOG`, falling back
/// to `info`.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_logging() -> Result<(), TryInitError> {
    init_logging_with("info")
}

/// Like [`init_logging`] with a caller-chosen fallback filter, e.g.
/// `"credit_gate=debug"`.
pub fn init_logging_with(default_filter: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_rejected() {
        // Another test may already have installed a subscriber.
        let _ = init_logging_with("credit_gate=debug");
        assert!(init_logging().is_err());
    }
}
