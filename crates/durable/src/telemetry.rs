//! Logging setup for hosts embedding the engine
//!
//! The engine itself only emits `tracing` spans and events. Hosts call
//! [`init_tracing`] (or [`init_from_env`], which loads `.env` first) once at
//! startup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "durable_engine=info";

/// Install a fmt subscriber filtered by `RUST_LOG`
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing() -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}

/// Load `.env` if present, then install the subscriber
pub fn init_from_env() -> bool {
    let loaded = dotenvy::dotenv().ok();
    let installed = init_tracing();
    if let Some(path) = loaded {
        tracing::debug!(path = %path.display(), "loaded environment file");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_rejected() {
        // The first call may lose to a subscriber installed by another test
        init_tracing();
        assert!(!init_tracing());
        assert!(!init_from_env());
    }
}
