//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{CareLinkError, CareLinkResult};

/// Install the global fmt subscriber. `RUST_LOG` takes precedence over the
/// configured filter. Fails instead of panicking if a subscriber is already set.
pub fn init(cfg: &LoggingConfig) -> CareLinkResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| CareLinkError::Logging(e.to_string()))
}
