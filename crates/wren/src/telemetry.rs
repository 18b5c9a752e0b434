// Telemetry — process-wide tracing subscriber
//
// Graph construction reports through `tracing` (a debug event per layer, an
// info event per finished network). Nothing is printed until a subscriber
// is installed; `init_tracing` installs the usual one: an `EnvFilter` from
// RUST_LOG (default "info") and the fmt layer.

use std::sync::OnceLock;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static INITIALISED: OnceLock<()> = OnceLock::new();

/// Errors from [`init_tracing`].
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("tracing has already been initialised")]
    AlreadyInitialised,
    #[error("failed to install the tracing subscriber: {0}")]
    Install(String),
}

/// Install the global subscriber once per process.
pub fn init_tracing() -> Result<(), InitError> {
    INITIALISED
        .set(())
        .map_err(|_| InitError::AlreadyInitialised)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    Registry::default()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| InitError::Install(e.to_string()))
}
