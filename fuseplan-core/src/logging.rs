use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Filter directives taking precedence over `RUST_LOG`.
pub const LOG_FILTER_ENV: &str = "FUSEPLAN_LOG";

static INITIALISED: OnceLock<()> = OnceLock::new();

/// Install the global tracing subscriber: an env filter (default `info`)
/// and a formatted layer with targets. Only the first call succeeds.
pub fn init_tracing() -> Result<(), InitError> {
    INITIALISED
        .set(())
        .map_err(|_| InitError::AlreadyInitialised)?;

    let filter = match filter_directives()? {
        Some(directives) => {
            EnvFilter::try_new(&directives).map_err(|e| InitError::Filter(e.to_string()))?
        }
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(std::io::stdout().is_terminal());

    Registry::default()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|_| InitError::AlreadyInitialised)
}

fn filter_directives() -> Result<Option<String>, InitError> {
    match std::env::var(LOG_FILTER_ENV) {
        Ok(raw) if !raw.trim().is_empty() => Ok(Some(raw)),
        Ok(_) => Ok(None),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(InitError::Env(err)),
    }
}

/// Errors emitted when configuring the tracing subscriber.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("tracing has already been initialised")]
    AlreadyInitialised,
    #[error("failed to read {LOG_FILTER_ENV}: {0}")]
    Env(std::env::VarError),
    #[error("invalid {LOG_FILTER_ENV} directives: {0}")]
    Filter(String),
}
