use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

use crate::config::{LogFormat, LoggingConfig};

/// Install the global subscriber. `RUST_LOG` overrides the configured filter;
/// an invalid directive falls back to `info`.
pub fn init(config: &LoggingConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|err| {
            eprintln!("invalid log filter `{}` ({}), using info", config.filter, err);
            EnvFilter::new("info")
        });

    let layer = match config.format {
        LogFormat::Json => fmt::layer().with_target(false).json().boxed(),
        LogFormat::Pretty => fmt::layer().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
}
