//! Structured logging initialization.
//!
//! Configures the tracing subscriber for structured logging output.
//! The RUST_LOG environment variable takes precedence over configuration file settings.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Initialize the logging subsystem.
///
/// Does nothing if a global subscriber is already installed (as happens when
/// several tests in one binary initialize logging).
///
/// # Example
///
/// ```ignore
/// use grpc_server::config::LoggingConfig;
/// use grpc_server::logging;
///
/// logging::init(&LoggingConfig::default());
/// tracing::info!("server starting");
/// ```
pub fn init(config: &LoggingConfig) {
    let _ = try_init(config);
}

/// Initialize the logging subsystem, reporting an already-installed
/// subscriber as an error.
pub fn try_init(config: &LoggingConfig) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(fmt_layer(config))
        .with(filter(config))
        .try_init()
}

fn filter(config: &LoggingConfig) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    }
}

fn fmt_layer(config: &LoggingConfig) -> BoxedLayer {
    let base = fmt::layer()
        .with_target(config.target)
        .with_thread_names(config.thread_names);

    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => base.with_ansi(true).boxed(),
        (LogFormat::Pretty, false) => base.with_ansi(true).without_time().boxed(),
        (LogFormat::Json, true) => base.json().boxed(),
        (LogFormat::Json, false) => base.json().without_time().boxed(),
        (LogFormat::Compact, true) => base.compact().with_ansi(true).boxed(),
        (LogFormat::Compact, false) => base.compact().with_ansi(true).without_time().boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        let config = LoggingConfig {
            format: LogFormat::Compact,
            timestamps: false,
            ..LoggingConfig::default()
        };
        init(&config);
        init(&config);
        assert!(try_init(&config).is_err());
    }
}
