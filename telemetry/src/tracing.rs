use std::io;
use std::sync::Once;

use config::Environment;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Filter used when `RUST_LOG` is not set.
const DEFAULT_LOG_FILTER: &str = "info";

/// Environment variable enabling log output in tests.
const ENABLE_TRACING_ENV_NAME: &str = "ENABLE_TRACING";

static INIT_TEST_TRACING: Once = Once::new();

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to determine the runtime environment: {0}")]
    Environment(#[from] io::Error),

    #[error("failed to bridge `log` records into tracing: {0}")]
    LogTracer(String),

    #[error("failed to install the global tracing subscriber: {0}")]
    Subscriber(#[from] ::tracing::subscriber::SetGlobalDefaultError),
}

/// Flushes buffered log lines when dropped.
///
/// Keep it alive until the service exits, otherwise the tail of the log may be lost.
#[must_use = "dropping the flusher stops the background log writer"]
pub struct LogFlusher {
    _guard: WorkerGuard,
}

/// Installs the global tracing subscriber for a service.
///
/// Output goes to stdout through a non-blocking writer, as JSON in [`Environment::Prod`] and
/// human readable otherwise. `RUST_LOG` controls filtering and defaults to `info`. Records
/// emitted through the `log` crate are forwarded as well.
pub fn init_tracing(app_name: &str) -> Result<LogFlusher, TracingError> {
    let environment = Environment::load()?;
    let (writer, guard) = tracing_appender::non_blocking(io::stdout());

    tracing_log::LogTracer::init().map_err(|err| TracingError::LogTracer(err.to_string()))?;

    if environment.is_prod() {
        let layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(writer);
        let subscriber = Registry::default().with(env_filter()).with(layer);
        ::tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let layer = fmt::layer().with_target(true).with_writer(writer);
        let subscriber = Registry::default().with(env_filter()).with(layer);
        ::tracing::subscriber::set_global_default(subscriber)?;
    }

    ::tracing::info!(app_name, %environment, "tracing initialized");

    Ok(LogFlusher { _guard: guard })
}

/// Installs a test subscriber once per process when `ENABLE_TRACING` is set.
///
/// Safe to call at the start of every test.
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        if std::env::var(ENABLE_TRACING_ENV_NAME).is_err() {
            return;
        }

        // Another test harness may already have installed a subscriber.
        let _ = fmt()
            .with_env_filter(env_filter())
            .with_test_writer()
            .try_init();
    });
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_init_is_idempotent() {
        init_test_tracing();
        init_test_tracing();
    }
}
