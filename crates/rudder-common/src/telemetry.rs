//! Logging initialization
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and a JSON or
//! plain-text formatter. `RUST_LOG` wins over the configured defaults. Both
//! formats write to stderr.

use thiserror::Error;
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,rudder=debug,kube=info,tower=warn,hyper=warn";

/// Filter used when debug output is requested
pub const DEBUG_FILTER: &str = "debug,rudder=trace,kube=debug,tower=warn,hyper=warn";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Raise the default filter to debug level
    pub debug: bool,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

/// Initialize the global subscriber
///
/// # Example
///
/// ```ignore
/// use rudder_common::telemetry::{init_telemetry, TelemetryConfig};
///
/// init_telemetry(TelemetryConfig { debug: true, ..Default::default() })?;
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(config.debug)));

    // stdout belongs to command output
    subscriber(&config, env_filter, std::io::stderr)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })
}

fn subscriber<W>(
    config: &TelemetryConfig,
    filter: EnvFilter,
    writer: W,
) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        Box::new(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false)
                    .with_writer(writer),
            ),
        )
    } else {
        Box::new(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(writer),
            ),
        )
    }
}

fn default_filter(debug: bool) -> &'static str {
    if debug {
        DEBUG_FILTER
    } else {
        DEFAULT_FILTER
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Capture {
        type Writer = Capture;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn both_formats_use_the_given_writer() {
        for json in [false, true] {
            let capture = Capture::default();
            let config = TelemetryConfig { debug: false, json };
            let sub = subscriber(&config, EnvFilter::new("info"), capture.clone());
            tracing::subscriber::with_default(sub, || tracing::info!(release = "web", "stored"));

            let text = capture.text();
            assert!(text.contains("stored"), "json={}: {}", json, text);
            assert_eq!(text.trim_start().starts_with('{'), json, "{}", text);
        }
    }

    #[test]
    fn default_filters_parse() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
        assert!(EnvFilter::try_new(DEBUG_FILTER).is_ok());
        assert_eq!(default_filter(true), DEBUG_FILTER);
        assert_eq!(default_filter(false), DEFAULT_FILTER);
    }

    #[test]
    fn second_init_reports_error() {
        let _ = init_telemetry(TelemetryConfig::default());
        assert!(init_telemetry(TelemetryConfig::default()).is_err());
    }
}
