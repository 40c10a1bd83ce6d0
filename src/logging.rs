//! Logging setup for handler processes.
//!
//! Everything goes to stderr, which the Lambda runtime forwards to
//! CloudWatch. CloudWatch stamps each line itself and does not render
//! colours, so both are off unless asked for. `RUST_LOG` wins over the
//! configured level.

use serde::Deserialize;
use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    /// Nothing is emitted.
    Off,
}

impl LogLevel {
    /// The `EnvFilter` directive for this level.
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Off => "off",
        }
    }
}

impl From<u8> for LogLevel {
    /// Maps a `-v` count: none is info, one is debug, more is trace.
    fn from(verbosity: u8) -> Self {
        match verbosity {
            0 => LogLevel::Info,
            1 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per event, for CloudWatch Logs Insights queries.
    Json,
}

/// How the global subscriber renders events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub timestamps: bool,
    pub ansi: bool,
    /// Module path of the emitting code.
    pub target: bool,
    pub thread_ids: bool,
    /// File and line of the emitting code.
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
            timestamps: false,
            ansi: false,
            target: true,
            thread_ids: false,
            source_location: false,
        }
    }
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Settings for running outside Lambda, on a terminal.
    pub fn local(self) -> Self {
        Self {
            timestamps: true,
            ansi: true,
            ..self
        }
    }

    pub fn with_thread_ids(mut self, enabled: bool) -> Self {
        self.thread_ids = enabled;
        self
    }

    pub fn with_source_location(mut self, enabled: bool) -> Self {
        self.source_location = enabled;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.directive()))
    }

    fn layer<S>(&self) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(self.ansi)
            .with_target(self.target)
            .with_thread_ids(self.thread_ids)
            .with_file(self.source_location)
            .with_line_number(self.source_location);

        match (self.format, self.timestamps) {
            (LogFormat::Text, true) => layer.boxed(),
            (LogFormat::Text, false) => layer.without_time().boxed(),
            (LogFormat::Json, true) => layer.json().with_current_span(true).boxed(),
            (LogFormat::Json, false) => layer.json().with_current_span(true).without_time().boxed(),
        }
    }
}

/// Installs the global subscriber.
///
/// A warm container runs its init path again on every cold-start retry, so
/// this never panics: it returns `false` and keeps the existing subscriber
/// if one is already set.
///
/// ```no_run
/// use async_lambda_harness::logging::{init_logging, LogFormat, LogLevel, LoggingConfig};
///
/// init_logging(
///     LoggingConfig::new()
///         .with_level(LogLevel::Debug)
///         .with_format(LogFormat::Json),
/// );
/// ```
pub fn init_logging(config: LoggingConfig) -> bool {
    tracing_subscriber::registry()
        .with(config.layer())
        .with(config.filter())
        .try_init()
        .is_ok()
}
