//! Structured logging for the geoflake binary
//!
//! Feature output goes to stdout, so console logs are written to stderr.
//! File logs rotate daily under the configured directory.

use crate::config::LoggingConfig;
use tracing::Subscriber;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE: &str = "geoflake.log";

/// Log format configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format for development
    Pretty,
    /// JSON format for production (structured logging)
    Json,
    /// Single-line format, the default for interactive use
    Compact,
}

impl LogFormat {
    pub fn parse(name: &str) -> Self {
        match name {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Compact,
        }
    }
}

/// Log output configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    /// Log to stderr only
    Console,
    /// Log to file only
    File,
    /// Log to both stderr and file
    Both,
}

impl LogOutput {
    pub fn parse(name: &str) -> Self {
        match name {
            "file" => LogOutput::File,
            "both" => LogOutput::Both,
            _ => LogOutput::Console,
        }
    }
}

fn env_filter(level: &str) -> EnvFilter {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    // duckdb's own tracing is rarely useful here
    match "duckdb=warn".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

fn console_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_writer(std::io::stderr)
            .with_thread_ids(true)
            .with_target(true)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .boxed(),
    }
}

fn file_layer<S>(format: LogFormat, directory: &str) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    std::fs::create_dir_all(directory).ok();
    let appender = RollingFileAppender::new(Rotation::DAILY, directory, LOG_FILE);
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(appender)
            .with_ansi(false)
            .boxed(),
        _ => fmt::layer().with_writer(appender).with_ansi(false).boxed(),
    }
}

/// Initialize logging from the (already env-overridden) logging config.
///
/// ```bash
/// # Debug a scan with readable output
/// RUST_LOG=geoflake_engine=debug geoflake scan --connection dev --table places
///
/// # JSON to rotating files only
/// LOG_FORMAT=json LOG_OUTPUT=file LOG_DIR=/var/log/geoflake geoflake scan ...
/// ```
pub fn init(config: &LoggingConfig) {
    let format = LogFormat::parse(&config.format);
    let output = LogOutput::parse(&config.output);
    let filter = env_filter(&config.level);

    match output {
        LogOutput::Console => tracing_subscriber::registry()
            .with(filter)
            .with(console_layer(format))
            .init(),
        LogOutput::File => tracing_subscriber::registry()
            .with(filter)
            .with(file_layer(format, &config.directory))
            .init(),
        LogOutput::Both => tracing_subscriber::registry()
            .with(filter)
            .with(console_layer(format))
            .with(file_layer(format, &config.directory))
            .init(),
    }

    tracing::debug!(
        level = %config.level,
        format = ?format,
        output = ?output,
        directory = %config.directory,
        "logging initialized"
    );
}
