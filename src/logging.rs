//! Structured logging initialization.
//!
//! The RUST_LOG environment variable takes precedence over the configured
//! level. Output goes to stdout unless a log file is configured.

use crate::config::{LogFormat, LoggingConfig};
use crate::error::DumpError;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Initialize the logging subsystem.
///
/// # Example
///
/// ```ignore
/// use cachedump::config::LoggingConfig;
/// use cachedump::logging;
///
/// logging::init(&LoggingConfig::default())?;
/// tracing::info!("dump starting");
/// ```
pub fn init(config: &LoggingConfig) -> Result<(), DumpError> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    };

    let (writer, ansi) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| DumpError::file(path, e))?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stdout), true),
    };

    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(config.target)
        .with_thread_names(config.thread_names);

    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(layer.with_ansi(ansi));
            subscriber.init();
        }
        (LogFormat::Pretty, false) => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(layer.with_ansi(ansi).without_time());
            subscriber.init();
        }
        (LogFormat::Json, true) => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(layer.json());
            subscriber.init();
        }
        (LogFormat::Json, false) => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(layer.json().without_time());
            subscriber.init();
        }
        (LogFormat::Compact, true) => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(layer.compact().with_ansi(ansi));
            subscriber.init();
        }
        (LogFormat::Compact, false) => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(layer.compact().with_ansi(ansi).without_time());
            subscriber.init();
        }
    }

    Ok(())
}
