//! Log subscriber setup shared by the CLI and C hosts.
//!
//! Events go to stderr so stdout carries only program results.

use std::env;
use std::ffi::c_int;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt as tracing_fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Explicit filter directives. Falls back to `RUST_LOG`, then to
    /// `default_directive`.
    pub directives: Option<String>,
    pub default_directive: String,
    pub format: LogFormat,
    pub ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            format: LogFormat::Pretty,
            ansi: true,
        }
    }
}

impl TelemetryConfig {
    pub fn with_verbosity(mut self, verbose: u8) -> Self {
        self.default_directive = match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
        .to_string();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        if format == LogFormat::Json {
            self.ansi = false;
        }
        self
    }

    fn resolve_filter(&self) -> Result<EnvFilter, TelemetryError> {
        if let Some(directives) = &self.directives {
            return EnvFilter::try_new(directives)
                .map_err(|err| TelemetryError::InvalidFilter(err.to_string()));
        }
        match env::var(EnvFilter::DEFAULT_ENV) {
            Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives)
                .map_err(|err| TelemetryError::InvalidFilter(err.to_string())),
            _ => Ok(EnvFilter::new(&self.default_directive)),
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log directive: {0}")]
    InvalidFilter(String),

    #[error("failed to install global log subscriber")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
}

fn fmt_layer(config: &TelemetryConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    match config.format {
        LogFormat::Pretty => Box::new(
            tracing_fmt::layer()
                .pretty()
                .with_ansi(config.ansi)
                .with_writer(io::stderr),
        ),
        LogFormat::Compact => Box::new(
            tracing_fmt::layer()
                .compact()
                .with_ansi(config.ansi)
                .with_writer(io::stderr),
        ),
        LogFormat::Json => Box::new(
            tracing_fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(io::stderr),
        ),
    }
}

/// Installs the process-wide subscriber.
pub fn init(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = config.resolve_filter()?;
    Registry::default()
        .with(fmt_layer(config))
        .with(filter)
        .try_init()?;
    Ok(())
}

/// Lets a C host see the ownership events. Returns `0`, or `-1` if a
/// subscriber is already installed or `RUST_LOG` is invalid.
#[unsafe(no_mangle)]
pub extern "C" fn ffibridge_init_logging(verbose: c_int) -> c_int {
    let verbose = u8::try_from(verbose.max(0)).unwrap_or(u8::MAX);
    let config = TelemetryConfig::default()
        .with_verbosity(verbose)
        .with_format(LogFormat::Compact);
    match init(&config) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}
