//! Log output setup.
//!
//! The engine emits `tracing` events and spans; nothing is printed until a subscriber
//! is installed, either by the embedding application or through [`init`].

use ripple_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Subscriber settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, e.g. `info` or `ripple_engine=debug,info`.
    pub level: String,
    /// Emit one JSON object per event.
    pub json: bool,
    /// Include span enter/exit events.
    pub spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            spans: false,
        }
    }
}

impl LoggingConfig {
    /// Debug output for local runs.
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            json: false,
            spans: true,
        }
    }

    /// JSON output at `info`.
    pub fn production() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            spans: false,
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Builds the filter: `RUST_LOG` when set, the configured level otherwise.
    pub fn filter(&self) -> Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level)
                .map_err(|e| Error::config(format!("log level {:?}: {e}", self.level))),
        }
    }
}

/// Installs a global `fmt` subscriber.
///
/// Returns `false` when a subscriber was already installed, which leaves it in place.
pub fn init(config: &LoggingConfig) -> Result<bool> {
    let filter = config.filter()?;
    let events = if config.spans {
        fmt::format::FmtSpan::NEW | fmt::format::FmtSpan::CLOSE
    } else {
        fmt::format::FmtSpan::NONE
    };
    let layer = if config.json {
        fmt::layer().json().with_span_events(events).boxed()
    } else {
        fmt::layer().with_span_events(events).boxed()
    };
    Ok(tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .is_ok())
}
