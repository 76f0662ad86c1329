//! Tracing setup for the relaymq binary.
//!
//! One subscriber is installed per process, before any listener starts.
//! Library crates only emit events. Filtering is per workspace crate so a
//! noisy layer (usually `relaymq_protocol` at TRACE) can be turned up alone:
//!
//! ```ignore
//! use relaymq_core::tracing::{init_tracing, TracingConfig};
//! use tracing::Level;
//!
//! let config = TracingConfig::broker().with_target("relaymq_protocol", Level::TRACE);
//! init_tracing(config)?;
//! ```
//!
//! `RUST_LOG`, when set, replaces the generated directives entirely.

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

/// Crates whose events follow the configured level. Everything else,
/// tokio included, is held at WARN.
pub const WORKSPACE_TARGETS: [&str; 5] = [
    "relaymq",
    "relaymq_cli",
    "relaymq_core",
    "relaymq_protocol",
    "relaymq_server",
];

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to set global tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("invalid log directive {directives:?}: {source}")]
    Directive {
        directives: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
}

/// Line format of the fmt layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Compact,
    /// One JSON object per line, span fields included.
    Json,
}

/// How the broker logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// Level for every crate in [`WORKSPACE_TARGETS`].
    pub level: Level,
    pub format: LogFormat,
    /// Per-target levels, applied after the workspace defaults.
    pub overrides: Vec<(String, Level)>,
    /// Emit a close event with timing for each instrumented span
    /// (packet dispatch, STOMP frame handling, connection tasks).
    pub span_timing: bool,
    pub source_location: bool,
    pub timestamps: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::broker()
    }
}

impl TracingConfig {
    /// Long-running broker: INFO, compact, timestamped.
    #[must_use]
    pub fn broker() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            overrides: Vec::new(),
            span_timing: false,
            source_location: false,
            timestamps: true,
        }
    }

    /// Interactive debugging: DEBUG with span timing and source locations.
    /// Frame bytes stay quiet unless `relaymq_protocol` is raised.
    #[must_use]
    pub fn debug() -> Self {
        Self {
            level: Level::DEBUG,
            span_timing: true,
            source_location: true,
            timestamps: false,
            ..Self::broker()
        }
    }

    /// Log shipping: JSON lines with span timing.
    #[must_use]
    pub fn json() -> Self {
        Self {
            format: LogFormat::Json,
            span_timing: true,
            ..Self::broker()
        }
    }

    #[must_use]
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Sets the level of one target, e.g. `relaymq_server::stomp`.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>, level: Level) -> Self {
        let target = target.into();
        self.overrides.retain(|(t, _)| *t != target);
        self.overrides.push((target, level));
        self
    }

    /// Filter directives used when `RUST_LOG` is unset.
    pub fn directives(&self) -> String {
        let level = self.level.as_str().to_ascii_lowercase();
        let mut directives = vec!["warn".to_string()];
        directives.extend(WORKSPACE_TARGETS.iter().map(|t| format!("{t}={level}")));
        directives.extend(
            self.overrides
                .iter()
                .map(|(t, l)| format!("{t}={}", l.as_str().to_ascii_lowercase())),
        );
        directives.join(",")
    }

    fn filter(&self) -> Result<EnvFilter, TracingError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        let directives = self.directives();
        EnvFilter::try_new(&directives).map_err(|source| TracingError::Directive {
            directives,
            source,
        })
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_timing {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Fails if a subscriber is already installed or an override is not a
/// valid directive.
pub fn init_tracing(config: TracingConfig) -> Result<(), TracingError> {
    let filter = config.filter()?;

    let layer = match config.format {
        LogFormat::Compact => {
            let layer = fmt::layer()
                .compact()
                .with_file(config.source_location)
                .with_line_number(config.source_location)
                .with_span_events(config.span_events());
            if config.timestamps {
                layer.boxed()
            } else {
                layer.without_time().boxed()
            }
        }
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .with_span_events(config.span_events())
            .boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(layer);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
