//! Log output for the msnp crates.
//!
//! The engine only emits `tracing` events; binaries decide where they go by
//! calling [`init_tracing`] once at startup:
//!
//! ```ignore
//! use msnp_core::tracing::{init_tracing, TracingConfig};
//!
//! init_tracing(TracingConfig::cli_debug()).expect("logging already set up");
//! ```
//!
//! Every frame read or written is logged at TRACE under the
//! `msnp_engine::transport` target. [`TracingConfig::with_frame_dump`] turns
//! that on without raising the level of anything else.

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, prelude::*};

/// Targets covered by the generated filter.
const CRATE_TARGETS: &[&str] = &["msnp_core", "msnp_protocol", "msnp_engine", "msnp_client"];

/// Target carrying frame dumps.
const FRAME_TARGET: &str = "msnp_engine::transport";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("a global tracing subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
}

/// How log lines are rendered on stderr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TracingOutputFormat {
    /// Multi-line, for reading by eye
    Pretty,
    #[default]
    Compact,
    /// One JSON object per line
    Json,
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Level for the msnp crates when neither `env_filter` nor `RUST_LOG`
    /// says otherwise
    pub default_level: Level,
    pub output_format: TracingOutputFormat,
    /// Source file and line of each event
    pub include_location: bool,
    /// Module path of each event
    pub include_target: bool,
    /// Log span open/close
    pub include_span_events: bool,
    /// TRACE every frame on the wire
    pub frame_dump: bool,
    /// Full filter directive; wins over everything else
    pub env_filter: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_level: Level::WARN,
            output_format: TracingOutputFormat::Compact,
            include_location: false,
            include_target: false,
            include_span_events: false,
            frame_dump: false,
            env_filter: None,
        }
    }
}

impl TracingConfig {
    /// What `msnp --debug` uses.
    #[must_use]
    pub fn cli_debug() -> Self {
        Self {
            default_level: Level::DEBUG,
            include_location: true,
            include_target: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: TracingOutputFormat) -> Self {
        self.output_format = format;
        self
    }

    #[must_use]
    pub fn with_frame_dump(mut self, enabled: bool) -> Self {
        self.frame_dump = enabled;
        self
    }

    #[must_use]
    pub fn with_env_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Directive used when neither `env_filter` nor `RUST_LOG` is set:
    /// `default_level` for each msnp crate, other crates silent.
    pub fn default_directive(&self) -> String {
        let level = self.default_level.as_str().to_ascii_lowercase();
        let mut directive = CRATE_TARGETS
            .iter()
            .map(|target| format!("{target}={level}"))
            .collect::<Vec<_>>();
        if self.frame_dump {
            directive.push(format!("{FRAME_TARGET}=trace"));
        }
        directive.join(",")
    }

    fn filter(&self) -> Result<EnvFilter, TracingError> {
        if let Some(directive) = &self.env_filter {
            return Ok(EnvFilter::try_new(directive)?);
        }
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => Ok(EnvFilter::try_new(self.default_directive())?),
        }
    }

    fn layer(&self) -> BoxedLayer {
        let spans = if self.include_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_file(self.include_location)
            .with_line_number(self.include_location)
            .with_target(self.include_target)
            .with_span_events(spans);
        match self.output_format {
            TracingOutputFormat::Pretty => layer.pretty().boxed(),
            TracingOutputFormat::Compact => layer.compact().boxed(),
            TracingOutputFormat::Json => layer.json().boxed(),
        }
    }
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Fails if a subscriber is already installed or the filter directive does
/// not parse.
pub fn init_tracing(config: TracingConfig) -> Result<(), TracingError> {
    let filter = config.filter()?;
    let subscriber = tracing_subscriber::registry().with(config.layer().with_filter(filter));
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_by_default() {
        let config = TracingConfig::default();
        assert_eq!(config.default_level, Level::WARN);
        assert_eq!(config.output_format, TracingOutputFormat::Compact);
        assert!(!config.frame_dump);
    }

    #[test]
    fn debug_preset_shows_locations() {
        let config = TracingConfig::cli_debug();
        assert_eq!(config.default_level, Level::DEBUG);
        assert!(config.include_location && config.include_target);
    }

    #[test]
    fn directive_lists_each_crate() {
        let directive = TracingConfig::default().with_level(Level::INFO).default_directive();
        assert_eq!(
            directive,
            "msnp_core=info,msnp_protocol=info,msnp_engine=info,msnp_client=info"
        );
        assert!(EnvFilter::try_new(&directive).is_ok());
    }

    #[test]
    fn frame_dump_only_raises_transport() {
        let directive = TracingConfig::default().with_frame_dump(true).default_directive();
        assert!(directive.starts_with("msnp_core=warn,"));
        assert!(directive.ends_with(",msnp_engine::transport=trace"));
    }

    #[test]
    fn explicit_filter_wins() {
        let config = TracingConfig::default().with_env_filter("msnp_engine=trace");
        assert!(config.filter().is_ok());

        let config = TracingConfig::default().with_env_filter("msnp_engine=[");
        assert!(matches!(config.filter(), Err(TracingError::Filter(_))));
    }
}
