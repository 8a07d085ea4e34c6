//! Logging for the `vigil` binary.
//!
//! Libraries only emit `tracing` events; the binary decides where they go.
//! Settings are layered: the `logging:` section of the node file, then
//! `VIGIL_LOG_FORMAT` and `VIGIL_LOG_LEVEL` (or `RUST_LOG`), then `-v` flags.
//!
//! ```yaml
//! logging:
//!   format: json        # json | pretty | compact | auto
//!   filter: "info,vigil_cluster=debug"
//!   location: false
//!   thread_ids: false
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::io::IsTerminal;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Output format of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event, for log shippers.
    Json,
    /// Multi-line human-readable output.
    Pretty,
    /// Single-line human-readable output.
    Compact,
    /// Pretty on a terminal, JSON otherwise.
    #[default]
    Auto,
}

impl LogFormat {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            "compact" => Some(Self::Compact),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }

    fn resolve(self) -> Self {
        match self {
            Self::Auto if std::io::stdout().is_terminal() => Self::Pretty,
            Self::Auto => Self::Json,
            other => other,
        }
    }
}

/// The `logging:` section of a node file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// `EnvFilter` directives.
    pub filter: String,
    /// Print file and line of each event.
    pub location: bool,
    /// Print the emitting thread.
    pub thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Auto,
            filter: "info".to_string(),
            location: false,
            thread_ids: false,
        }
    }
}

impl LoggingConfig {
    /// Apply the process environment on top of these settings.
    pub fn with_env(self) -> Self {
        self.with_vars(|name| std::env::var(name).ok())
    }

    fn with_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        // An unknown format keeps the file's choice.
        if let Some(format) = var("VIGIL_LOG_FORMAT").and_then(|s| LogFormat::parse(&s)) {
            self.format = format;
        }
        if let Some(filter) = var("VIGIL_LOG_LEVEL").or_else(|| var("RUST_LOG")) {
            self.filter = filter;
        }
        self
    }

    /// Apply `-v` flags. Zero leaves the settings alone.
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        match verbosity {
            0 => {}
            1 => self.filter = "debug,openraft=info".to_string(),
            2 => self.filter = "debug".to_string(),
            _ => {
                self.filter = "trace".to_string();
                self.location = true;
                self.thread_ids = true;
            }
        }
        self
    }
}

/// Install the global subscriber.
///
/// An unparseable filter falls back to `info`. Fails if a subscriber is
/// already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let output: Box<dyn Layer<Registry> + Send + Sync> = match config.format.resolve() {
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_file(config.location)
            .with_line_number(config.location)
            .with_thread_ids(config.thread_ids)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(config.location)
            .with_line_number(config.location)
            .with_thread_ids(config.thread_ids)
            .boxed(),
        LogFormat::Compact | LogFormat::Auto => fmt::layer()
            .compact()
            .with_file(config.location)
            .with_line_number(config.location)
            .with_thread_ids(config.thread_ids)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .try_init()
        .context("Failed to install the log subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn section_reads_from_yaml() {
        let config: LoggingConfig =
            serde_yaml::from_str("format: json\nfilter: \"warn,vigil_cluster=debug\"\n")
                .expect("valid section");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.filter, "warn,vigil_cluster=debug");
        assert!(!config.location);
    }

    #[test]
    fn environment_overrides_the_file() {
        let file = LoggingConfig {
            format: LogFormat::Json,
            filter: "warn".into(),
            ..Default::default()
        };
        let config = file.with_vars(vars(&[
            ("VIGIL_LOG_FORMAT", "Compact"),
            ("RUST_LOG", "debug"),
        ]));
        assert_eq!(config.format, LogFormat::Compact);
        assert_eq!(config.filter, "debug");
    }

    #[test]
    fn vigil_level_wins_over_rust_log() {
        let config = LoggingConfig::default().with_vars(vars(&[
            ("VIGIL_LOG_LEVEL", "info,openraft=warn"),
            ("RUST_LOG", "trace"),
        ]));
        assert_eq!(config.filter, "info,openraft=warn");
    }

    #[test]
    fn unknown_format_keeps_the_file_value() {
        let file = LoggingConfig {
            format: LogFormat::Pretty,
            ..Default::default()
        };
        let config = file.with_vars(vars(&[("VIGIL_LOG_FORMAT", "xml")]));
        assert_eq!(config.format, LogFormat::Pretty);
    }

    #[test]
    fn verbosity_raises_the_filter() {
        let base = LoggingConfig::default();
        assert_eq!(base.clone().with_verbosity(0), base);
        assert_eq!(base.clone().with_verbosity(1).filter, "debug,openraft=info");

        let trace = base.with_verbosity(3);
        assert_eq!(trace.filter, "trace");
        assert!(trace.location && trace.thread_ids);
    }
}
