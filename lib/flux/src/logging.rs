//! Structured logging, built on `slog` + `sloggers` (terminal sink by default, file sink when
//! configured). Re-exports the macros so callers only need `use flux::logging;`.

pub use slog::{crit, debug, error, info, o, trace, warn, Logger};

use sloggers::types::Severity;
use sloggers::Build;

/// Logger sink selection, loaded from the gateway's config file alongside the other
/// environment/CLI fields (spec §6); a bare terminal sink is used when no config is supplied.
#[derive(Clone, serde_derive::Serialize, serde_derive::Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LoggingConfig {
    Terminal { level: String },
    File { level: String, path: String },
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig::Terminal {
            level: "debug".to_string(),
        }
    }
}

fn parse_severity(level: &str) -> Severity {
    match level {
        "critical" => Severity::Critical,
        "error" => Severity::Error,
        "warning" | "warn" => Severity::Warning,
        "info" => Severity::Info,
        "trace" => Severity::Trace,
        _ => Severity::Debug,
    }
}

/// Builds the root logger for the process. Call once at startup.
pub fn init() -> Logger {
    build(&LoggingConfig::default())
}

/// Builds a root logger from an explicit config (loaded via `serdeconv::from_toml_file`
/// elsewhere, per the config struct spec §3 describes).
pub fn build(config: &LoggingConfig) -> Logger {
    match config {
        LoggingConfig::Terminal { level } => {
            let mut builder = sloggers::terminal::TerminalLoggerBuilder::new();
            builder.level(parse_severity(level));
            builder.destination(sloggers::terminal::Destination::Stderr);
            builder.build().expect("terminal logger should build")
        }
        LoggingConfig::File { level, path } => {
            let mut builder = sloggers::file::FileLoggerBuilder::new(path);
            builder.level(parse_severity(level));
            builder.build().expect("file logger should build")
        }
    }
}

/// Loads a `LoggingConfig` from a TOML file path, falling back to the terminal default on any
/// parse/read failure (logging must never be the reason the gateway fails to start).
pub fn from_config_file(path: &str) -> LoggingConfig {
    serdeconv::from_toml_file(path).unwrap_or_default()
}
