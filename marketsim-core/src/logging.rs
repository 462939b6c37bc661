//! tracing-subscriber setup for the service process

use std::str::FromStr;
use tracing::Span;
use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::{LoggingConfig, ServiceConfig};

/// Transport crates log below `warn` only when asked for through `RUST_LOG`
const QUIET_DEPENDENCIES: &str = "h2=warn,hyper=warn,hyper_util=warn,tower=warn,redis=warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(anyhow::anyhow!("Invalid log format: {other}")),
        }
    }
}

/// Install the global subscriber
///
/// `RUST_LOG` replaces the computed filter when set. JSON output carries the
/// current span, so events inside [`service_span`] are tagged with the
/// service identity.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = build_filter(&config.level)?;
    let format: LogFormat = config.format.parse()?;
    let to_file = config.file_path.is_some();
    let writer = log_writer(config.file_path.as_deref())?;

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true)
                    .with_writer(writer),
            )
            .try_init()?,
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_line_number(true)
                    .with_file(false)
                    .with_ansi(!to_file)
                    .with_writer(writer),
            )
            .try_init()?,
    }

    Ok(())
}

/// Root span naming this process: service, instance, version and environment
pub fn service_span(service: &ServiceConfig) -> Span {
    tracing::info_span!(
        "service",
        service = %service.name,
        instance = %service.instance_name,
        version = %service.version,
        environment = %service.environment,
    )
}

fn build_filter(level: &str) -> anyhow::Result<EnvFilter> {
    let level = parse_log_level(level)?;
    Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directives(level))))
}

fn filter_directives(level: &str) -> String {
    format!("{level},{QUIET_DEPENDENCIES}")
}

fn log_writer(file_path: Option<&str>) -> anyhow::Result<BoxMakeWriter> {
    match file_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            Ok(BoxMakeWriter::new(std::sync::Arc::new(file)))
        }
        None => Ok(BoxMakeWriter::new(std::io::stdout)),
    }
}

/// Canonical filter level for a configured level name
fn parse_log_level(level: &str) -> anyhow::Result<&'static str> {
    match level.to_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" | "warning" => Ok("warn"),
        "error" => Ok("error"),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("DEBUG").unwrap(), "debug");
        assert_eq!(parse_log_level("warning").unwrap(), "warn");
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_log_format() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_dependencies_stay_quiet_at_debug() {
        let directives = filter_directives("debug");
        assert!(directives.starts_with("debug,"));
        assert!(directives.contains("h2=warn"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn test_bad_settings_rejected_before_init() {
        let config = LoggingConfig {
            level: "loud".to_string(),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_err());

        let config = LoggingConfig {
            format: "xml".to_string(),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_err());
    }

    #[test]
    fn test_file_writer_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marketsim.log");
        assert!(log_writer(path.to_str()).is_ok());
        assert!(path.exists());
    }
}
