// Telemetry Module
//
// Structured logging setup shared by everything that embeds the task runtime:
// - Environment-driven configuration (RUST_LOG / LOG_LEVEL / LOG_FORMAT)
// - Human-readable or JSON output from the same subscriber stack

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

// ============================================================================
// Telemetry Configuration
// ============================================================================

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable single-line output
    Pretty,
    /// One JSON object per line
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Configuration for logging
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to startup logs
    pub service_name: String,
    /// Log filter (e.g., "info", "debug", "phototask_durable=debug")
    pub log_filter: Option<String>,
    /// Output format
    pub format: LogFormat,
    /// Whether to include the event target (module path)
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "phototask".to_string(),
            log_filter: None,
            format: LogFormat::Pretty,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `SERVICE_NAME`: Service name (default: "phototask")
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    /// - `LOG_FORMAT`: "json" for JSON lines, anything else for pretty output
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            service_name: lookup("SERVICE_NAME").unwrap_or_else(|| "phototask".to_string()),
            log_filter: lookup("RUST_LOG").or_else(|| lookup("LOG_LEVEL")),
            format: lookup("LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or(LogFormat::Pretty),
            with_target: true,
        }
    }

    /// Set the log filter
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    /// Set the output format
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Returned by [`init_telemetry`]; keep it alive for the lifetime of the process
#[derive(Debug)]
pub struct TelemetryGuard {
    /// Whether this call installed the global subscriber
    pub installed: bool,
}

/// Initialize the global tracing subscriber
///
/// Calling this more than once is harmless: later calls leave the first
/// subscriber in place and report `installed == false`.
///
/// # Example
///
/// ```ignore
/// use phototask_core::telemetry::{init_telemetry, TelemetryConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let _guard = init_telemetry(TelemetryConfig::from_env());
///     // ... your application code
/// }
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let filter = config
        .log_filter
        .as_ref()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let fmt_layer = match config.format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(config.with_target)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(config.with_target)
            .with_filter(filter)
            .boxed(),
    };

    let installed = tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(service = %config.service_name, format = ?config.format, "telemetry initialized");
    }

    TelemetryGuard { installed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "phototask");
        assert!(config.log_filter.is_none());
        assert_eq!(config.format, LogFormat::Pretty);
    }

    #[test]
    fn test_from_lookup_prefers_rust_log() {
        let vars: HashMap<&str, &str> = [
            ("RUST_LOG", "phototask_durable=debug"),
            ("LOG_LEVEL", "warn"),
            ("LOG_FORMAT", "JSON"),
        ]
        .into_iter()
        .collect();

        let config = TelemetryConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(
            config.log_filter.as_deref(),
            Some("phototask_durable=debug")
        );
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn test_from_lookup_falls_back_to_log_level() {
        let config = TelemetryConfig::from_lookup(|k| (k == "LOG_LEVEL").then(|| "warn".into()));
        assert_eq!(config.log_filter.as_deref(), Some("warn"));
        assert_eq!(config.format, LogFormat::Pretty);
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let _first = init_telemetry(TelemetryConfig::default());
        let second = init_telemetry(TelemetryConfig::default().with_log_filter("debug"));
        assert!(!second.installed);
    }
}
