// Error types for runtime assembly

use thiserror::Error;

/// Result type alias for configuration loading
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors raised while reading or checking configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    /// A required variable is not set
    #[error("missing required setting {0}")]
    Missing(&'static str),

    /// Settings parse individually but contradict each other
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

impl ConfigError {
    pub(crate) fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}
