//! Processor trait definition
//!
//! A processor is the work function bound to one task kind. The executor
//! hands it a borrowed connection and the task input for one attempt.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use phototask_core::TaskKind;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::persistence::{FailureKind, TaskFailure};
use crate::pool::Connector;

/// `error_type` marking a failure caused by the request itself
pub const INVALID_INPUT: &str = "invalid_input";

/// Error type for processing failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether this error is retryable
    ///
    /// Non-retryable errors fail the task immediately.
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl ProcessingError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable error
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// The request can never succeed as submitted
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::fatal(message).with_type(INVALID_INPUT)
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_invalid_input(&self) -> bool {
        self.error_type.as_deref() == Some(INVALID_INPUT)
    }

    /// Structured failure stored on the task
    pub fn to_failure(&self) -> TaskFailure {
        let kind = if self.is_invalid_input() {
            FailureKind::InvalidInput
        } else {
            FailureKind::Processing
        };
        let failure = TaskFailure::new(kind, self.message.clone(), self.retryable);
        match &self.details {
            Some(details) => failure.with_details(details.clone()),
            None => failure,
        }
    }
}

impl std::fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProcessingError {}

/// What a processor knows about the attempt it is running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessContext {
    pub task_id: Uuid,
    pub kind: TaskKind,
    /// Current attempt number (1-based)
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Work function for one task kind
///
/// # Example
///
/// ```ignore
/// struct Thumbnail;
///
/// #[async_trait]
/// impl<C: Connector> Processor<C> for Thumbnail {
///     async fn process(
///         &self,
///         ctx: &ProcessContext,
///         _conn: &mut C::Connection,
///         input: &serde_json::Value,
///     ) -> Result<serde_json::Value, ProcessingError> {
///         Ok(json!({ "task_id": ctx.task_id }))
///     }
/// }
/// ```
#[async_trait]
pub trait Processor<C: Connector>: Send + Sync + 'static {
    /// Run one attempt
    ///
    /// Return `ProcessingError::retryable()` for transient failures and
    /// `ProcessingError::fatal()` or `invalid_input()` for permanent ones.
    async fn process(
        &self,
        ctx: &ProcessContext,
        conn: &mut C::Connection,
        input: &serde_json::Value,
    ) -> Result<serde_json::Value, ProcessingError>;

    /// Reject bad input at submission time
    fn validate(&self, _input: &serde_json::Value) -> Result<(), ProcessingError> {
        Ok(())
    }
}

/// Processor built from a closure that does not need the connection
pub struct FnProcessor<F, C> {
    f: F,
    _connector: PhantomData<fn() -> C>,
}

impl<F, C> FnProcessor<F, C> {
    pub fn new<Fut>(f: F) -> Self
    where
        F: Fn(ProcessContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, ProcessingError>> + Send + 'static,
    {
        Self {
            f,
            _connector: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, C> Processor<C> for FnProcessor<F, C>
where
    C: Connector,
    F: Fn(ProcessContext, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, ProcessingError>> + Send + 'static,
{
    async fn process(
        &self,
        ctx: &ProcessContext,
        _conn: &mut C::Connection,
        input: &serde_json::Value,
    ) -> Result<serde_json::Value, ProcessingError> {
        (self.f)(ctx.clone(), input.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retryable_error() {
        let error = ProcessingError::retryable("upstream busy");
        assert!(error.retryable);
        assert_eq!(error.to_string(), "upstream busy");
        assert_eq!(error.to_failure().kind, FailureKind::Processing);
    }

    #[test]
    fn test_invalid_input_maps_to_failure_kind() {
        let error = ProcessingError::invalid_input("length must be positive")
            .with_details(json!({"field": "length"}));

        let failure = error.to_failure();
        assert_eq!(failure.kind, FailureKind::InvalidInput);
        assert!(!failure.retriable);
        assert_eq!(failure.details, Some(json!({"field": "length"})));
    }

    #[test]
    fn test_error_serialization() {
        let error = ProcessingError::fatal("bad image").with_type("decode");
        let json = serde_json::to_string(&error).unwrap();
        let parsed: ProcessingError = serde_json::from_str(&json).unwrap();
        assert_eq!(error, parsed);
    }
}
