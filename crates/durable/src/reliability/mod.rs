//! Reliability patterns for task execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with fixed, linear or exponential backoff

mod retry;

pub use retry::{Backoff, RetryPolicy};
