//! Task execution engine
//!
//! The engine module provides the [`TaskExecutor`], which runs one task's
//! processor against pooled connections, and the [`ProcessorRegistry`] that
//! maps task kinds to processors.

mod executor;
mod processor;
mod registry;

pub use executor::{ExecutionOutcome, ExecutorConfig, ExecutorError, TaskExecutor};
pub use processor::{FnProcessor, ProcessContext, ProcessingError, Processor, INVALID_INPUT};
pub use registry::ProcessorRegistry;
