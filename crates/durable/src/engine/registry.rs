//! Processor registry
//!
//! Maps each task kind to the processor that runs it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use phototask_core::TaskKind;

use super::processor::{ProcessingError, Processor};
use crate::pool::Connector;

/// Registry of processors by task kind
pub struct ProcessorRegistry<C: Connector> {
    processors: HashMap<TaskKind, Arc<dyn Processor<C>>>,
}

impl<C: Connector> Default for ProcessorRegistry<C> {
    fn default() -> Self {
        Self {
            processors: HashMap::new(),
        }
    }
}

impl<C: Connector> ProcessorRegistry<C> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the processor for a kind, replacing any previous one
    pub fn register(&mut self, kind: TaskKind, processor: impl Processor<C>) -> &mut Self {
        self.processors.insert(kind, Arc::new(processor));
        self
    }

    /// Builder form of [`register`](Self::register)
    pub fn with(mut self, kind: TaskKind, processor: impl Processor<C>) -> Self {
        self.register(kind, processor);
        self
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn Processor<C>>> {
        self.processors.get(&kind).cloned()
    }

    pub fn contains(&self, kind: TaskKind) -> bool {
        self.processors.contains_key(&kind)
    }

    /// Registered kinds, in declaration order
    pub fn kinds(&self) -> Vec<TaskKind> {
        TaskKind::ALL
            .into_iter()
            .filter(|k| self.processors.contains_key(k))
            .collect()
    }

    /// Run the kind's submission-time validation
    ///
    /// Returns `None` when no processor is registered for the kind.
    pub fn validate(
        &self,
        kind: TaskKind,
        input: &serde_json::Value,
    ) -> Option<Result<(), ProcessingError>> {
        self.processors.get(&kind).map(|p| p.validate(input))
    }
}

impl<C: Connector> fmt::Debug for ProcessorRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
