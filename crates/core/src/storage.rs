//! Interfaces to the collaborators that do the actual I/O
//!
//! The task runtime never talks to an object store or an image library
//! directly. It goes through these traits, and classifies their errors into
//! retryable and permanent failures with [`StorageError::is_transient`] and
//! [`OperationError::is_transient`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::kind::TaskKind;

/// Object storage failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Backend unreachable or returned a server-side error
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Request did not complete in time
    #[error("storage request timed out: {0}")]
    Timeout(String),

    /// Object does not exist
    #[error("object not found: {0}")]
    NotFound(String),

    /// Backend refused the request (permissions, size, bad key)
    #[error("storage rejected request: {0}")]
    Rejected(String),
}

impl StorageError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Object storage client
#[async_trait]
pub trait ObjectStorage: Send + Sync + 'static {
    /// Store `bytes` under `key` and return its public URL
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<String, StorageError>;

    /// Fetch the object behind `url`
    async fn download(&self, url: &str) -> Result<Vec<u8>, StorageError>;

    /// Remove the object behind `url`
    async fn delete(&self, _url: &str) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Output of an image operation
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedImage {
    /// Encoded image (PNG unless `extension` says otherwise)
    pub bytes: Vec<u8>,
    /// File extension without the dot
    pub extension: String,
    /// Extra facts the renderer wants recorded in the task result
    pub metadata: Value,
}

impl RenderedImage {
    /// PNG output with no metadata
    pub fn png(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            extension: "png".to_string(),
            metadata: Value::Null,
        }
    }

    /// Attach metadata
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Image operation failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    /// Source is not a usable image (wrong mode, too small, corrupt)
    #[error("invalid source image: {0}")]
    InvalidImage(String),

    /// Renderer ran out of a resource that may free up
    #[error("renderer busy: {0}")]
    Busy(String),

    /// Anything else the renderer reports
    #[error("render failed: {0}")]
    Failed(String),
}

impl OperationError {
    /// Whether retrying the same render may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

/// One image-editing operation (crop, annotate, composite, ...)
#[async_trait]
pub trait ImageOperation: Send + Sync + 'static {
    /// Kind this operation serves
    fn kind(&self) -> TaskKind;

    /// Produce the output image from the source bytes and render parameters
    async fn render(&self, source: Vec<u8>, params: &Value)
        -> Result<RenderedImage, OperationError>;
}

#[async_trait]
impl<T: ImageOperation + ?Sized> ImageOperation for Arc<T> {
    fn kind(&self) -> TaskKind {
        (**self).kind()
    }

    async fn render(&self, source: Vec<u8>, params: &Value)
        -> Result<RenderedImage, OperationError> {
        (**self).render(source, params).await
    }
}
