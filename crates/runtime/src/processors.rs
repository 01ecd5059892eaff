// Storage-backed processors
//
// A StorageProcessor runs one image operation end to end:
// decode + validate the request, download the source object, render, upload
// the output under `processed_images/`, and return its URL as the task result.
// Storage and renderer errors are classified into retryable and permanent
// failures so the executor knows whether to try again.

use std::sync::Arc;

use async_trait::async_trait;
use phototask_core::{
    ImageOperation, ImageRequest, ObjectStorage, OperationError, RequestError, StorageError,
    TaskKind,
};
use phototask_durable::engine::{ProcessContext, ProcessingError, Processor, ProcessorRegistry};
use phototask_durable::pool::Connector;
use serde_json::{json, Value};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Prefix of every uploaded output object
pub const OUTPUT_PREFIX: &str = "processed_images";

/// Object key for a task's rendered output
pub fn output_key(kind: TaskKind, task_id: Uuid, extension: &str) -> String {
    format!(
        "{OUTPUT_PREFIX}/{}_{task_id}.{extension}",
        kind.object_prefix()
    )
}

/// Processor that runs an [`ImageOperation`] against [`ObjectStorage`]
pub struct StorageProcessor<S, O> {
    storage: Arc<S>,
    operation: O,
}

impl<S: ObjectStorage, O: ImageOperation> StorageProcessor<S, O> {
    pub fn new(storage: Arc<S>, operation: O) -> Self {
        Self { storage, operation }
    }

    pub fn kind(&self) -> TaskKind {
        self.operation.kind()
    }
}

#[async_trait]
impl<C, S, O> Processor<C> for StorageProcessor<S, O>
where
    C: Connector,
    S: ObjectStorage,
    O: ImageOperation,
{
    #[instrument(skip_all, fields(task_id = %ctx.task_id, kind = %ctx.kind, attempt = ctx.attempt))]
    async fn process(
        &self,
        ctx: &ProcessContext,
        _conn: &mut C::Connection,
        input: &Value,
    ) -> Result<Value, ProcessingError> {
        let request = ImageRequest::parse(ctx.kind, input).map_err(request_error)?;

        let source = self
            .storage
            .download(request.source_url())
            .await
            .map_err(storage_error)?;
        debug!(bytes = source.len(), "Downloaded source");

        let rendered = self
            .operation
            .render(source, &request.render_params())
            .await
            .map_err(operation_error)?;

        let key = output_key(ctx.kind, ctx.task_id, &rendered.extension);
        let url = self
            .storage
            .upload(&key, rendered.bytes)
            .await
            .map_err(storage_error)?;
        debug!(%key, "Uploaded output");

        let mut result = json!({
            "output_url": url,
            "object_key": key,
        });
        if !rendered.metadata.is_null() {
            result["metadata"] = rendered.metadata;
        }
        Ok(result)
    }

    fn validate(&self, input: &Value) -> Result<(), ProcessingError> {
        ImageRequest::parse(self.operation.kind(), input)
            .map(|_| ())
            .map_err(request_error)
    }
}

/// Register one storage-backed processor per operation
pub fn register_operations<C, S>(
    registry: &mut ProcessorRegistry<C>,
    storage: Arc<S>,
    operations: impl IntoIterator<Item = Arc<dyn ImageOperation>>,
) where
    C: Connector,
    S: ObjectStorage,
{
    for operation in operations {
        let kind = operation.kind();
        registry.register(kind, StorageProcessor::new(Arc::clone(&storage), operation));
    }
}

fn request_error(e: RequestError) -> ProcessingError {
    ProcessingError::invalid_input(e.to_string())
}

fn storage_error(e: StorageError) -> ProcessingError {
    let error = if e.is_transient() {
        ProcessingError::retryable(e.to_string())
    } else {
        ProcessingError::fatal(e.to_string())
    };
    error.with_type("storage")
}

fn operation_error(e: OperationError) -> ProcessingError {
    match e {
        OperationError::InvalidImage(_) => ProcessingError::invalid_input(e.to_string()),
        OperationError::Busy(_) => ProcessingError::retryable(e.to_string()).with_type("render"),
        OperationError::Failed(_) => ProcessingError::fatal(e.to_string()).with_type("render"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use phototask_core::RenderedImage;
    use phototask_durable::pool::{MemoryConnection, MemoryConnector};
    use std::collections::HashMap;

    #[derive(Default)]
    struct Bucket {
        objects: Mutex<HashMap<String, Vec<u8>>>,
        download_error: Mutex<Option<StorageError>>,
    }

    #[async_trait]
    impl ObjectStorage for Bucket {
        async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
            self.objects.lock().insert(key.to_string(), bytes);
            Ok(format!("https://bucket.example.com/{key}"))
        }

        async fn download(&self, url: &str) -> Result<Vec<u8>, StorageError> {
            if let Some(e) = self.download_error.lock().clone() {
                return Err(e);
            }
            Ok(url.as_bytes().to_vec())
        }
    }

    struct Annotate(Option<OperationError>);

    #[async_trait]
    impl ImageOperation for Annotate {
        fn kind(&self) -> TaskKind {
            TaskKind::Dimension
        }

        async fn render(
            &self,
            source: Vec<u8>,
            params: &Value,
        ) -> Result<RenderedImage, OperationError> {
            if let Some(e) = &self.0 {
                return Err(e.clone());
            }
            Ok(RenderedImage::png(source).with_metadata(params.clone()))
        }
    }

    fn ctx() -> ProcessContext {
        ProcessContext {
            task_id: Uuid::now_v7(),
            kind: TaskKind::Dimension,
            attempt: 1,
            max_attempts: 3,
        }
    }

    fn input() -> Value {
        json!({"image_url": "https://cdn.example.com/p.png", "length": 10.5, "height": 15.2})
    }

    async fn run(
        processor: &StorageProcessor<Bucket, Annotate>,
        ctx: &ProcessContext,
        input: &Value,
    ) -> Result<Value, ProcessingError> {
        let mut conn = MemoryConnection { serial: 1 };
        Processor::<MemoryConnector>::process(processor, ctx, &mut conn, input).await
    }

    #[test]
    fn test_output_key() {
        let id = Uuid::nil();
        assert_eq!(
            output_key(TaskKind::ProductInfo, id, "png"),
            format!("processed_images/product_info_{id}.png")
        );
    }

    #[tokio::test]
    async fn test_downloads_renders_and_uploads() {
        let bucket = Arc::new(Bucket::default());
        let processor = StorageProcessor::new(bucket.clone(), Annotate(None));
        let ctx = ctx();

        let result = run(&processor, &ctx, &input()).await.unwrap();

        let key = output_key(TaskKind::Dimension, ctx.task_id, "png");
        assert_eq!(result["object_key"], json!(key));
        assert_eq!(
            result["output_url"],
            json!(format!("https://bucket.example.com/{key}"))
        );
        assert_eq!(result["metadata"]["dimensions"]["length"]["inch"], json!(4.13));
        assert!(bucket.objects.lock().contains_key(&key));
    }

    #[tokio::test]
    async fn test_transient_storage_error_is_retryable() {
        let bucket = Arc::new(Bucket::default());
        *bucket.download_error.lock() = Some(StorageError::Unavailable("503".into()));
        let processor = StorageProcessor::new(bucket, Annotate(None));

        let err = run(&processor, &ctx(), &input()).await.unwrap_err();
        assert!(err.retryable);
        assert_eq!(err.error_type.as_deref(), Some("storage"));
    }

    #[tokio::test]
    async fn test_missing_source_is_fatal() {
        let bucket = Arc::new(Bucket::default());
        *bucket.download_error.lock() = Some(StorageError::NotFound("p.png".into()));
        let processor = StorageProcessor::new(bucket, Annotate(None));

        let err = run(&processor, &ctx(), &input()).await.unwrap_err();
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_operation_errors_are_classified() {
        let bucket = Arc::new(Bucket::default());

        let busy = StorageProcessor::new(
            bucket.clone(),
            Annotate(Some(OperationError::Busy("no workers".into()))),
        );
        assert!(run(&busy, &ctx(), &input()).await.unwrap_err().retryable);

        let bad = StorageProcessor::new(
            bucket,
            Annotate(Some(OperationError::InvalidImage("no alpha channel".into()))),
        );
        let err = run(&bad, &ctx(), &input()).await.unwrap_err();
        assert!(err.is_invalid_input());
        assert!(!err.retryable);
    }

    #[test]
    fn test_validate_rejects_bad_payload() {
        let processor = StorageProcessor::new(Arc::new(Bucket::default()), Annotate(None));
        let err = Processor::<MemoryConnector>::validate(
            &processor,
            &json!({"image_url": "file:///tmp/x.png", "length": 1.0, "height": 1.0}),
        )
        .unwrap_err();
        assert!(err.is_invalid_input());

        assert!(Processor::<MemoryConnector>::validate(&processor, &input()).is_ok());
    }

    #[test]
    fn test_register_operations_by_kind() {
        let mut registry = ProcessorRegistry::<MemoryConnector>::new();
        let operations: Vec<Arc<dyn ImageOperation>> = vec![Arc::new(Annotate(None))];
        register_operations(&mut registry, Arc::new(Bucket::default()), operations);

        assert_eq!(registry.kinds(), vec![TaskKind::Dimension]);
    }
}
