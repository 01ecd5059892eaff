// Phototask core
//
// Shared vocabulary for the task runtime: what kinds of image work exist,
// what their request payloads look like, and the interfaces to the object
// store and image library that do the real I/O.
//
// Note: This crate has NO dependency on storage or the pool. It is plain types
// and traits so that anything (HTTP layer, tests, the runtime) can use it.

pub mod kind;
pub mod request;
pub mod storage;
pub mod telemetry;

pub use kind::{TaskKind, UnknownTaskKind};
pub use request::{
    CarouselRequest, ComplianceLabelRequest, Dimension, DimensionRequest, DimensionSet,
    ImageRequest, ProductInfoRequest, RequestError, Unit,
};
pub use storage::{ImageOperation, ObjectStorage, OperationError, RenderedImage, StorageError};
pub use telemetry::{init_telemetry, LogFormat, TelemetryConfig, TelemetryGuard};
