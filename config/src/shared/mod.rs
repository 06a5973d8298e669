//! Shared configuration types consumed by the pipeline and the binary.

mod connection;
mod pipeline;
mod storage;

pub use connection::{IntoConnectOptions, PgConnectionConfig, TlsConfig, ValidationError};
pub use pipeline::{PipelineConfig, WarehouseConfig, DEFAULT_MAX_SEGMENT_BYTES, MIN_SEGMENT_BYTES};
pub use storage::S3StorageConfig;
