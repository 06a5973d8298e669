use serde::{Deserialize, Serialize};

use crate::load::Config;
use crate::shared::{PgConnectionConfig, S3StorageConfig, ValidationError};

/// Default uncompressed-size threshold for one export segment: 5 GiB.
///
/// Chosen to stay under the warehouse bulk-loader's practical per-object limit while
/// amortizing per-part upload overhead.
pub const DEFAULT_MAX_SEGMENT_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// Smallest accepted segment rotation threshold: 5 MiB.
///
/// S3 rejects completion of a multipart upload whose non-final parts are smaller
/// than 5 MiB, so thresholds that could rotate out such parts are refused up front.
pub const MIN_SEGMENT_BYTES: u64 = 5 * 1024 * 1024;

/// Default number of times a single failed part upload is retried before the whole
/// upload session is aborted.
const DEFAULT_UPLOAD_PART_RETRIES: u32 = 2;

fn default_max_segment_bytes() -> u64 {
    DEFAULT_MAX_SEGMENT_BYTES
}

fn default_upload_part_retries() -> u32 {
    DEFAULT_UPLOAD_PART_RETRIES
}

fn default_truncate_columns() -> bool {
    true
}

/// Configuration for the warehouse side of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WarehouseConfig {
    /// Connection parameters for the warehouse (Postgres wire protocol).
    pub connection: PgConnectionConfig,
    /// Schema in which destination tables are created.
    pub schema: String,
    /// Whether the bulk load tolerates over-wide values by truncating them instead of
    /// failing the whole load.
    #[serde(default = "default_truncate_columns")]
    pub truncate_columns: bool,
}

/// Top-level configuration for one replication run.
///
/// Constructed explicitly and passed into the pipeline; components never read
/// ambient process state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PipelineConfig {
    /// Connection parameters for the source database.
    pub source: PgConnectionConfig,
    /// Source schema whose tables are replicated.
    pub source_schema: String,
    /// Warehouse configuration.
    pub warehouse: WarehouseConfig,
    /// Object storage configuration.
    pub storage: S3StorageConfig,
    /// Tables excluded from this run, by bare table name.
    #[serde(default)]
    pub excluded_tables: Vec<String>,
    /// Optional suffix stripped from source table names to derive destination names.
    #[serde(default)]
    pub strip_table_suffix: Option<String>,
    /// Uncompressed bytes after which the current export segment is rotated.
    #[serde(default = "default_max_segment_bytes")]
    pub max_segment_bytes: u64,
    /// Retries for a single failed part upload before the session is aborted.
    #[serde(default = "default_upload_part_retries")]
    pub upload_part_retries: u32,
}

impl PipelineConfig {
    /// Validates the configuration before a run starts.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.source.tls.validate()?;
        self.warehouse.connection.tls.validate()?;
        self.storage.validate()?;

        if self.source_schema.is_empty() {
            return Err(ValidationError::EmptyField("source_schema"));
        }

        if self.warehouse.schema.is_empty() {
            return Err(ValidationError::EmptyField("warehouse.schema"));
        }

        if self.max_segment_bytes < MIN_SEGMENT_BYTES {
            return Err(ValidationError::SegmentThresholdTooSmall(MIN_SEGMENT_BYTES));
        }

        Ok(())
    }
}

impl Config for PipelineConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &["excluded_tables"];
}
