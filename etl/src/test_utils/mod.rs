//! Test fixtures for exercising the pipeline without external services.
//!
//! Provides an in-memory [`crate::source::TableSource`], a fault-injecting wrapper
//! around any [`ObjectStorage`], and tracing setup for tests.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Once};

use bytes::Bytes;
use futures::StreamExt;
use postgres::schema::{ColumnSchema, TableName, TableSchema};
use tokio::sync::Mutex;
use tokio_postgres::types::Type;

use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::source::{RowStream, TableSource};
use crate::storage::{CompletedPart, ObjectStorage};

/// Initializes tracing output for tests, once per process.
///
/// Verbosity is controlled through `RUST_LOG`; without it, tests stay quiet.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Builds a [`TableSchema`] for tests, in the `public` source schema.
pub fn test_table_schema(name: &str, columns: Vec<ColumnSchema>) -> TableSchema {
    TableSchema::new(TableName::new("public".to_string(), name.to_string()), columns)
}

/// Builds the two-column `id bigint, name text` schema most tests use.
pub fn id_name_schema(table: &str) -> TableSchema {
    test_table_schema(
        table,
        vec![
            ColumnSchema::new("id".to_string(), Type::INT8, -1, false),
            ColumnSchema::new("name".to_string(), Type::TEXT, -1, true),
        ],
    )
}

/// An in-memory [`TableSource`] with preloaded schemas and row chunks.
///
/// Chunks are replayed in order on every export, mimicking the arbitrary chunk
/// boundaries of a streaming copy. A table can be marked to fail mid-stream, after
/// its preloaded chunks have been yielded.
#[derive(Default)]
pub struct StaticTableSource {
    tables: Vec<(TableSchema, Vec<Bytes>)>,
    failing_tables: HashSet<String>,
}

impl StaticTableSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table with its row chunks.
    pub fn add_table(&mut self, table_schema: TableSchema, chunks: Vec<&[u8]>) {
        let chunks = chunks
            .into_iter()
            .map(Bytes::copy_from_slice)
            .collect::<Vec<_>>();
        self.tables.push((table_schema, chunks));
    }

    /// Makes the table's export stream fail after yielding its chunks.
    pub fn fail_stream_for(&mut self, table: &str) {
        self.failing_tables.insert(table.to_string());
    }
}

impl TableSource for StaticTableSource {
    fn name() -> &'static str {
        "static"
    }

    async fn table_schemas(&self) -> EtlResult<Vec<TableSchema>> {
        Ok(self
            .tables
            .iter()
            .map(|(table_schema, _)| table_schema.clone())
            .collect())
    }

    async fn row_stream(&self, table_schema: &TableSchema) -> EtlResult<RowStream> {
        let (_, chunks) = self
            .tables
            .iter()
            .find(|(candidate, _)| candidate.name == table_schema.name)
            .ok_or_else(|| {
                etl_error!(
                    ErrorKind::SourceSchemaError,
                    "Unknown table requested from static source",
                    table_schema.name.to_string()
                )
            })?;

        let mut items = chunks
            .iter()
            .cloned()
            .map(Ok)
            .collect::<Vec<EtlResult<Bytes>>>();

        if self.failing_tables.contains(&table_schema.name.name) {
            items.push(Err(etl_error!(
                ErrorKind::SourceIoError,
                "Export stream interrupted",
                format!("simulated stream failure for {}", table_schema.name)
            )));
        }

        Ok(futures::stream::iter(items).boxed())
    }
}

/// Fault plan for [`FaultyObjectStore`].
#[derive(Debug, Default)]
struct Faults {
    part_failures: u32,
    fail_complete: bool,
}

/// Wraps an [`ObjectStorage`] and injects failures into the multipart protocol.
///
/// Injected part failures are consumed one per call, so a retrying caller succeeds
/// once the budgeted failures are spent.
#[derive(Clone)]
pub struct FaultyObjectStore<S> {
    inner: S,
    faults: Arc<Mutex<Faults>>,
}

impl<S> FaultyObjectStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    /// Makes the next `count` part uploads fail.
    pub async fn fail_next_part_uploads(&self, count: u32) {
        let mut faults = self.faults.lock().await;
        faults.part_failures = count;
    }

    /// Makes every completion attempt fail.
    pub async fn fail_completions(&self) {
        let mut faults = self.faults.lock().await;
        faults.fail_complete = true;
    }
}

impl<S> ObjectStorage for FaultyObjectStore<S>
where
    S: ObjectStorage + Sync,
{
    fn name() -> &'static str {
        "faulty"
    }

    async fn delete_prefix(&self, prefix: &str) -> EtlResult<()> {
        self.inner.delete_prefix(prefix).await
    }

    async fn create_upload(&self, key: &str) -> EtlResult<String> {
        self.inner.create_upload(key).await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        spool_path: &Path,
    ) -> EtlResult<CompletedPart> {
        {
            let mut faults = self.faults.lock().await;
            if faults.part_failures > 0 {
                faults.part_failures -= 1;
                return Err(etl_error!(
                    ErrorKind::UploadPartFailed,
                    "Part upload failed",
                    format!("injected failure for part {part_number} of {key}")
                ));
            }
        }

        self.inner
            .upload_part(key, upload_id, part_number, spool_path)
            .await
    }

    async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> EtlResult<()> {
        {
            let faults = self.faults.lock().await;
            if faults.fail_complete {
                return Err(etl_error!(
                    ErrorKind::UploadSessionFailed,
                    "Completion failed",
                    format!("injected completion failure for {key}")
                ));
            }
        }

        self.inner.complete_upload(key, upload_id, parts).await
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) -> EtlResult<()> {
        self.inner.abort_upload(key, upload_id).await
    }
}
