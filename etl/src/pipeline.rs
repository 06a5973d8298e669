//! The pipeline driver.
//!
//! [`Pipeline`] wires a [`TableSource`], an [`ObjectStorage`], and a [`Destination`]
//! together and replicates every discovered table through the export, upload, and
//! swap stages. Tables are processed sequentially; a failed table is reported and
//! skipped so the remaining tables still replicate.

use std::sync::Arc;
use std::time::Instant;

use config::shared::PipelineConfig;
use futures::StreamExt;
use postgres::schema::TableSchema;
use tracing::{error, info, warn};

use crate::destination::Destination;
use crate::error::{ErrorKind, EtlResult};
use crate::segment::{ExportSegment, SegmentWriter};
use crate::shutdown::{ShutdownRx, ShutdownTx, create_shutdown};
use crate::source::TableSource;
use crate::storage::ObjectStorage;
use crate::upload::{MultipartUploader, UploadSession};

/// Aggregate counters for one table's export.
#[derive(Debug, Default)]
struct ExportStats {
    segments: u64,
    uncompressed_bytes: u64,
    compressed_bytes: u64,
}

impl ExportStats {
    fn record(&mut self, segment: &ExportSegment) {
        self.segments += 1;
        self.uncompressed_bytes += segment.uncompressed_bytes();
        self.compressed_bytes += segment.compressed_bytes();
    }
}

/// Drives one replication run over every table of the source schema.
pub struct Pipeline<Src, Sto, Dst> {
    config: Arc<PipelineConfig>,
    source: Src,
    storage: Sto,
    destination: Dst,
    shutdown_tx: ShutdownTx,
    shutdown_rx: ShutdownRx,
}

impl<Src, Sto, Dst> Pipeline<Src, Sto, Dst>
where
    Src: TableSource,
    Sto: ObjectStorage + Sync,
    Dst: Destination,
{
    pub fn new(config: Arc<PipelineConfig>, source: Src, storage: Sto, destination: Dst) -> Self {
        let (shutdown_tx, shutdown_rx) = create_shutdown();

        Self {
            config,
            source,
            storage,
            destination,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Returns a handle that requests a cooperative stop of the run.
    ///
    /// The request takes effect between tables: the table in flight finishes its
    /// export, upload, and swap before the run stops.
    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Replicates every non-excluded table of the source schema.
    ///
    /// Tables are processed one at a time. A table that fails is logged and skipped;
    /// all failures are aggregated into the returned error so a single bad table
    /// never blocks the rest of the run.
    pub async fn replicate_all(&self) -> EtlResult<()> {
        let table_schemas = self.source.table_schemas().await?;

        let mut errors = Vec::new();
        let mut replicated = 0usize;
        for table_schema in &table_schemas {
            if *self.shutdown_rx.borrow() {
                warn!("shutdown requested, stopping before the next table");
                break;
            }

            if self.is_excluded(table_schema) {
                info!(table = %table_schema.name, "skipping excluded table");
                continue;
            }

            match self.replicate_table(table_schema).await {
                Ok(()) => replicated += 1,
                Err(err) => {
                    error!(table = %table_schema.name, error = %err, "table replication failed");
                    errors.push(err);
                }
            }
        }

        info!(
            replicated,
            failed = errors.len(),
            "replication run finished"
        );

        if !errors.is_empty() {
            return Err(errors.into());
        }

        Ok(())
    }

    fn is_excluded(&self, table_schema: &TableSchema) -> bool {
        self.config
            .excluded_tables
            .iter()
            .any(|excluded| excluded == &table_schema.name.name)
    }

    /// Replicates one table end to end: export, upload, swap.
    async fn replicate_table(&self, table_schema: &TableSchema) -> EtlResult<()> {
        let target_name = table_schema.target_name(self.config.strip_table_suffix.as_deref());
        let started_at = Instant::now();

        info!(table = %table_schema.name, target = target_name, "replicating table");

        self.destination
            .create_table_if_missing(&target_name, table_schema)
            .await?;

        let object_key = self.export_table(table_schema, &target_name).await?;

        self.destination
            .load_table(&target_name, table_schema, &object_key)
            .await?;

        info!(
            table = %table_schema.name,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "table replicated"
        );

        Ok(())
    }

    /// Exports one table into a finalized object, returning its key.
    ///
    /// The upload session opened here reaches exactly one terminal state: completed
    /// on success, aborted on any export or upload failure.
    async fn export_table(
        &self,
        table_schema: &TableSchema,
        target_name: &str,
    ) -> EtlResult<String> {
        let uploader = MultipartUploader::new(&self.storage);
        let mut session = uploader.begin(target_name).await?;
        let object_key = session.key().to_string();

        match self.stream_segments(table_schema, &uploader, &mut session).await {
            Ok(stats) => {
                uploader.complete(session).await?;

                info!(
                    table = %table_schema.name,
                    object_key,
                    segments = stats.segments,
                    uncompressed_bytes = stats.uncompressed_bytes,
                    compressed_bytes = stats.compressed_bytes,
                    "table export finished"
                );

                Ok(object_key)
            }
            Err(err) => {
                if let Err(abort_err) = uploader.abort(session).await {
                    warn!(
                        table = %table_schema.name,
                        error = %abort_err,
                        "failed to abort upload session"
                    );
                }

                Err(err)
            }
        }
    }

    /// Streams the table's rows through the segment writer, uploading each segment
    /// as it rotates out.
    async fn stream_segments(
        &self,
        table_schema: &TableSchema,
        uploader: &MultipartUploader<'_, Sto>,
        session: &mut UploadSession,
    ) -> EtlResult<ExportStats> {
        let mut stream = self.source.row_stream(table_schema).await?;
        let mut writer = SegmentWriter::new(self.config.max_segment_bytes)?;
        let mut stats = ExportStats::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;

            if let Some(segment) = writer.write(&chunk)? {
                stats.record(&segment);
                self.upload_with_retry(uploader, session, &segment).await?;
            }
        }

        if let Some(segment) = writer.finish()? {
            stats.record(&segment);
            self.upload_with_retry(uploader, session, &segment).await?;
        }

        Ok(stats)
    }

    /// Uploads one segment, retrying transient part failures.
    ///
    /// Only [`ErrorKind::UploadPartFailed`] is retried; the spool outlives the failed
    /// attempt so a retry re-reads the same bytes. Any other error, or exhausting the
    /// configured retries, escalates to aborting the session.
    async fn upload_with_retry(
        &self,
        uploader: &MultipartUploader<'_, Sto>,
        session: &mut UploadSession,
        segment: &ExportSegment,
    ) -> EtlResult<()> {
        let mut attempt = 0u32;

        loop {
            match uploader.upload_segment(session, segment).await {
                Ok(()) => return Ok(()),
                Err(err)
                    if err.kind() == ErrorKind::UploadPartFailed
                        && attempt < self.config.upload_part_retries =>
                {
                    attempt += 1;
                    warn!(
                        part_number = segment.part_number(),
                        attempt,
                        error = %err,
                        "retrying failed part upload"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }
}
