//! Multipart upload coordination for one table's export.
//!
//! [`MultipartUploader`] owns the session lifecycle against an [`ObjectStorage`]:
//! every session opened by [`MultipartUploader::begin`] must reach exactly one of
//! [`MultipartUploader::complete`] or [`MultipartUploader::abort`] before the
//! table's pipeline returns.

use tracing::{debug, info, warn};

use crate::bail;
use crate::error::{ErrorKind, EtlResult};
use crate::segment::ExportSegment;
use crate::storage::{CompletedPart, ObjectStorage};

/// Key prefix under which export objects are stored.
const EXPORT_KEY_PREFIX: &str = "export";

/// Extension encoding the gzip compression format of export objects.
const GZIP_EXTENSION: &str = "gz";

/// Returns the deterministic object key for a destination table.
///
/// The key is table-scoped and stable across runs, so a rerun overwrites the prior
/// run's output.
pub fn object_key(target_name: &str) -> String {
    format!("{EXPORT_KEY_PREFIX}/{target_name}.{GZIP_EXTENSION}")
}

/// One open multipart upload session.
///
/// Tracks the remote key, the store-issued session identifier, and the checksums of
/// every part completed so far.
#[derive(Debug)]
pub struct UploadSession {
    key: String,
    upload_id: String,
    completed_parts: Vec<CompletedPart>,
}

impl UploadSession {
    /// Returns the remote object key of this session.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the number of parts completed so far.
    pub fn completed_part_count(&self) -> usize {
        self.completed_parts.len()
    }
}

/// Coordinates one table's multipart upload against an object store.
pub struct MultipartUploader<'a, S> {
    storage: &'a S,
}

impl<'a, S> MultipartUploader<'a, S>
where
    S: ObjectStorage + Sync,
{
    pub fn new(storage: &'a S) -> Self {
        Self { storage }
    }

    /// Opens a session for the given destination table.
    ///
    /// Any pre-existing object at the table's key is deleted first, which is what
    /// makes a rerun idempotent.
    pub async fn begin(&self, target_name: &str) -> EtlResult<UploadSession> {
        let key = object_key(target_name);

        self.storage.delete_prefix(&key).await?;
        let upload_id = self.storage.create_upload(&key).await?;

        info!(key, "opened multipart upload session");

        Ok(UploadSession {
            key,
            upload_id,
            completed_parts: Vec::new(),
        })
    }

    /// Uploads one segment as the numbered part matching its sequence number.
    ///
    /// Not retried internally; the caller decides whether a transient transport
    /// failure is retried or escalated to [`MultipartUploader::abort`]. The spool
    /// stays intact on failure so a retry can re-read it.
    pub async fn upload_segment(
        &self,
        session: &mut UploadSession,
        segment: &ExportSegment,
    ) -> EtlResult<()> {
        if let Some(last) = session.completed_parts.last()
            && segment.part_number() <= last.part_number
        {
            bail!(
                ErrorKind::InvalidState,
                "Segment uploaded out of order",
                format!(
                    "part {} after part {}",
                    segment.part_number(),
                    last.part_number
                )
            );
        }

        let part = self
            .storage
            .upload_part(
                &session.key,
                &session.upload_id,
                segment.part_number(),
                segment.spool_path(),
            )
            .await?;

        debug!(
            key = session.key,
            part_number = segment.part_number(),
            compressed_bytes = segment.compressed_bytes(),
            "uploaded segment"
        );

        session.completed_parts.push(part);

        Ok(())
    }

    /// Finalizes the object from every part completed in this session.
    ///
    /// Parts are referenced in increasing part-number order; on success the object
    /// is durably readable at the session's key. A failed completion aborts the
    /// session before the error surfaces, so the session still ends exactly once.
    pub async fn complete(&self, session: UploadSession) -> EtlResult<()> {
        let mut parts = session.completed_parts;
        parts.sort_by_key(|part| part.part_number);

        if let Err(err) = self
            .storage
            .complete_upload(&session.key, &session.upload_id, &parts)
            .await
        {
            if let Err(abort_err) = self
                .storage
                .abort_upload(&session.key, &session.upload_id)
                .await
            {
                warn!(
                    key = session.key,
                    error = %abort_err,
                    "failed to abort upload session after completion failure"
                );
            }

            return Err(err);
        }

        info!(key = session.key, parts = parts.len(), "completed multipart upload session");

        Ok(())
    }

    /// Aborts the session, discarding all uploaded parts.
    ///
    /// Called on every failure path after [`MultipartUploader::begin`], so no
    /// orphaned partial object remains at the key.
    pub async fn abort(&self, session: UploadSession) -> EtlResult<()> {
        self.storage
            .abort_upload(&session.key, &session.upload_id)
            .await?;

        info!(key = session.key, "aborted multipart upload session");

        Ok(())
    }
}
