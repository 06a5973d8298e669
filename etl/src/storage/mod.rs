//! Object storage abstraction used to stage exported table data.
//!
//! The pipeline talks to storage through [`ObjectStorage`], which exposes the
//! multipart-upload primitives the coordinator needs. [`s3::S3ObjectStore`] is the
//! production implementation; [`memory::MemoryObjectStore`] backs the tests.

use std::future::Future;
use std::path::Path;

use crate::error::EtlResult;

pub mod memory;
pub mod s3;

/// A part that has been uploaded and acknowledged by the store.
///
/// The checksum is the store-assigned content checksum (an ETag for S3) and must be
/// echoed back verbatim when the upload is completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based part number matching the segment's sequence number.
    pub part_number: u32,
    /// Store-assigned content checksum for the part.
    pub checksum: String,
}

/// Trait for object stores that can assemble one durable object from numbered parts.
///
/// Implementations are not expected to retry internally; transient part failures are
/// retried by the caller, and anything else escalates to [`ObjectStorage::abort_upload`].
pub trait ObjectStorage {
    /// Returns the name of the storage backend.
    fn name() -> &'static str;

    /// Deletes every object whose key starts with the given prefix.
    ///
    /// Called before a new upload session opens so a rerun overwrites the prior
    /// run's output instead of accumulating next to it.
    fn delete_prefix(&self, prefix: &str) -> impl Future<Output = EtlResult<()>> + Send;

    /// Opens a multipart upload session for the given key and returns the
    /// store-issued session identifier.
    fn create_upload(&self, key: &str) -> impl Future<Output = EtlResult<String>> + Send;

    /// Uploads the payload at `spool_path` as the numbered part of an open session.
    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        spool_path: &Path,
    ) -> impl Future<Output = EtlResult<CompletedPart>> + Send;

    /// Finalizes the object from the given parts, ordered by part number.
    ///
    /// On success the object is durably readable at the key.
    fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> impl Future<Output = EtlResult<()>> + Send;

    /// Discards all uploaded parts and closes the session.
    fn abort_upload(&self, key: &str, upload_id: &str)
    -> impl Future<Output = EtlResult<()>> + Send;
}
