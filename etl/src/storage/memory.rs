use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::storage::{CompletedPart, ObjectStorage};

/// A multipart session that has been opened but not yet completed or aborted.
#[derive(Debug, Default)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, Vec<u8>>,
}

#[derive(Debug, Default)]
struct Inner {
    objects: HashMap<String, Vec<u8>>,
    uploads: HashMap<String, PendingUpload>,
    next_upload_id: u64,
}

/// In-memory object store for testing and development purposes.
///
/// Mirrors the multipart protocol of a real store: parts accumulate in an open
/// session and become a visible object only when the session completes. All data is
/// held in memory and lost when the process terminates.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryObjectStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the payload of the object at the given key, if present.
    pub async fn object(&self, key: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock().await;
        inner.objects.get(key).cloned()
    }

    /// Returns the keys of all durable objects.
    pub async fn object_keys(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut keys: Vec<_> = inner.objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Returns the number of sessions that are still open.
    ///
    /// A well-behaved pipeline leaves zero open sessions behind, whichever path it
    /// took.
    pub async fn open_upload_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.uploads.len()
    }

    /// Pre-populates an object, simulating leftovers from a prior run.
    pub async fn put_object(&self, key: &str, payload: Vec<u8>) {
        let mut inner = self.inner.lock().await;
        inner.objects.insert(key.to_string(), payload);
    }
}

impl ObjectStorage for MemoryObjectStore {
    fn name() -> &'static str {
        "memory"
    }

    async fn delete_prefix(&self, prefix: &str) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;
        inner.objects.retain(|key, _| !key.starts_with(prefix));

        Ok(())
    }

    async fn create_upload(&self, key: &str) -> EtlResult<String> {
        let mut inner = self.inner.lock().await;

        inner.next_upload_id += 1;
        let upload_id = format!("upload-{}", inner.next_upload_id);

        info!(key, upload_id, "opening in-memory multipart session");

        inner.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );

        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        spool_path: &Path,
    ) -> EtlResult<CompletedPart> {
        let payload = crate::segment::read_spool(spool_path)?;

        let mut inner = self.inner.lock().await;
        let upload = inner.uploads.get_mut(upload_id).ok_or_else(|| {
            etl_error!(
                ErrorKind::UploadPartFailed,
                "Unknown upload session",
                format!("key {key}, upload id {upload_id}")
            )
        })?;

        let checksum = format!("checksum-{part_number}-{}", payload.len());
        upload.parts.insert(part_number, payload);

        Ok(CompletedPart {
            part_number,
            checksum,
        })
    }

    async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;

        let upload = inner.uploads.remove(upload_id).ok_or_else(|| {
            etl_error!(
                ErrorKind::UploadSessionFailed,
                "Unknown upload session",
                format!("key {key}, upload id {upload_id}")
            )
        })?;

        // Completion must reference every uploaded part exactly once, in increasing
        // part-number order.
        let uploaded_numbers: Vec<u32> = upload.parts.keys().copied().collect();
        let referenced_numbers: Vec<u32> = parts.iter().map(|part| part.part_number).collect();
        if uploaded_numbers != referenced_numbers {
            return Err(etl_error!(
                ErrorKind::UploadSessionFailed,
                "Completion does not match the uploaded parts",
                format!("uploaded {uploaded_numbers:?}, referenced {referenced_numbers:?}")
            ));
        }

        let payload = upload.parts.into_values().flatten().collect();
        inner.objects.insert(upload.key, payload);

        Ok(())
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;

        info!(key, upload_id, "aborting in-memory multipart session");
        inner.uploads.remove(upload_id);

        Ok(())
    }
}
