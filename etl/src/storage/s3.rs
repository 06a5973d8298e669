use std::path::Path;

use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use config::shared::S3StorageConfig;
use tracing::{debug, info};

use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::storage::{CompletedPart, ObjectStorage};

/// Credential provider name reported to the AWS SDK for explicit credentials.
const CREDENTIALS_PROVIDER_NAME: &str = "replication-pipeline";

/// S3-backed implementation of [`ObjectStorage`].
///
/// Works against AWS S3 and S3-compatible services (MinIO, LocalStack) via an
/// optional endpoint override with forced path-style addressing.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Creates a new store from the storage configuration.
    ///
    /// Explicit credentials take precedence over the ambient AWS credential chain.
    pub async fn new(config: &S3StorageConfig) -> EtlResult<S3ObjectStore> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            let credentials = aws_sdk_s3::config::Credentials::new(
                access_key.expose_secret(),
                secret_key.expose_secret(),
                None,
                None,
                CREDENTIALS_PROVIDER_NAME,
            );
            loader = loader.credentials_provider(credentials);
        }

        let aws_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        let client = S3Client::from_conf(builder.build());

        info!(bucket = %config.bucket, region = %config.region, "connected s3 object store");

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }
}

impl ObjectStorage for S3ObjectStore {
    fn name() -> &'static str {
        "s3"
    }

    async fn delete_prefix(&self, prefix: &str) -> EtlResult<()> {
        let mut continuation_token: Option<String> = None;

        loop {
            let listing = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|err| {
                    s3_error(
                        ErrorKind::UploadSessionFailed,
                        "Failed to list prior export objects",
                        &err,
                    )
                })?;

            for object in listing.contents() {
                let Some(key) = object.key() else {
                    continue;
                };

                debug!(key, "deleting prior export object");

                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|err| {
                        s3_error(
                            ErrorKind::UploadSessionFailed,
                            "Failed to delete prior export object",
                            &err,
                        )
                    })?;
            }

            if listing.is_truncated() == Some(true) {
                continuation_token = listing.next_continuation_token().map(str::to_owned);
            } else {
                return Ok(());
            }
        }
    }

    async fn create_upload(&self, key: &str) -> EtlResult<String> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                s3_error(
                    ErrorKind::UploadSessionFailed,
                    "Failed to open multipart upload session",
                    &err,
                )
            })?;

        created.upload_id().map(str::to_owned).ok_or_else(|| {
            etl_error!(
                ErrorKind::UploadSessionFailed,
                "Multipart upload session has no upload id",
                key
            )
        })
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        spool_path: &Path,
    ) -> EtlResult<CompletedPart> {
        let body = ByteStream::from_path(spool_path).await.map_err(|err| {
            etl_error!(
                ErrorKind::SpoolIoError,
                "Failed to open segment spool for upload",
                err,
                source: err
            )
        })?;

        let uploaded = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .body(body)
            .send()
            .await
            .map_err(|err| {
                s3_error(ErrorKind::UploadPartFailed, "Failed to upload part", &err)
            })?;

        let checksum = uploaded.e_tag().map(str::to_owned).ok_or_else(|| {
            etl_error!(
                ErrorKind::UploadPartFailed,
                "Uploaded part has no content checksum",
                format!("key {key}, part {part_number}")
            )
        })?;

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
        let completed_parts = parts
            .iter()
            .map(|part| {
                S3CompletedPart::builder()
                    .part_number(part.part_number as i32)
                    .e_tag(part.checksum.clone())
                    .build()
            })
            .collect::<Vec<_>>();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|err| {
                s3_error(
                    ErrorKind::UploadSessionFailed,
                    "Failed to complete multipart upload session",
                    &err,
                )
            })?;

        Ok(())
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) -> EtlResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|err| {
                s3_error(
                    ErrorKind::UploadSessionFailed,
                    "Failed to abort multipart upload session",
                    &err,
                )
            })?;

        Ok(())
    }
}

/// Converts an AWS SDK error into an [`EtlError`] with its full error context.
fn s3_error<E>(kind: ErrorKind, description: &'static str, err: &E) -> EtlError
where
    E: std::error::Error,
{
    etl_error!(kind, description, DisplayErrorContext(err))
}
