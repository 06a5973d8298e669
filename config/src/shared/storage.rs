use serde::{Deserialize, Serialize};

use crate::SerializableSecretString;
use crate::shared::ValidationError;

/// Configuration for the S3 bucket that stages exported table data.
///
/// Explicit credentials are optional; when absent, the ambient AWS credential chain
/// (environment, instance role) is used. An endpoint URL can be set to point at
/// S3-compatible stores such as MinIO, in which case path-style addressing is forced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct S3StorageConfig {
    /// Name of the bucket that receives export objects.
    pub bucket: String,
    /// AWS region the bucket lives in.
    pub region: String,
    /// Custom endpoint URL for S3-compatible services.
    pub endpoint_url: Option<String>,
    /// Explicit access key id. Sensitive and redacted in debug output.
    pub access_key_id: Option<SerializableSecretString>,
    /// Explicit secret access key. Sensitive and redacted in debug output.
    pub secret_access_key: Option<SerializableSecretString>,
}

impl S3StorageConfig {
    /// Validates the [`S3StorageConfig`].
    ///
    /// The bucket and region must be non-empty, and explicit credentials must be
    /// supplied as a pair.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.bucket.is_empty() {
            return Err(ValidationError::EmptyField("storage.bucket"));
        }

        if self.region.is_empty() {
            return Err(ValidationError::EmptyField("storage.region"));
        }

        match (&self.access_key_id, &self.secret_access_key) {
            (Some(_), None) => Err(ValidationError::EmptyField("storage.secret_access_key")),
            (None, Some(_)) => Err(ValidationError::EmptyField("storage.access_key_id")),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> S3StorageConfig {
        S3StorageConfig {
            bucket: "exports".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: None,
            access_key_id: None,
            secret_access_key: None,
        }
    }

    #[test]
    fn empty_bucket_is_rejected() {
        let mut config = base_config();
        config.bucket = String::new();

        assert!(config.validate().is_err());
    }

    #[test]
    fn credentials_must_come_in_pairs() {
        let mut config = base_config();
        config.access_key_id = Some("AKIA123".to_string().into());

        assert!(config.validate().is_err());

        config.secret_access_key = Some("secret".to_string().into());

        assert!(config.validate().is_ok());
    }
}
