//! Configuration types and loading for the replication pipeline.
//!
//! All configuration is explicitly constructed and passed into the pipeline and its
//! collaborators; nothing reads ambient process state besides the loader in [`load`].

use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

pub mod environment;
pub mod load;
pub mod shared;

/// A secret string that can round-trip through serde.
///
/// [`secrecy::SecretString`] deliberately does not implement [`Serialize`], but
/// configuration values have to be serializable to be passed between processes.
/// This wrapper restores serialization while keeping the redacted [`fmt::Debug`]
/// behavior of the inner secret.
#[derive(Clone, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub struct SerializableSecretString(SecretString);

impl SerializableSecretString {
    /// Exposes the wrapped secret value.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for SerializableSecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SerializableSecretString(REDACTED)")
    }
}

impl From<String> for SerializableSecretString {
    fn from(value: String) -> Self {
        Self(SecretString::from(value))
    }
}

impl From<SerializableSecretString> for String {
    fn from(value: SerializableSecretString) -> Self {
        value.expose_secret().to_owned()
    }
}

impl From<SecretString> for SerializableSecretString {
    fn from(value: SecretString) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_the_secret() {
        let secret = SerializableSecretString::from("hunter2".to_string());

        let rendered = format!("{secret:?}");

        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn serde_round_trip_preserves_the_value() {
        let secret = SerializableSecretString::from("hunter2".to_string());

        let serialized = serde_json::to_string(&secret).unwrap();
        let deserialized: SerializableSecretString = serde_json::from_str(&serialized).unwrap();

        assert_eq!(deserialized.expose_secret(), "hunter2");
    }
}
