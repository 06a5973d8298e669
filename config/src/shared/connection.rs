use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_postgres::{Config as TokioPgConnectOptions, config::SslMode as TokioPgSslMode};

use crate::SerializableSecretString;

/// Static Postgres connection options that ensure sane defaults.
///
/// These options are applied to all connections so that text output formatting is
/// consistent across different server installations. The bulk export relies on
/// deterministic text rendering of dates and floats.
pub struct DefaultPgConnectionOptions;

impl DefaultPgConnectionOptions {
    /// Returns the options as a string suitable for the tokio-postgres options parameter.
    ///
    /// Returns a space-separated list of `-c key=value` pairs.
    pub fn to_options_string() -> String {
        "-c datestyle=ISO -c intervalstyle=postgres -c extra_float_digits=3 -c client_encoding=UTF8"
            .to_string()
    }
}

/// Errors that can occur while validating configuration values.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// TLS is enabled but no trusted root certificates were supplied.
    #[error("trusted root certs must be provided when TLS is enabled")]
    MissingTrustedRootCerts,

    /// A required configuration field is empty.
    #[error("configuration field `{0}` must not be empty")]
    EmptyField(&'static str),

    /// The segment rotation threshold is below the storage minimum part size.
    #[error("`max_segment_bytes` must be at least {0} bytes")]
    SegmentThresholdTooSmall(u64),
}

/// Configuration for connecting to a Postgres-protocol database.
///
/// Used both for the source database and for the warehouse, which speaks the
/// Postgres wire protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PgConnectionConfig {
    /// Hostname or IP address of the server.
    pub host: String,
    /// Port number on which the server is listening.
    pub port: u16,
    /// Name of the database to connect to.
    pub name: String,
    /// Username for authenticating with the server.
    pub username: String,
    /// Password for the specified user. This field is sensitive and redacted in debug output.
    pub password: Option<SerializableSecretString>,
    /// TLS configuration for secure connections.
    pub tls: TlsConfig,
}

/// TLS settings for secure connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TlsConfig {
    /// PEM-encoded trusted root certificates.
    pub trusted_root_certs: String,
    /// Whether TLS is enabled for the connection.
    pub enabled: bool,
}

impl TlsConfig {
    /// Validates the [`TlsConfig`].
    ///
    /// If [`TlsConfig::enabled`] is true, this method checks that
    /// [`TlsConfig::trusted_root_certs`] is not empty.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.enabled && self.trusted_root_certs.is_empty() {
            return Err(ValidationError::MissingTrustedRootCerts);
        }

        Ok(())
    }
}

/// Conversion from a connection config into driver-specific connect options.
pub trait IntoConnectOptions<Output> {
    /// Creates connection options for connecting to the server without specifying a
    /// database. Useful for administrative operations performed before connecting to a
    /// specific database.
    fn without_db(&self) -> Output;

    /// Creates connection options for connecting to a specific database.
    fn with_db(&self) -> Output;
}

impl IntoConnectOptions<TokioPgConnectOptions> for PgConnectionConfig {
    fn without_db(&self) -> TokioPgConnectOptions {
        let ssl_mode = if self.tls.enabled {
            TokioPgSslMode::Require
        } else {
            TokioPgSslMode::Prefer
        };

        let mut config = TokioPgConnectOptions::new();
        config
            .host(self.host.clone())
            .port(self.port)
            .user(self.username.clone())
            .options(DefaultPgConnectionOptions::to_options_string())
            .ssl_mode(ssl_mode);

        if let Some(password) = &self.password {
            config.password(password.expose_secret());
        }

        config
    }

    fn with_db(&self) -> TokioPgConnectOptions {
        let mut options: TokioPgConnectOptions = self.without_db();
        options.dbname(self.name.clone());
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_tls(enabled: bool, certs: &str) -> TlsConfig {
        TlsConfig {
            trusted_root_certs: certs.to_string(),
            enabled,
        }
    }

    #[test]
    fn tls_validation_requires_certs_when_enabled() {
        assert!(config_with_tls(true, "").validate().is_err());
        assert!(config_with_tls(true, "some pem").validate().is_ok());
        assert!(config_with_tls(false, "").validate().is_ok());
    }

    #[test]
    fn with_db_sets_the_database_name() {
        let config = PgConnectionConfig {
            host: "localhost".to_string(),
            port: 5432,
            name: "orders".to_string(),
            username: "replicator".to_string(),
            password: None,
            tls: config_with_tls(false, ""),
        };

        let options: TokioPgConnectOptions = config.with_db();

        assert_eq!(options.get_dbname(), Some("orders"));
    }
}
