use config::shared::{S3StorageConfig, WarehouseConfig};
use pg_escape::{quote_identifier, quote_literal};
use postgres::schema::TableSchema;
use tokio_postgres::{Client, SimpleQueryMessage};
use tracing::{info, warn};

use crate::destination::base::{Destination, updating_table_name};
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::source::client::connect_pg;

/// Field delimiter of export objects. Must match the delimiter the source export
/// writes between columns.
pub const FIELD_DELIMITER: char = '|';

/// Redshift-backed implementation of [`Destination`].
///
/// Redshift speaks the Postgres wire protocol, so the connection is a plain
/// tokio-postgres client. The swap transaction is driven with explicit
/// `begin`/`commit`/`rollback` statements because every statement in it is
/// assembled dynamically per table.
pub struct RedshiftDestination {
    client: Client,
    schema: String,
    truncate_columns: bool,
    storage: S3StorageConfig,
}

impl RedshiftDestination {
    /// Connects to the warehouse.
    ///
    /// The storage configuration is kept so the bulk-load statement can reference
    /// the staged object and its credentials.
    pub async fn connect(
        warehouse: &WarehouseConfig,
        storage: &S3StorageConfig,
    ) -> EtlResult<RedshiftDestination> {
        let client = connect_pg(&warehouse.connection).await.map_err(|err| {
            etl_error!(
                ErrorKind::DestinationConnectionFailed,
                "Warehouse connection failed",
                err,
                source: err
            )
        })?;

        info!(
            host = %warehouse.connection.host,
            schema = %warehouse.schema,
            "connected to warehouse"
        );

        Ok(Self {
            client,
            schema: warehouse.schema.clone(),
            truncate_columns: warehouse.truncate_columns,
            storage: storage.clone(),
        })
    }

    /// Returns the fully qualified, quoted name of a destination table.
    fn qualified_name(&self, table_name: &str) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.schema),
            quote_identifier(table_name)
        )
    }

    /// Returns whether a table exists in the destination schema.
    async fn table_exists(&self, table_name: &str) -> EtlResult<bool> {
        let query = format!(
            "select 1 from information_schema.tables where table_schema = {} and table_name = {}",
            quote_literal(&self.schema),
            quote_literal(table_name)
        );

        let rows = self
            .client
            .simple_query(&query)
            .await
            .map_err(destination_error)?;

        let found = rows
            .iter()
            .any(|message| matches!(message, SimpleQueryMessage::Row(_)));

        Ok(found)
    }

    async fn create_table(&self, target_name: &str, table_schema: &TableSchema) -> EtlResult<()> {
        let create = format!(
            "create table {} ({})",
            self.qualified_name(target_name),
            table_schema.warehouse_column_list()
        );

        self.client
            .batch_execute(&create)
            .await
            .map_err(destination_error)
    }

    /// Runs the rename-recreate-load sequence inside an already-open transaction.
    async fn run_swap(
        &self,
        target_name: &str,
        table_schema: &TableSchema,
        object_key: &str,
    ) -> EtlResult<()> {
        let updating_name = updating_table_name(target_name);

        // Stale recovery: a previously interrupted run may have left the renamed
        // previous generation behind.
        let drop_stale = format!(
            "drop table if exists {} cascade",
            self.qualified_name(&updating_name)
        );
        self.client
            .batch_execute(&drop_stale)
            .await
            .map_err(destination_error)?;

        if self.table_exists(target_name).await? {
            let rename = format!(
                "alter table {} rename to {}",
                self.qualified_name(target_name),
                quote_identifier(&updating_name)
            );
            self.client
                .batch_execute(&rename)
                .await
                .map_err(destination_error)?;
        }

        self.create_table(target_name, table_schema).await?;

        let copy = copy_statement(
            &self.storage,
            &self.qualified_name(target_name),
            object_key,
            self.truncate_columns,
        );
        self.client.batch_execute(&copy).await.map_err(|err| {
            etl_error!(
                ErrorKind::DestinationLoadFailed,
                "Bulk load into destination table failed",
                err,
                source: err
            )
        })?;

        Ok(())
    }
}

impl Destination for RedshiftDestination {
    fn name() -> &'static str {
        "redshift"
    }

    async fn create_table_if_missing(
        &self,
        target_name: &str,
        table_schema: &TableSchema,
    ) -> EtlResult<bool> {
        if self.table_exists(target_name).await? {
            return Ok(false);
        }

        self.create_table(target_name, table_schema).await?;

        info!(table = target_name, "created destination table");

        Ok(true)
    }

    async fn load_table(
        &self,
        target_name: &str,
        table_schema: &TableSchema,
        object_key: &str,
    ) -> EtlResult<()> {
        if self.truncate_columns {
            warn!(
                table = target_name,
                "over-wide values will be silently truncated during the bulk load"
            );
        }

        self.client
            .batch_execute("begin")
            .await
            .map_err(destination_error)?;

        match self.run_swap(target_name, table_schema, object_key).await {
            Ok(()) => {
                self.client
                    .batch_execute("commit")
                    .await
                    .map_err(destination_error)?;

                info!(table = target_name, object_key, "destination table swapped");

                Ok(())
            }
            Err(err) => {
                // Roll back so the previous generation stays visible. A rollback
                // failure is logged but the original error is what surfaces.
                if let Err(rollback_err) = self.client.batch_execute("rollback").await {
                    warn!(
                        table = target_name,
                        error = %rollback_err,
                        "failed to roll back swap transaction"
                    );
                }

                Err(err)
            }
        }
    }
}

/// Builds the bulk-load statement for one finalized export object.
///
/// The object is addressed by its `s3://` URI. Explicit credentials are inlined
/// when configured; otherwise the cluster's default IAM role is used.
fn copy_statement(
    storage: &S3StorageConfig,
    qualified_table: &str,
    object_key: &str,
    truncate_columns: bool,
) -> String {
    let object_uri = format!("s3://{}/{}", storage.bucket, object_key);

    let credentials = match (&storage.access_key_id, &storage.secret_access_key) {
        (Some(access_key), Some(secret_key)) => {
            let pair = format!(
                "aws_access_key_id={};aws_secret_access_key={}",
                access_key.expose_secret(),
                secret_key.expose_secret()
            );
            format!("credentials {}", quote_literal(&pair))
        }
        _ => "iam_role default".to_string(),
    };

    let tolerance = if truncate_columns {
        " truncatecolumns"
    } else {
        ""
    };

    format!(
        "copy {} from {} {} gzip delimiter {}{}",
        qualified_table,
        quote_literal(&object_uri),
        credentials,
        quote_literal(&FIELD_DELIMITER.to_string()),
        tolerance
    )
}

/// Wraps a warehouse driver error with a destination-side kind.
fn destination_error(err: tokio_postgres::Error) -> EtlError {
    etl_error!(
        ErrorKind::DestinationQueryFailed,
        "Warehouse query failed",
        err,
        source: err
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_with_credentials() -> S3StorageConfig {
        S3StorageConfig {
            bucket: "exports".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: None,
            access_key_id: Some("AKIA123".to_string().into()),
            secret_access_key: Some("sekrit".to_string().into()),
        }
    }

    #[test]
    fn copy_statement_references_the_object_and_delimiter() {
        let statement = copy_statement(
            &storage_with_credentials(),
            "replica.users",
            "export/users.gz",
            true,
        );

        assert!(statement.starts_with("copy replica.users from 's3://exports/export/users.gz'"));
        assert!(statement.contains("aws_access_key_id=AKIA123;aws_secret_access_key=sekrit"));
        assert!(statement.contains("gzip delimiter '|'"));
        assert!(statement.ends_with("truncatecolumns"));
    }

    #[test]
    fn copy_statement_without_credentials_uses_the_default_role() {
        let mut storage = storage_with_credentials();
        storage.access_key_id = None;
        storage.secret_access_key = None;

        let statement = copy_statement(&storage, "replica.users", "export/users.gz", false);

        assert!(statement.contains("iam_role default"));
        assert!(!statement.contains("truncatecolumns"));
    }
}
