use std::collections::BTreeMap;
use std::io::BufReader;

use config::shared::{IntoConnectOptions, PgConnectionConfig};
use futures::{StreamExt, TryStreamExt};
use pg_escape::quote_literal;
use postgres::schema::{ColumnSchema, TableName, TableSchema, convert_type_oid_to_type};
use rustls::ClientConfig;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::{Client, Config, Connection, NoTls, Socket};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, error, info};

use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::source::{RowStream, TableSource};

/// Query returning every column of every ordinary table in a schema, in a stable
/// order. Column order within a table follows the attribute number, which is the
/// table's declared column order.
const COLUMNS_QUERY: &str = "
select c.relname, a.attname, a.atttypid, a.atttypmod, a.attnotnull
from pg_catalog.pg_attribute a
join pg_catalog.pg_class c on a.attrelid = c.oid
join pg_catalog.pg_namespace n on c.relnamespace = n.oid
where n.nspname = $1
  and c.relkind = 'r'
  and a.attnum > 0
  and not a.attisdropped
order by c.relname, a.attnum";

/// Spawns a background task that drives a Postgres connection until it terminates.
fn spawn_pg_connection<T>(connection: Connection<Socket, T::Stream>)
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    // The task is not tracked via its `JoinHandle`; dropping the `Client` that
    // owns the other end terminates the connection and the task with it.
    tokio::spawn(async move {
        match connection.await {
            Err(err) => error!(error = %err, "postgres connection terminated with an error"),
            Ok(()) => debug!("postgres connection terminated"),
        }
    });
}

/// Establishes a Postgres-protocol connection, with TLS when configured.
pub(crate) async fn connect_pg(connection_config: &PgConnectionConfig) -> EtlResult<Client> {
    let options: Config = connection_config.with_db();

    if !connection_config.tls.enabled {
        let (client, connection) = options.connect(NoTls).await?;
        spawn_pg_connection::<NoTls>(connection);

        return Ok(client);
    }

    let mut root_store = rustls::RootCertStore::empty();
    let mut root_certs_reader =
        BufReader::new(connection_config.tls.trusted_root_certs.as_bytes());
    for cert in rustls_pemfile::certs(&mut root_certs_reader) {
        let cert = cert?;
        root_store.add(cert)?;
    }

    let tls_config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let (client, connection) = options.connect(MakeRustlsConnect::new(tls_config)).await?;
    spawn_pg_connection::<MakeRustlsConnect>(connection);

    Ok(client)
}

/// Postgres-backed implementation of [`TableSource`].
///
/// Holds one connection for the whole run; schema discovery and every table export
/// reuse it sequentially. The session is forced read-only since the pipeline never
/// writes to the source.
pub struct PgSourceClient {
    client: Client,
    schema: String,
}

impl PgSourceClient {
    /// Connects to the source database and pins the session read-only.
    pub async fn connect(
        connection_config: &PgConnectionConfig,
        schema: &str,
    ) -> EtlResult<PgSourceClient> {
        let client = connect_pg(connection_config).await?;

        client
            .batch_execute("set default_transaction_read_only = on")
            .await?;

        info!(
            host = %connection_config.host,
            schema,
            "connected to source database"
        );

        Ok(Self {
            client,
            schema: schema.to_string(),
        })
    }
}

impl TableSource for PgSourceClient {
    fn name() -> &'static str {
        "postgres"
    }

    async fn table_schemas(&self) -> EtlResult<Vec<TableSchema>> {
        let rows = self.client.query(COLUMNS_QUERY, &[&self.schema]).await?;

        let mut columns_by_table: BTreeMap<String, Vec<ColumnSchema>> = BTreeMap::new();
        for row in &rows {
            let table_name: String = row.try_get("relname")?;
            let column_name: String = row.try_get("attname")?;
            let type_oid: u32 = row.try_get("atttypid")?;
            let modifier: i32 = row.try_get("atttypmod")?;
            let not_null: bool = row.try_get("attnotnull")?;

            columns_by_table.entry(table_name).or_default().push(
                ColumnSchema::new(
                    column_name,
                    convert_type_oid_to_type(type_oid),
                    modifier,
                    !not_null,
                ),
            );
        }

        if columns_by_table.is_empty() {
            return Err(etl_error!(
                ErrorKind::SourceSchemaError,
                "No tables found in the source schema",
                format!("schema {}", self.schema)
            ));
        }

        let table_schemas = columns_by_table
            .into_iter()
            .map(|(table_name, column_schemas)| {
                TableSchema::new(
                    TableName::new(self.schema.clone(), table_name),
                    column_schemas,
                )
            })
            .collect::<Vec<_>>();

        info!(tables = table_schemas.len(), "discovered source tables");

        Ok(table_schemas)
    }

    async fn row_stream(&self, table_schema: &TableSchema) -> EtlResult<RowStream> {
        let statement = format!(
            "copy (select {} from {}) to stdout with (format text, delimiter {})",
            table_schema.export_column_list(),
            table_schema.name.as_quoted_identifier(),
            quote_literal("|")
        );

        debug!(table = %table_schema.name, "starting table export");

        let stream = self.client.copy_out(&statement).await?;

        Ok(stream.map_err(EtlError::from).boxed())
    }
}
