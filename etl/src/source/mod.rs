use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use postgres::schema::TableSchema;

use crate::error::EtlResult;

pub mod client;

/// A stream of raw export bytes for one table.
///
/// Chunk boundaries are transport-determined and carry no meaning; only the
/// concatenation of all chunks is significant.
pub type RowStream = Pin<Box<dyn Stream<Item = EtlResult<Bytes>> + Send>>;

/// Trait for databases the pipeline can replicate tables out of.
pub trait TableSource {
    /// Returns the name of the source.
    fn name() -> &'static str;

    /// Discovers the schemas of all tables in the configured source schema.
    ///
    /// Column order within each table is fixed at discovery time and drives both
    /// the export query and the destination table definition.
    fn table_schemas(&self) -> impl Future<Output = EtlResult<Vec<TableSchema>>> + Send;

    /// Opens a streaming export of one table's rows.
    fn row_stream(
        &self,
        table_schema: &TableSchema,
    ) -> impl Future<Output = EtlResult<RowStream>> + Send;
}
