use std::future::Future;

use postgres::schema::TableSchema;

use crate::error::EtlResult;

/// Trait for warehouses that can receive replicated tables.
///
/// [`Destination`] implementations define how a finalized export object becomes the
/// destination table's new contents. The load must be atomic from the point of view
/// of warehouse readers: either the table serves the previous generation or the new
/// one, never a partially loaded state.
///
/// Implementations should be idempotent per run, as the pipeline may be rerun after
/// a failure with the same object key.
pub trait Destination {
    /// Returns the name of the destination.
    fn name() -> &'static str;

    /// Creates the destination table when it does not exist yet.
    ///
    /// Called before the export starts so that warehouse readers find a (possibly
    /// empty) relation on a table's very first run. Returns `true` when the table
    /// was created, `false` when it already existed.
    fn create_table_if_missing(
        &self,
        target_name: &str,
        table_schema: &TableSchema,
    ) -> impl Future<Output = EtlResult<bool>> + Send;

    /// Replaces the destination table's contents from the finalized export object.
    ///
    /// Performs the whole swap inside one transaction: the stale `<target>_updating`
    /// relic of an interrupted run is dropped, the current table is renamed to
    /// `<target>_updating`, the table is recreated from the current column schemas,
    /// and the object at `object_key` is bulk-loaded. On any failure the transaction
    /// rolls back in full and the previous generation stays visible. After a
    /// successful load, `<target>_updating` holds the previous generation until the
    /// next run drops it.
    fn load_table(
        &self,
        target_name: &str,
        table_schema: &TableSchema,
        object_key: &str,
    ) -> impl Future<Output = EtlResult<()>> + Send;
}

/// Returns the name of the renamed previous-generation table.
pub fn updating_table_name(target_name: &str) -> String {
    format!("{target_name}_updating")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updating_name_appends_the_suffix() {
        assert_eq!(updating_table_name("orders"), "orders_updating");
    }
}
