use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use postgres::schema::TableSchema;
use tokio::sync::Mutex;
use tracing::info;

use crate::destination::base::{Destination, updating_table_name};
use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;

/// One destination table held by [`MemoryDestination`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryTable {
    /// Column definition list the table was created with.
    pub columns: String,
    /// Key of the export object the current contents were loaded from. `None` for
    /// a freshly created table that has not been loaded yet.
    pub loaded_from: Option<String>,
    /// Monotonic counter incremented on every successful load.
    pub generation: u64,
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, MemoryTable>,
    fail_targets: HashSet<String>,
}

/// In-memory destination for testing and development purposes.
///
/// Models the swap semantics of the real warehouse: a load either replaces the
/// table wholesale or leaves the previous generation untouched. The whole swap runs
/// against a copy of the table map and the copy only becomes visible when the load
/// succeeds, which is the fake's equivalent of a transaction rollback.
#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDestination {
    /// Creates a new empty destination.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the table with the given name, if present.
    pub async fn table(&self, name: &str) -> Option<MemoryTable> {
        let inner = self.inner.lock().await;
        inner.tables.get(name).cloned()
    }

    /// Returns whether a table with the given name exists.
    pub async fn has_table(&self, name: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.tables.contains_key(name)
    }

    /// Makes every future load of the given target fail.
    pub async fn fail_loads_for(&self, target_name: &str) {
        let mut inner = self.inner.lock().await;
        inner.fail_targets.insert(target_name.to_string());
    }
}

impl Destination for MemoryDestination {
    fn name() -> &'static str {
        "memory"
    }

    async fn create_table_if_missing(
        &self,
        target_name: &str,
        table_schema: &TableSchema,
    ) -> EtlResult<bool> {
        let mut inner = self.inner.lock().await;

        if inner.tables.contains_key(target_name) {
            return Ok(false);
        }

        inner.tables.insert(
            target_name.to_string(),
            MemoryTable {
                columns: table_schema.warehouse_column_list(),
                loaded_from: None,
                generation: 0,
            },
        );

        Ok(true)
    }

    async fn load_table(
        &self,
        target_name: &str,
        table_schema: &TableSchema,
        object_key: &str,
    ) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;

        // The swap runs against a copy; committing the copy at the end is the
        // in-memory stand-in for the transactional swap.
        let mut tables = inner.tables.clone();
        let updating_name = updating_table_name(target_name);

        tables.remove(&updating_name);

        let previous_generation = match tables.remove(target_name) {
            Some(previous) => {
                let generation = previous.generation;
                tables.insert(updating_name, previous);
                generation
            }
            None => 0,
        };

        if inner.fail_targets.contains(target_name) {
            return Err(etl_error!(
                ErrorKind::DestinationLoadFailed,
                "Bulk load into destination table failed",
                format!("simulated load failure for {target_name}")
            ));
        }

        tables.insert(
            target_name.to_string(),
            MemoryTable {
                columns: table_schema.warehouse_column_list(),
                loaded_from: Some(object_key.to_string()),
                generation: previous_generation + 1,
            },
        );

        inner.tables = tables;

        info!(table = target_name, object_key, "swapped in-memory table");

        Ok(())
    }
}
