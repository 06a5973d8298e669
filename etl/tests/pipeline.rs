use std::io::Read;
use std::sync::{Arc, Mutex};

use config::shared::{
    PgConnectionConfig, PipelineConfig, S3StorageConfig, TlsConfig, WarehouseConfig,
};
use etl::destination::memory::MemoryDestination;
use etl::error::{ErrorKind, EtlResult};
use etl::pipeline::Pipeline;
use etl::shutdown::ShutdownTx;
use etl::source::{RowStream, TableSource};
use etl::storage::memory::MemoryObjectStore;
use etl::test_utils::{FaultyObjectStore, StaticTableSource, id_name_schema, init_test_tracing};
use flate2::read::MultiGzDecoder;
use postgres::schema::TableSchema;
use rand::Rng;
use rand::distributions::Alphanumeric;

fn test_config() -> PipelineConfig {
    let connection = PgConnectionConfig {
        host: "localhost".to_string(),
        port: 5432,
        name: "app".to_string(),
        username: "replicator".to_string(),
        password: None,
        tls: TlsConfig {
            trusted_root_certs: String::new(),
            enabled: false,
        },
    };

    PipelineConfig {
        source: connection.clone(),
        source_schema: "public".to_string(),
        warehouse: WarehouseConfig {
            connection,
            schema: "replica".to_string(),
            truncate_columns: true,
        },
        storage: S3StorageConfig {
            bucket: "exports".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: None,
            access_key_id: None,
            secret_access_key: None,
        },
        excluded_tables: vec![],
        strip_table_suffix: None,
        max_segment_bytes: 64,
        upload_part_retries: 2,
    }
}

fn decompress(payload: &[u8]) -> Vec<u8> {
    let mut decoded = Vec::new();
    MultiGzDecoder::new(payload)
        .read_to_end(&mut decoded)
        .unwrap();
    decoded
}

fn random_row(id: u64, width: usize) -> Vec<u8> {
    let name: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(width)
        .map(char::from)
        .collect();
    format!("{id}|{name}\n").into_bytes()
}

#[tokio::test]
async fn zero_row_table_produces_an_empty_object_and_a_load() {
    init_test_tracing();

    let mut source = StaticTableSource::new();
    source.add_table(id_name_schema("users"), vec![]);

    let store = MemoryObjectStore::new();
    let destination = MemoryDestination::new();

    let pipeline = Pipeline::new(
        Arc::new(test_config()),
        source,
        store.clone(),
        destination.clone(),
    );
    pipeline.replicate_all().await.unwrap();

    let object = store.object("export/users.gz").await.unwrap();
    assert!(decompress(&object).is_empty());
    assert_eq!(store.open_upload_count().await, 0);

    let table = destination.table("users").await.unwrap();
    assert_eq!(table.loaded_from.as_deref(), Some("export/users.gz"));
}

#[tokio::test]
async fn multi_segment_export_reassembles_to_the_exact_bytes() {
    init_test_tracing();

    let mut expected = Vec::new();
    let mut chunks = Vec::new();
    for id in 0..50u64 {
        chunks.push(random_row(id, 24));
    }
    for chunk in &chunks {
        expected.extend_from_slice(chunk);
    }

    let mut source = StaticTableSource::new();
    source.add_table(
        id_name_schema("events"),
        chunks.iter().map(|chunk| chunk.as_slice()).collect(),
    );

    let store = MemoryObjectStore::new();
    let destination = MemoryDestination::new();

    // 64-byte threshold against ~30-byte rows forces many rotations.
    let pipeline = Pipeline::new(
        Arc::new(test_config()),
        source,
        store.clone(),
        destination.clone(),
    );
    pipeline.replicate_all().await.unwrap();

    let object = store.object("export/events.gz").await.unwrap();
    assert_eq!(decompress(&object), expected);
    assert_eq!(store.open_upload_count().await, 0);
}

#[tokio::test]
async fn rerun_overwrites_the_previous_object() {
    init_test_tracing();

    let store = MemoryObjectStore::new();
    let destination = MemoryDestination::new();

    let mut first = StaticTableSource::new();
    first.add_table(id_name_schema("users"), vec![b"1|old\n"]);
    Pipeline::new(
        Arc::new(test_config()),
        first,
        store.clone(),
        destination.clone(),
    )
    .replicate_all()
    .await
    .unwrap();

    let mut second = StaticTableSource::new();
    second.add_table(id_name_schema("users"), vec![b"1|new\n", b"2|rows\n"]);
    Pipeline::new(
        Arc::new(test_config()),
        second,
        store.clone(),
        destination.clone(),
    )
    .replicate_all()
    .await
    .unwrap();

    assert_eq!(store.object_keys().await, vec!["export/users.gz"]);

    let object = store.object("export/users.gz").await.unwrap();
    assert_eq!(decompress(&object), b"1|new\n2|rows\n");

    let table = destination.table("users").await.unwrap();
    assert_eq!(table.generation, 2);
}

#[tokio::test]
async fn failed_export_stream_aborts_the_session() {
    init_test_tracing();

    let mut source = StaticTableSource::new();
    source.add_table(id_name_schema("users"), vec![b"1|a\n"]);
    source.fail_stream_for("users");

    let store = MemoryObjectStore::new();
    let destination = MemoryDestination::new();

    let pipeline = Pipeline::new(
        Arc::new(test_config()),
        source,
        store.clone(),
        destination.clone(),
    );
    let err = pipeline.replicate_all().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SourceIoError);
    assert!(store.object("export/users.gz").await.is_none());
    assert_eq!(store.open_upload_count().await, 0);

    // The table was created ahead of the export but never loaded.
    let table = destination.table("users").await.unwrap();
    assert!(table.loaded_from.is_none());
}

#[tokio::test]
async fn transient_part_failures_are_retried() {
    init_test_tracing();

    let mut source = StaticTableSource::new();
    source.add_table(id_name_schema("users"), vec![b"1|a\n", b"2|b\n"]);

    let store = FaultyObjectStore::new(MemoryObjectStore::new());
    store.fail_next_part_uploads(2).await;

    let destination = MemoryDestination::new();
    let pipeline = Pipeline::new(
        Arc::new(test_config()),
        source,
        store.clone(),
        destination.clone(),
    );
    pipeline.replicate_all().await.unwrap();

    let table = destination.table("users").await.unwrap();
    assert_eq!(table.generation, 1);
}

#[tokio::test]
async fn exhausted_part_retries_abort_the_session() {
    init_test_tracing();

    let mut source = StaticTableSource::new();
    source.add_table(id_name_schema("users"), vec![b"1|a\n"]);

    let memory = MemoryObjectStore::new();
    let store = FaultyObjectStore::new(memory.clone());
    store.fail_next_part_uploads(10).await;

    let destination = MemoryDestination::new();
    let pipeline = Pipeline::new(
        Arc::new(test_config()),
        source,
        store,
        destination.clone(),
    );
    let err = pipeline.replicate_all().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::UploadPartFailed);
    assert!(memory.object("export/users.gz").await.is_none());
    assert_eq!(memory.open_upload_count().await, 0);
}

#[tokio::test]
async fn failed_completion_still_ends_the_session() {
    init_test_tracing();

    let mut source = StaticTableSource::new();
    source.add_table(id_name_schema("users"), vec![b"1|a\n"]);

    let memory = MemoryObjectStore::new();
    let store = FaultyObjectStore::new(memory.clone());
    store.fail_completions().await;

    let destination = MemoryDestination::new();
    let pipeline = Pipeline::new(
        Arc::new(test_config()),
        source,
        store,
        destination.clone(),
    );
    let err = pipeline.replicate_all().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::UploadSessionFailed);
    assert!(memory.object("export/users.gz").await.is_none());
    assert_eq!(memory.open_upload_count().await, 0);
}

#[tokio::test]
async fn load_failure_keeps_the_previous_generation_visible() {
    init_test_tracing();

    let store = MemoryObjectStore::new();
    let destination = MemoryDestination::new();

    let mut first = StaticTableSource::new();
    first.add_table(id_name_schema("users"), vec![b"1|a\n"]);
    Pipeline::new(
        Arc::new(test_config()),
        first,
        store.clone(),
        destination.clone(),
    )
    .replicate_all()
    .await
    .unwrap();

    destination.fail_loads_for("users").await;

    let mut second = StaticTableSource::new();
    second.add_table(id_name_schema("users"), vec![b"2|b\n"]);
    let err = Pipeline::new(
        Arc::new(test_config()),
        second,
        store.clone(),
        destination.clone(),
    )
    .replicate_all()
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DestinationLoadFailed);

    let table = destination.table("users").await.unwrap();
    assert_eq!(table.generation, 1);
    assert_eq!(store.open_upload_count().await, 0);
}

#[tokio::test]
async fn one_bad_table_does_not_block_the_rest() {
    init_test_tracing();

    let mut source = StaticTableSource::new();
    source.add_table(id_name_schema("good"), vec![b"1|a\n"]);
    source.add_table(id_name_schema("bad"), vec![b"2|b\n"]);
    source.fail_stream_for("bad");

    let store = MemoryObjectStore::new();
    let destination = MemoryDestination::new();

    let pipeline = Pipeline::new(
        Arc::new(test_config()),
        source,
        store.clone(),
        destination.clone(),
    );
    let err = pipeline.replicate_all().await.unwrap_err();

    assert_eq!(err.kinds(), vec![ErrorKind::SourceIoError]);

    let good = destination.table("good").await.unwrap();
    assert_eq!(good.loaded_from.as_deref(), Some("export/good.gz"));
    assert!(store.object("export/bad.gz").await.is_none());
    assert_eq!(store.open_upload_count().await, 0);
}

#[tokio::test]
async fn excluded_tables_are_skipped() {
    init_test_tracing();

    let mut source = StaticTableSource::new();
    source.add_table(id_name_schema("users"), vec![b"1|a\n"]);
    source.add_table(id_name_schema("audit_log"), vec![b"2|b\n"]);

    let mut config = test_config();
    config.excluded_tables = vec!["audit_log".to_string()];

    let store = MemoryObjectStore::new();
    let destination = MemoryDestination::new();

    let pipeline = Pipeline::new(Arc::new(config), source, store.clone(), destination.clone());
    pipeline.replicate_all().await.unwrap();

    assert!(destination.has_table("users").await);
    assert!(!destination.has_table("audit_log").await);
    assert!(store.object("export/audit_log.gz").await.is_none());
}

/// A [`TableSource`] that requests a pipeline shutdown when a chosen table's
/// export stream is opened.
///
/// The shutdown handle only exists once the pipeline is built, so it is filled
/// into the shared cell afterwards.
struct ShutdownOnExport {
    inner: StaticTableSource,
    trigger_table: String,
    shutdown: Arc<Mutex<Option<ShutdownTx>>>,
}

impl TableSource for ShutdownOnExport {
    fn name() -> &'static str {
        "shutdown-on-export"
    }

    async fn table_schemas(&self) -> EtlResult<Vec<TableSchema>> {
        self.inner.table_schemas().await
    }

    async fn row_stream(&self, table_schema: &TableSchema) -> EtlResult<RowStream> {
        if table_schema.name.name == self.trigger_table {
            if let Some(shutdown_tx) = self.shutdown.lock().unwrap().as_ref() {
                shutdown_tx.send(true).unwrap();
            }
        }

        self.inner.row_stream(table_schema).await
    }
}

#[tokio::test]
async fn shutdown_finishes_the_current_table_and_skips_the_rest() {
    init_test_tracing();

    let mut inner = StaticTableSource::new();
    inner.add_table(id_name_schema("first"), vec![b"1|a\n"]);
    inner.add_table(id_name_schema("second"), vec![b"2|b\n"]);

    let shutdown = Arc::new(Mutex::new(None));
    let source = ShutdownOnExport {
        inner,
        trigger_table: "first".to_string(),
        shutdown: shutdown.clone(),
    };

    let store = MemoryObjectStore::new();
    let destination = MemoryDestination::new();

    let pipeline = Pipeline::new(
        Arc::new(test_config()),
        source,
        store.clone(),
        destination.clone(),
    );
    *shutdown.lock().unwrap() = Some(pipeline.shutdown_tx());

    pipeline.replicate_all().await.unwrap();

    // The table in flight ran to completion; nothing later was started, and no
    // upload session was left open.
    let first = destination.table("first").await.unwrap();
    assert_eq!(first.loaded_from.as_deref(), Some("export/first.gz"));
    assert!(!destination.has_table("second").await);
    assert!(store.object("export/second.gz").await.is_none());
    assert_eq!(store.open_upload_count().await, 0);
}

#[tokio::test]
async fn table_suffix_is_stripped_from_destination_names() {
    init_test_tracing();

    let mut source = StaticTableSource::new();
    source.add_table(id_name_schema("orders_raw"), vec![b"1|a\n"]);

    let mut config = test_config();
    config.strip_table_suffix = Some("_raw".to_string());

    let store = MemoryObjectStore::new();
    let destination = MemoryDestination::new();

    let pipeline = Pipeline::new(Arc::new(config), source, store.clone(), destination.clone());
    pipeline.replicate_all().await.unwrap();

    assert!(destination.has_table("orders").await);
    assert!(store.object("export/orders.gz").await.is_some());
}
