use chrono::{DateTime, TimeZone, Utc};
use mirror_core::store::memory::Mutation;
use mirror_core::{
    fields, ChangeEvent, DestinationStore, DocumentSchema, FieldDefinition, FieldType, Fields,
    InMemoryStore, InsertId, Mirror, MirrorConfig, MirrorError, Operation, SchemaReconciler,
    TableRef, TableRow, Value,
};
use std::sync::Arc;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn schema(names: &[&str]) -> DocumentSchema {
    DocumentSchema::keyed_by_document_id(
        names
            .iter()
            .map(|name| FieldDefinition::nullable(*name, FieldType::String))
            .collect(),
    )
    .expect("schema should be valid")
}

fn posts_schema() -> DocumentSchema {
    DocumentSchema::keyed_by_document_id(vec![
        FieldDefinition::nullable("title", FieldType::String),
        FieldDefinition::nullable("views", FieldType::Integer),
    ])
    .expect("schema should be valid")
}

fn write(op: Operation, doc: &str, insert_id: &str, secs: i64, title: &str) -> ChangeEvent {
    let data = op
        .carries_snapshot()
        .then(|| fields! { "title" => title, "views" => secs });
    ChangeEvent::new(
        vec![Value::from(doc)],
        InsertId::from(insert_id),
        op,
        at(secs),
        data,
    )
}

fn mirror(store: &Arc<InMemoryStore>, schema: DocumentSchema) -> Mirror {
    Mirror::new(
        store.clone(),
        MirrorConfig::new("firestore_export", "posts").expect("config should be valid"),
        schema,
    )
}

fn view() -> TableRef {
    TableRef::new("firestore_export", "posts")
}

fn raw() -> TableRef {
    TableRef::new("firestore_export", "posts_raw")
}

fn ids(rows: &[Fields]) -> Vec<&str> {
    rows.iter()
        .filter_map(|row| row.get("document_id").and_then(Value::as_str))
        .collect()
}

#[tokio::test]
async fn ensure_schema_twice_changes_nothing() {
    let store = Arc::new(InMemoryStore::new());
    let reconciler = SchemaReconciler::new(store.clone());

    let first = reconciler
        .ensure_schema("ds", "users", &schema(&["a", "b"]))
        .await
        .expect("first reconcile should succeed");
    let journal = store.journal().expect("journal should be readable");
    assert_eq!(
        journal,
        vec![
            Mutation::CreateDataset {
                dataset_id: "ds".into()
            },
            Mutation::CreateTable {
                table: TableRef::new("ds", "users_raw")
            },
            Mutation::CreateView {
                view: TableRef::new("ds", "users")
            },
        ]
    );

    let second = reconciler
        .ensure_schema("ds", "users", &schema(&["a", "b"]))
        .await
        .expect("second reconcile should succeed");
    assert_eq!(first, second);
    assert_eq!(store.journal().expect("journal should be readable"), journal);
}

#[tokio::test]
async fn added_field_widens_table_and_view_only() {
    let store = Arc::new(InMemoryStore::new());
    let reconciler = SchemaReconciler::new(store.clone());
    reconciler
        .ensure_schema("ds", "users", &schema(&["a", "b"]))
        .await
        .expect("reconcile should succeed");
    let before = store.journal().expect("journal should be readable").len();

    reconciler
        .ensure_schema("ds", "users", &schema(&["a", "b", "c"]))
        .await
        .expect("widening should succeed");

    let changes = store.journal().expect("journal should be readable")[before..].to_vec();
    assert_eq!(
        changes,
        vec![
            Mutation::PatchTable {
                table: TableRef::new("ds", "users_raw"),
                added: vec!["c".into()],
            },
            Mutation::UpdateView {
                view: TableRef::new("ds", "users")
            },
        ]
    );

    let live = store
        .table_schema(&TableRef::new("ds", "users_raw"))
        .await
        .expect("lookup should succeed")
        .expect("table should exist");
    assert_eq!(
        live.field_names(),
        vec!["_insert_id", "_operation", "_timestamp", "document_id", "a", "b", "c"]
    );
}

#[tokio::test]
async fn view_hides_deleted_documents() {
    let store = Arc::new(InMemoryStore::new());
    let mirror = mirror(&store, posts_schema());
    mirror
        .handle_batch(&[
            write(Operation::Create, "doc1", "c1", 1, "first"),
            write(Operation::Update, "doc1", "u1", 2, "second"),
            write(Operation::Delete, "doc1", "d1", 3, ""),
            write(Operation::Create, "doc2", "c2", 1, "other"),
        ])
        .await
        .expect("batch should be recorded");

    let visible = store.query_view(&view()).expect("view should evaluate");
    assert_eq!(ids(&visible), vec!["doc2"]);
    assert_eq!(store.rows(&raw()).expect("raw table should exist").len(), 4);
}

#[tokio::test]
async fn view_shows_latest_snapshot() {
    let store = Arc::new(InMemoryStore::new());
    let mirror = mirror(&store, posts_schema());
    mirror
        .handle_batch(&[
            write(Operation::Create, "doc1", "c1", 1, "first"),
            write(Operation::Update, "doc1", "u1", 2, "second"),
            write(Operation::Update, "doc1", "u2", 3, "third"),
        ])
        .await
        .expect("batch should be recorded");

    let visible = store.query_view(&view()).expect("view should evaluate");
    assert_eq!(visible.len(), 1);
    let row = &visible[0];
    assert_eq!(row.get("title"), Some(&Value::from("third")));
    assert_eq!(row.get("views"), Some(&Value::Int64(3)));
    assert_eq!(row.get("_last_updated"), Some(&Value::Timestamp(at(3))));
    assert!(row.get("_operation").is_none());
}

#[tokio::test]
async fn equal_timestamps_break_ties_by_insert_id() {
    let store = Arc::new(InMemoryStore::new());
    let mirror = mirror(&store, posts_schema());
    mirror
        .handle_batch(&[
            write(Operation::Update, "doc1", "b", 5, "from b"),
            write(Operation::Update, "doc1", "a", 5, "from a"),
        ])
        .await
        .expect("batch should be recorded");

    let visible = store.query_view(&view()).expect("view should evaluate");
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].get("title"), Some(&Value::from("from b")));
}

#[tokio::test]
async fn duplicate_delivery_collapses_in_view() {
    let store = Arc::new(InMemoryStore::new());
    let mirror = mirror(&store, posts_schema());
    let event = write(Operation::Create, "doc1", "c1", 1, "first");
    mirror.handle(&event).await.expect("first delivery");
    mirror.handle(&event).await.expect("redelivery");

    assert_eq!(store.rows(&raw()).expect("raw table should exist").len(), 2);
    assert_eq!(ids(&store.query_view(&view()).expect("view")), vec!["doc1"]);
}

#[tokio::test]
async fn recorded_rows_rebuild_their_events() {
    let store = Arc::new(InMemoryStore::new());
    let schema = posts_schema();
    let mirror = mirror(&store, schema.clone());
    let events = vec![
        write(Operation::Import, "doc1", "i1", 1, "imported"),
        write(Operation::Update, "doc1", "u1", 2, "edited"),
        write(Operation::Delete, "doc2", "d1", 3, ""),
    ];
    let inserted = mirror
        .handle_batch(&events)
        .await
        .expect("batch should be recorded");
    assert_eq!(inserted, 3);

    let rebuilt = store
        .rows(&raw())
        .expect("raw table should exist")
        .iter()
        .map(|row| ChangeEvent::from_row(row, &schema))
        .collect::<Result<Vec<_>, _>>()
        .expect("rows should decode");
    assert_eq!(rebuilt, events);
}

#[tokio::test]
async fn incompatible_type_is_a_conflict_and_changes_nothing() {
    let store = Arc::new(InMemoryStore::new());
    let reconciler = SchemaReconciler::new(store.clone());
    reconciler
        .ensure_schema("ds", "t", &schema(&["x"]))
        .await
        .expect("reconcile should succeed");
    let before = store.journal().expect("journal should be readable");

    let retyped = DocumentSchema::keyed_by_document_id(vec![FieldDefinition::nullable(
        "x",
        FieldType::Integer,
    )])
    .expect("schema should be valid");
    let err = reconciler
        .ensure_schema("ds", "t", &retyped)
        .await
        .expect_err("retyping a column must fail");

    assert!(matches!(err, MirrorError::SchemaConflict { .. }));
    assert!(!err.is_transient());
    assert_eq!(store.journal().expect("journal should be readable"), before);
}

#[tokio::test]
async fn unreachable_destination_records_nothing() {
    let store = Arc::new(InMemoryStore::new());
    store.set_unreachable(true);
    let mirror = mirror(&store, posts_schema());

    let err = mirror
        .handle(&write(Operation::Create, "doc1", "c1", 1, "first"))
        .await
        .expect_err("unreachable store must fail");
    assert!(matches!(err, MirrorError::DestinationUnreachable(_)));
    assert!(err.is_transient());

    store.set_unreachable(false);
    assert!(store.journal().expect("journal should be readable").is_empty());
}

#[tokio::test]
async fn conflicting_schema_records_nothing() {
    let store = Arc::new(InMemoryStore::new());
    mirror(&store, schema(&["views"]))
        .handle(&ChangeEvent::create(
            vec![Value::from("doc1")],
            InsertId::from("c1"),
            at(1),
            fields! { "views" => "many" },
        ))
        .await
        .expect("first mirror should record");

    let err = mirror(&store, posts_schema())
        .handle(&write(Operation::Update, "doc1", "u1", 2, "second"))
        .await
        .expect_err("type change must fail");
    assert!(matches!(err, MirrorError::SchemaConflict { .. }));
    assert_eq!(store.rows(&raw()).expect("raw table should exist").len(), 1);
}

#[tokio::test]
async fn mirror_reads_parameters_and_trigger_payload() {
    let config = MirrorConfig::from_json_str(
        r#"{"dataset_id":"firestore_export","table_name":"posts"}"#,
    )
    .expect("config should parse");
    let store = Arc::new(InMemoryStore::new());
    let mirror = Mirror::new(store.clone(), config, posts_schema());

    let event: ChangeEvent = serde_json::from_value(serde_json::json!({
        "id_values": ["doc1"],
        "insert_id": InsertId::derive("posts/doc1", 1),
        "operation": "CREATE",
        "timestamp": "2019-07-01T12:00:00Z",
        "data": { "title": "Hello", "views": 10 }
    }))
    .expect("payload should deserialize");
    mirror.handle(&event).await.expect("event should be recorded");

    let visible = store.query_view(&view()).expect("view should evaluate");
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].get("views"), Some(&Value::Int64(10)));
}

#[tokio::test]
async fn rows_sent_as_json_keep_latest_state_ordering() {
    let store = Arc::new(InMemoryStore::new());
    let schema = posts_schema();
    SchemaReconciler::new(store.clone())
        .ensure_schema("firestore_export", "posts", &schema)
        .await
        .expect("reconcile should succeed");

    let older = write(Operation::Update, "doc1", "a", 1, "older")
        .to_row(&schema)
        .expect("row should build");
    let newer = write(Operation::Update, "doc1", "b", 100, "newer")
        .to_row(&schema)
        .expect("row should build");
    let wire = serde_json::to_string(&newer).expect("row should serialize");
    let newer: TableRow = serde_json::from_str(&wire).expect("row should deserialize");
    assert_eq!(newer.columns.get("_timestamp"), Some(&Value::Timestamp(at(100))));

    let mut textual = write(Operation::Update, "doc1", "c", 50, "textual")
        .to_row(&schema)
        .expect("row should build");
    textual.columns.insert("_timestamp".into(), Value::from("1970-01-01T00:00:50Z"));

    let outcome = store
        .insert_rows(&raw(), &[newer, older, textual])
        .await
        .expect("insert should succeed");
    assert!(outcome.is_complete());

    let visible = store.query_view(&view()).expect("view should evaluate");
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].get("title"), Some(&Value::from("newer")));
    assert_eq!(visible[0].get("_last_updated"), Some(&Value::Timestamp(at(100))));
}

#[test]
fn change_events_survive_json() {
    let event = ChangeEvent::create(
        vec![Value::from("doc1")],
        InsertId::from("c1"),
        at(1),
        fields! {
            "blob" => Value::Bytes(vec![1, 2]),
            "published" => at(7),
            "tags" => vec![Value::from("a")],
        },
    );
    let wire = serde_json::to_string(&event).expect("event should serialize");
    let back: ChangeEvent = serde_json::from_str(&wire).expect("event should deserialize");
    assert_eq!(back, event);
}
