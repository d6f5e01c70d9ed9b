use gridbase_core::{
    open_db_in_memory, Actor, ColumnSpec, ColumnType, ColumnValidations, CoreError, CoreResult,
    ErrorKind, PageLimits, PermissionFlags, PermissionMatrix, RecordData, RecordEvent,
    RecordEventSink, RecordFilter, RecordQuery, RecordStore, SchemaRegistry, SortSpec,
};
use rusqlite::Connection;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

fn admin(conn: &Connection) -> Actor {
    let role = PermissionMatrix::new(conn)
        .create_role("Admin", None, true)
        .unwrap();
    Actor::new(role.id, "admin")
}

fn data(value: serde_json::Value) -> RecordData {
    value.as_object().cloned().unwrap()
}

fn inventory(conn: &Connection) -> Uuid {
    let schema = SchemaRegistry::new(conn);
    let table = schema.create_table(None, "inventory", None).unwrap();
    schema
        .add_column(table.id, ColumnSpec::new("quantity", ColumnType::Number).required())
        .unwrap();
    table.id
}

#[test]
fn inventory_records_validate_and_reorder() {
    let conn = open_db_in_memory().unwrap();
    let actor = admin(&conn);
    let table_id = inventory(&conn);
    let store = RecordStore::new(&conn);

    let err = store
        .create_record(table_id, data(json!({"quantity": "abc"})), &actor)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeMismatch, "unexpected: {err}");

    let first = store
        .create_record(table_id, data(json!({"quantity": 5})), &actor)
        .unwrap();
    let second = store
        .create_record(table_id, data(json!({"quantity": 3})), &actor)
        .unwrap();
    assert_eq!((first.position, second.position), (1, 2));

    store
        .reorder_records(table_id, &[second.id, first.id], &actor)
        .unwrap();
    assert_eq!(store.get_record(table_id, second.id, &actor).unwrap().position, 1);
    assert_eq!(store.get_record(table_id, first.id, &actor).unwrap().position, 2);
}

#[test]
fn numeric_strings_are_coerced_before_storage() {
    let conn = open_db_in_memory().unwrap();
    let actor = admin(&conn);
    let table_id = inventory(&conn);

    let record = RecordStore::new(&conn)
        .create_record(table_id, data(json!({"quantity": " 12 "})), &actor)
        .unwrap();
    assert_eq!(record.record_data.get("quantity"), Some(&json!(12)));
}

#[test]
fn unknown_keys_and_missing_required_values_are_rejected() {
    let conn = open_db_in_memory().unwrap();
    let actor = admin(&conn);
    let table_id = inventory(&conn);
    let store = RecordStore::new(&conn);

    let err = store
        .create_record(table_id, data(json!({"quantity": 1, "colour": "red"})), &actor)
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)), "unexpected: {err}");

    for payload in [json!({}), json!({"quantity": null}), json!({"quantity": "  "})] {
        let err = store
            .create_record(table_id, data(payload), &actor)
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    let page = store
        .list_records(table_id, &RecordQuery::default(), &actor)
        .unwrap();
    assert_eq!(page.total, 0);
}

#[test]
fn validations_bound_numbers_and_strings() {
    let conn = open_db_in_memory().unwrap();
    let actor = admin(&conn);
    let schema = SchemaRegistry::new(&conn);
    let table = schema.create_table(None, "limits", None).unwrap();
    let mut score = ColumnSpec::new("score", ColumnType::Number);
    score.validations = ColumnValidations {
        min: Some(0.0),
        max: Some(10.0),
        ..ColumnValidations::default()
    };
    schema.add_column(table.id, score).unwrap();
    let mut code = ColumnSpec::new("code", ColumnType::String);
    code.validations = ColumnValidations {
        pattern: Some("^[A-Z]{3}$".to_string()),
        ..ColumnValidations::default()
    };
    schema.add_column(table.id, code).unwrap();
    let store = RecordStore::new(&conn);

    let err = store
        .create_record(table.id, data(json!({"score": 11})), &actor)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = store
        .create_record(table.id, data(json!({"code": "abc"})), &actor)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    store
        .create_record(table.id, data(json!({"score": 10, "code": "ABC"})), &actor)
        .unwrap();
}

#[test]
fn foreign_key_values_must_match_a_target_record() {
    let conn = open_db_in_memory().unwrap();
    let actor = admin(&conn);
    let schema = SchemaRegistry::new(&conn);
    let products = schema.create_table(None, "products", None).unwrap();
    schema
        .add_column(products.id, ColumnSpec::new("sku", ColumnType::String))
        .unwrap();
    let orders = schema.create_table(None, "orders", None).unwrap();
    schema
        .add_column(
            orders.id,
            ColumnSpec::new(
                "product",
                ColumnType::ForeignKey {
                    table_id: products.id,
                    column_name: "sku".to_string(),
                },
            ),
        )
        .unwrap();
    let store = RecordStore::new(&conn);
    store
        .create_record(products.id, data(json!({"sku": "P-1"})), &actor)
        .unwrap();

    let err = store
        .create_record(orders.id, data(json!({"product": "P-9"})), &actor)
        .unwrap_err();
    assert!(matches!(err, CoreError::Reference(_)), "unexpected: {err}");

    let order = store
        .create_record(orders.id, data(json!({"product": "P-1"})), &actor)
        .unwrap();
    assert_eq!(order.record_data.get("product"), Some(&json!("P-1")));
}

#[test]
fn select_values_must_be_declared_options() {
    let conn = open_db_in_memory().unwrap();
    let actor = admin(&conn);
    let schema = SchemaRegistry::new(&conn);
    let table = schema.create_table(None, "tickets", None).unwrap();
    schema
        .add_column(
            table.id,
            ColumnSpec::new("labels", ColumnType::Select { multiple: true })
                .with_options(["bug", "ui", "docs"]),
        )
        .unwrap();
    let store = RecordStore::new(&conn);

    let err = store
        .create_record(table.id, data(json!({"labels": ["bug", "perf"]})), &actor)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let record = store
        .create_record(table.id, data(json!({"labels": ["bug", "ui", "bug"]})), &actor)
        .unwrap();
    assert_eq!(record.record_data.get("labels"), Some(&json!(["bug", "ui"])));
}

#[test]
fn update_replaces_record_data_wholesale() {
    let conn = open_db_in_memory().unwrap();
    let actor = admin(&conn);
    let schema = SchemaRegistry::new(&conn);
    let table = schema.create_table(None, "people", None).unwrap();
    schema
        .add_column(table.id, ColumnSpec::new("name", ColumnType::String))
        .unwrap();
    schema
        .add_column(table.id, ColumnSpec::new("city", ColumnType::String))
        .unwrap();
    let store = RecordStore::new(&conn);
    let record = store
        .create_record(table.id, data(json!({"name": "Ada", "city": "London"})), &actor)
        .unwrap();

    let updated = store
        .update_record(table.id, record.id, data(json!({"name": "Ada L."})), &actor)
        .unwrap();
    assert_eq!(updated.record_data, data(json!({"name": "Ada L."})));
    assert_eq!(updated.created_at, record.created_at);
}

#[test]
fn delete_compacts_positions() {
    let conn = open_db_in_memory().unwrap();
    let actor = admin(&conn);
    let table_id = inventory(&conn);
    let store = RecordStore::new(&conn);
    let ids: Vec<Uuid> = (1..=3)
        .map(|quantity| {
            store
                .create_record(table_id, data(json!({"quantity": quantity})), &actor)
                .unwrap()
                .id
        })
        .collect();

    store.delete_record(table_id, ids[0], &actor).unwrap();
    let page = store
        .list_records(table_id, &RecordQuery::default(), &actor)
        .unwrap();
    let positions: Vec<i64> = page.items.iter().map(|record| record.position).collect();
    assert_eq!(positions, [1, 2]);
    assert!(matches!(
        store.get_record(table_id, ids[0], &actor),
        Err(CoreError::NotFound { .. })
    ));
}

#[test]
fn list_filters_sorts_and_pages() {
    let conn = open_db_in_memory().unwrap();
    let actor = admin(&conn);
    let schema = SchemaRegistry::new(&conn);
    let table = schema.create_table(None, "books", None).unwrap();
    schema
        .add_column(table.id, ColumnSpec::new("title", ColumnType::String))
        .unwrap();
    schema
        .add_column(table.id, ColumnSpec::new("year", ColumnType::Number))
        .unwrap();
    let store = RecordStore::new(&conn).with_page_limits(PageLimits {
        default_page_size: 2,
        max_page_size: 3,
    });
    for (title, year) in [
        ("Rust in Action", 2021),
        ("Programming Rust", 2017),
        ("The Rust Book", 2018),
        ("Dune", 1965),
    ] {
        store
            .create_record(table.id, data(json!({"title": title, "year": year})), &actor)
            .unwrap();
    }

    let query = RecordQuery {
        filters: vec![RecordFilter::new("title", "rust")],
        sort: vec![SortSpec::desc("year")],
        ..RecordQuery::default()
    };
    let first = store.list_records(table.id, &query, &actor).unwrap();
    assert_eq!(first.total, 3);
    assert_eq!(first.page, 1);
    assert_eq!(first.page_size, 2);
    assert!(first.has_more);
    let years: Vec<i64> = first
        .items
        .iter()
        .map(|record| record.record_data["year"].as_i64().unwrap())
        .collect();
    assert_eq!(years, [2021, 2018]);

    let second = store
        .list_records(table.id, &RecordQuery { page: 2, ..query.clone() }, &actor)
        .unwrap();
    assert_eq!(second.items.len(), 1);
    assert!(!second.has_more);

    let exact = store
        .list_records(
            table.id,
            &RecordQuery {
                filters: vec![RecordFilter::new("year", "1965")],
                page_size: Some(50),
                ..RecordQuery::default()
            },
            &actor,
        )
        .unwrap();
    assert_eq!(exact.page_size, 3);
    assert_eq!(exact.total, 1);
    assert_eq!(exact.items[0].record_data["title"], json!("Dune"));
}

#[test]
fn list_rejects_unknown_sort_and_filter_columns() {
    let conn = open_db_in_memory().unwrap();
    let actor = admin(&conn);
    let table_id = inventory(&conn);
    let store = RecordStore::new(&conn);

    let err = store
        .list_records(
            table_id,
            &RecordQuery {
                sort: vec![SortSpec::asc("price")],
                ..RecordQuery::default()
            },
            &actor,
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));

    let err = store
        .list_records(
            table_id,
            &RecordQuery {
                filters: vec![RecordFilter::new("price", 1)],
                ..RecordQuery::default()
            },
            &actor,
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}

#[test]
fn viewer_without_permission_row_is_denied() {
    let conn = open_db_in_memory().unwrap();
    let schema = SchemaRegistry::new(&conn);
    let invoices = schema.create_table(None, "invoices", None).unwrap();
    schema
        .add_column(invoices.id, ColumnSpec::new("amount", ColumnType::Number))
        .unwrap();
    let matrix = PermissionMatrix::new(&conn);
    let viewer = matrix.create_role("Viewer", None, false).unwrap();
    let actor = Actor::new(viewer.id, "vera");
    let store = RecordStore::new(&conn);

    let err = store
        .create_record(invoices.id, data(json!({"amount": 10})), &actor)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied, "unexpected: {err}");

    matrix
        .bulk_set(viewer.id, [(invoices.id, PermissionFlags::read_only())])
        .unwrap();
    let err = store
        .create_record(invoices.id, data(json!({"amount": 10})), &actor)
        .unwrap_err();
    match err {
        CoreError::PermissionDenied {
            role_id,
            table_id,
            operation,
        } => {
            assert_eq!(role_id, viewer.id);
            assert_eq!(table_id, invoices.id);
            assert_eq!(operation, gridbase_core::Operation::Create);
        }
        other => panic!("unexpected error: {other}"),
    }
    let page = store
        .list_records(invoices.id, &RecordQuery::default(), &actor)
        .unwrap();
    assert!(page.items.is_empty());
}

#[test]
fn unknown_table_is_not_found_before_permission_check() {
    let conn = open_db_in_memory().unwrap();
    let viewer = PermissionMatrix::new(&conn)
        .create_role("Viewer", None, false)
        .unwrap();
    let err = RecordStore::new(&conn)
        .list_records(
            Uuid::new_v4(),
            &RecordQuery::default(),
            &Actor::new(viewer.id, "vera"),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn validate_record_does_not_persist() {
    let conn = open_db_in_memory().unwrap();
    let actor = admin(&conn);
    let table_id = inventory(&conn);
    let store = RecordStore::new(&conn);

    let clean = store
        .validate_record(table_id, &data(json!({"quantity": "7"})))
        .unwrap();
    assert_eq!(clean, data(json!({"quantity": 7})));
    let page = store
        .list_records(table_id, &RecordQuery::default(), &actor)
        .unwrap();
    assert_eq!(page.total, 0);
}

struct RejectingSink {
    calls: Arc<AtomicUsize>,
}

impl RecordEventSink for RejectingSink {
    fn on_record_event(&self, _conn: &Connection, _event: &RecordEvent) -> CoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CoreError::Conflict("downstream rejected the event".to_string()))
    }
}

#[test]
fn sink_failure_rolls_the_mutation_back() {
    let conn = open_db_in_memory().unwrap();
    let actor = admin(&conn);
    let table_id = inventory(&conn);
    let calls = Arc::new(AtomicUsize::new(0));
    let store = RecordStore::new(&conn).with_sink(Box::new(RejectingSink {
        calls: Arc::clone(&calls),
    }));

    let err = store
        .create_record(table_id, data(json!({"quantity": 1})), &actor)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let page = RecordStore::new(&conn)
        .list_records(table_id, &RecordQuery::default(), &actor)
        .unwrap();
    assert_eq!(page.total, 0);
    let audited: i64 = conn
        .query_row("SELECT COUNT(*) FROM audit_log;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(audited, 0);
}
