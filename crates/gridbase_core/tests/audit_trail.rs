use gridbase_core::{
    open_db_in_memory, Actor, AuditTrail, ColumnSpec, ColumnType, CoreResult, PermissionMatrix,
    RecordAction, RecordData, RecordEvent, RecordStore, SchemaRegistry,
};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn data(value: serde_json::Value) -> RecordData {
    value.as_object().cloned().unwrap()
}

fn counters(conn: &Connection) -> (Actor, Uuid) {
    let role = PermissionMatrix::new(conn)
        .create_role("Admin", None, true)
        .unwrap();
    let schema = SchemaRegistry::new(conn);
    let table = schema.create_table(None, "counters", None).unwrap();
    schema
        .add_column(table.id, ColumnSpec::new("value", ColumnType::Number))
        .unwrap();
    (Actor::new(role.id, "auditor"), table.id)
}

#[test]
fn record_lifecycle_is_logged_in_order() {
    let conn = open_db_in_memory().unwrap();
    let (actor, table_id) = counters(&conn);
    let store = RecordStore::new(&conn);
    let record = store
        .create_record(table_id, data(json!({"value": 1})), &actor)
        .unwrap();
    store
        .update_record(table_id, record.id, data(json!({"value": 2})), &actor)
        .unwrap();
    store.delete_record(table_id, record.id, &actor).unwrap();

    let trail = AuditTrail::new(&conn);
    let entries = trail
        .query(record.id)
        .collect::<CoreResult<Vec<_>>>()
        .unwrap();
    let actions: Vec<RecordAction> = entries.iter().map(|entry| entry.action).collect();
    assert_eq!(
        actions,
        [RecordAction::Create, RecordAction::Update, RecordAction::Delete]
    );
    assert_eq!(entries[0].old_data, None);
    assert_eq!(entries[0].new_data, Some(data(json!({"value": 1}))));
    assert_eq!(entries[1].old_data, Some(data(json!({"value": 1}))));
    assert_eq!(entries[1].new_data, Some(data(json!({"value": 2}))));
    assert_eq!(entries[2].new_data, None);
    assert!(entries.iter().all(|entry| entry.changed_by == "auditor"));
    assert!(entries
        .windows(2)
        .all(|pair| pair[0].changed_at <= pair[1].changed_at));
    assert_eq!(trail.count(record.id).unwrap(), 3);
}

#[test]
fn equal_timestamps_keep_insertion_order_across_pages() {
    let conn = open_db_in_memory().unwrap();
    let (actor, table_id) = counters(&conn);
    let record_id = Uuid::new_v4();
    let trail = AuditTrail::new(&conn).with_batch_size(2);

    for value in 0..5 {
        trail
            .append(&RecordEvent {
                action: RecordAction::Update,
                table_id,
                record_id,
                old_data: None,
                new_data: Some(data(json!({ "value": value }))),
                actor: actor.clone(),
                occurred_at: 1_700_000_000_000,
            })
            .unwrap();
    }

    let values: Vec<i64> = trail
        .query(record_id)
        .map(|entry| entry.unwrap().new_data.unwrap()["value"].as_i64().unwrap())
        .collect();
    assert_eq!(values, [0, 1, 2, 3, 4]);
}

#[test]
fn table_history_spans_records() {
    let conn = open_db_in_memory().unwrap();
    let (actor, table_id) = counters(&conn);
    let store = RecordStore::new(&conn);
    let first = store
        .create_record(table_id, data(json!({"value": 1})), &actor)
        .unwrap();
    let second = store
        .create_record(table_id, data(json!({"value": 2})), &actor)
        .unwrap();

    let records: Vec<Uuid> = AuditTrail::new(&conn)
        .query_table(table_id)
        .map(|entry| entry.unwrap().record_id)
        .collect();
    assert_eq!(records, [first.id, second.id]);
}

#[test]
fn audit_rows_reject_update_and_delete() {
    let conn = open_db_in_memory().unwrap();
    let (actor, table_id) = counters(&conn);
    let record = RecordStore::new(&conn)
        .create_record(table_id, data(json!({"value": 1})), &actor)
        .unwrap();

    let update = conn.execute(
        "UPDATE audit_log SET changed_by = 'mallory' WHERE record_id = ?1;",
        [record.id.to_string()],
    );
    assert!(update.is_err());
    let delete = conn.execute(
        "DELETE FROM audit_log WHERE record_id = ?1;",
        [record.id.to_string()],
    );
    assert!(delete.is_err());

    assert_eq!(AuditTrail::new(&conn).count(record.id).unwrap(), 1);
}

#[test]
fn failed_mutation_leaves_no_audit_entry() {
    let conn = open_db_in_memory().unwrap();
    let (actor, table_id) = counters(&conn);
    let store = RecordStore::new(&conn);

    assert!(store
        .create_record(table_id, data(json!({"value": "many"})), &actor)
        .is_err());
    let total: i64 = conn
        .query_row("SELECT COUNT(*) FROM audit_log;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(total, 0);
}
