use gridbase_core::{
    open_db_in_memory, Actor, ColumnSpec, ColumnType, CoreError, NewScheduledNotification,
    NotificationCenter, PermissionFlags, PermissionMatrix, RecordData, RecordFilter, RecordStore,
    SchemaRegistry, SortSpec, ViewRegistry, ViewSpec,
};
use chrono::{TimeZone, Utc};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

struct Fixture {
    actor: Actor,
    editor_role: Uuid,
    table_id: Uuid,
    notification_id: Uuid,
}

fn data(value: serde_json::Value) -> RecordData {
    value.as_object().cloned().unwrap()
}

fn count(conn: &Connection, sql: &str, table_id: Uuid) -> i64 {
    conn.query_row(sql, [table_id.to_string()], |row| row.get(0))
        .unwrap()
}

fn populated_table(conn: &Connection) -> Fixture {
    let matrix = PermissionMatrix::new(conn);
    let admin = matrix.create_role("Admin", None, true).unwrap();
    let editor = matrix.create_role("Editor", None, false).unwrap();
    let actor = Actor::new(admin.id, "admin");

    let schema = SchemaRegistry::new(conn);
    let table = schema.create_table(None, "contracts", None).unwrap();
    schema
        .add_column(table.id, ColumnSpec::new("title", ColumnType::String))
        .unwrap();
    schema
        .add_column(table.id, ColumnSpec::new("renewal", ColumnType::Date))
        .unwrap();
    let store = RecordStore::new(conn);
    let record = store
        .create_record(
            table.id,
            data(json!({"title": "Lease", "renewal": "2026-09-01"})),
            &actor,
        )
        .unwrap();
    store
        .create_record(table.id, data(json!({"title": "Support"})), &actor)
        .unwrap();
    ViewRegistry::new(conn)
        .create_view(
            table.id,
            ViewSpec {
                name: "By title".to_string(),
                sort_config: vec![SortSpec::asc("title")],
                created_by: "admin".to_string(),
                ..ViewSpec::default()
            },
        )
        .unwrap();
    matrix
        .bulk_set(editor.id, [(table.id, PermissionFlags::ALL)])
        .unwrap();
    let center = NotificationCenter::new(conn);
    let notification = center
        .create_notification(NewScheduledNotification {
            table_id: table.id,
            record_id: Some(record.id),
            column_name: "renewal".to_string(),
            target_date: None,
            notify_before_days: 7,
            title: "Lease renewal".to_string(),
            message: String::new(),
            assigned_user_ids: vec!["ops".to_string()],
            created_by: "admin".to_string(),
        })
        .unwrap();
    center.subscribe("ops", table.id, None, &[]).unwrap();

    Fixture {
        actor,
        editor_role: editor.id,
        table_id: table.id,
        notification_id: notification.id,
    }
}

#[test]
fn cascade_delete_removes_dependents() {
    let conn = open_db_in_memory().unwrap();
    let fixture = populated_table(&conn);

    let report = SchemaRegistry::new(&conn)
        .delete_table(fixture.table_id, true)
        .unwrap();
    assert!(report.cascade);
    assert_eq!(report.columns, 2);
    assert_eq!(report.records, 2);
    assert_eq!(report.views, 1);
    assert_eq!(report.permissions, 1);
    assert_eq!(report.notifications_deactivated, 1);
    assert_eq!(report.subscriptions_deactivated, 1);

    let id = fixture.table_id;
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM records WHERE table_id = ?1;", id), 0);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM columns WHERE table_id = ?1;", id), 0);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM views WHERE table_id = ?1;", id), 0);
    assert_eq!(
        count(&conn, "SELECT COUNT(*) FROM permissions WHERE table_id = ?1;", id),
        0
    );

    let notification = NotificationCenter::new(&conn)
        .get_notification(fixture.notification_id)
        .unwrap();
    assert!(!notification.is_active);
    let resolved = PermissionMatrix::new(&conn)
        .resolve(fixture.editor_role, fixture.table_id)
        .unwrap();
    assert_eq!(resolved, PermissionFlags::NONE);
}

#[test]
fn non_cascade_delete_detaches_records_and_views() {
    let conn = open_db_in_memory().unwrap();
    let fixture = populated_table(&conn);

    let report = SchemaRegistry::new(&conn)
        .delete_table(fixture.table_id, false)
        .unwrap();
    assert!(!report.cascade);
    assert_eq!(report.records, 2);
    assert_eq!(report.views, 1);
    assert_eq!(report.columns, 2);

    let id = fixture.table_id;
    let orphans: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM records WHERE table_id IS NULL;",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(orphans, 2);
    let orphan_views: i64 = conn
        .query_row("SELECT COUNT(*) FROM views WHERE table_id IS NULL;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(orphan_views, 1);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM columns WHERE table_id = ?1;", id), 0);
    assert!(matches!(
        SchemaRegistry::new(&conn).get_table(id),
        Err(CoreError::NotFound { .. })
    ));
    assert!(matches!(
        RecordStore::new(&conn).list_records(id, &Default::default(), &fixture.actor),
        Err(CoreError::NotFound { .. })
    ));
}

#[test]
fn table_referenced_by_another_table_cannot_be_deleted() {
    let conn = open_db_in_memory().unwrap();
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

    for cascade in [true, false] {
        let err = schema.delete_table(products.id, cascade).unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)), "unexpected: {err}");
    }
    assert!(schema.get_table(products.id).is_ok());

    schema.delete_table(orders.id, true).unwrap();
    schema.delete_table(products.id, true).unwrap();
}

#[test]
fn self_referencing_table_can_be_deleted() {
    let conn = open_db_in_memory().unwrap();
    let schema = SchemaRegistry::new(&conn);
    let staff = schema.create_table(None, "staff", None).unwrap();
    schema
        .add_column(staff.id, ColumnSpec::new("code", ColumnType::String))
        .unwrap();
    schema
        .add_column(
            staff.id,
            ColumnSpec::new(
                "manager",
                ColumnType::ForeignKey {
                    table_id: staff.id,
                    column_name: "code".to_string(),
                },
            ),
        )
        .unwrap();

    let report = schema.delete_table(staff.id, true).unwrap();
    assert_eq!(report.columns, 2);
}

#[test]
fn table_positions_compact_after_delete() {
    let conn = open_db_in_memory().unwrap();
    let schema = SchemaRegistry::new(&conn);
    let a = schema.create_table(None, "a", None).unwrap();
    let b = schema.create_table(None, "b", None).unwrap();
    let c = schema.create_table(None, "c", None).unwrap();

    schema.delete_table(a.id, true).unwrap();
    let remaining: Vec<(Uuid, i64)> = schema
        .list_tables(None)
        .unwrap()
        .into_iter()
        .map(|table| (table.id, table.position))
        .collect();
    assert_eq!(remaining, [(b.id, 1), (c.id, 2)]);
}

#[test]
fn views_drop_references_to_deleted_columns() {
    let conn = open_db_in_memory().unwrap();
    let schema = SchemaRegistry::new(&conn);
    let table = schema.create_table(None, "tasks", None).unwrap();
    schema
        .add_column(table.id, ColumnSpec::new("title", ColumnType::String))
        .unwrap();
    let due = schema
        .add_column(table.id, ColumnSpec::new("due", ColumnType::Date))
        .unwrap();
    let views = ViewRegistry::new(&conn);
    let view = views
        .create_view(
            table.id,
            ViewSpec {
                name: "Upcoming".to_string(),
                sort_config: vec![SortSpec::asc("due"), SortSpec::asc("title")],
                filter_config: vec![RecordFilter::new("due", "2026-01-01")],
                visible_columns: vec!["title".to_string(), "due".to_string()],
                created_by: "admin".to_string(),
            },
        )
        .unwrap();

    schema.delete_column(due.id, false).unwrap();

    let degraded = views.get_view(view.id).unwrap();
    assert_eq!(degraded.sort_config, vec![SortSpec::asc("title")]);
    assert!(degraded.filter_config.is_empty());
    assert_eq!(degraded.visible_columns, ["title"]);
    let listed = views.list_views(table.id).unwrap();
    assert_eq!(listed, vec![degraded]);
}

#[test]
fn views_reject_unknown_columns_on_write() {
    let conn = open_db_in_memory().unwrap();
    let schema = SchemaRegistry::new(&conn);
    let table = schema.create_table(None, "tasks", None).unwrap();
    schema
        .add_column(table.id, ColumnSpec::new("title", ColumnType::String))
        .unwrap();

    let err = ViewRegistry::new(&conn)
        .create_view(
            table.id,
            ViewSpec {
                name: "Broken".to_string(),
                visible_columns: vec!["nope".to_string()],
                ..ViewSpec::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}

#[test]
fn notification_date_is_read_from_the_record() {
    let conn = open_db_in_memory().unwrap();
    let fixture = populated_table(&conn);
    let notification = NotificationCenter::new(&conn)
        .get_notification(fixture.notification_id)
        .unwrap();
    assert_eq!(
        notification.target_date,
        Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).unwrap()
    );
}
