use gridbase_core::{
    open_db_in_memory, CoreError, ErrorKind, Operation, PermissionFlags, PermissionMatrix,
    SchemaRegistry,
};
use uuid::Uuid;

#[test]
fn admin_role_resolves_to_all_flags_without_rows() {
    let conn = open_db_in_memory().unwrap();
    let table = SchemaRegistry::new(&conn)
        .create_table(None, "invoices", None)
        .unwrap();
    let matrix = PermissionMatrix::new(&conn);
    let admin = matrix.create_role("Admin", Some("full access"), true).unwrap();

    assert_eq!(matrix.resolve(admin.id, table.id).unwrap(), PermissionFlags::ALL);
    assert!(matrix.get_for_role(admin.id).unwrap().is_empty());
}

#[test]
fn missing_row_resolves_to_no_flags() {
    let conn = open_db_in_memory().unwrap();
    let table = SchemaRegistry::new(&conn)
        .create_table(None, "invoices", None)
        .unwrap();
    let matrix = PermissionMatrix::new(&conn);
    let viewer = matrix.create_role("Viewer", None, false).unwrap();

    let flags = matrix.resolve(viewer.id, table.id).unwrap();
    assert_eq!(flags, PermissionFlags::NONE);
    for operation in [
        Operation::Create,
        Operation::Read,
        Operation::Update,
        Operation::Delete,
    ] {
        assert!(!flags.allows(operation));
    }
}

#[test]
fn unknown_role_is_not_found() {
    let conn = open_db_in_memory().unwrap();
    let table = SchemaRegistry::new(&conn)
        .create_table(None, "invoices", None)
        .unwrap();

    let err = PermissionMatrix::new(&conn)
        .resolve(Uuid::new_v4(), table.id)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn bulk_set_upserts_flags() {
    let conn = open_db_in_memory().unwrap();
    let schema = SchemaRegistry::new(&conn);
    let invoices = schema.create_table(None, "invoices", None).unwrap();
    let orders = schema.create_table(None, "orders", None).unwrap();
    let matrix = PermissionMatrix::new(&conn);
    let editor = matrix.create_role("Editor", None, false).unwrap();

    matrix
        .bulk_set(
            editor.id,
            [
                (invoices.id, PermissionFlags::read_only()),
                (orders.id, PermissionFlags::ALL),
            ],
        )
        .unwrap();
    let writable = PermissionFlags {
        can_delete: false,
        ..PermissionFlags::ALL
    };
    matrix.bulk_set(editor.id, [(invoices.id, writable)]).unwrap();

    assert_eq!(matrix.resolve(editor.id, invoices.id).unwrap(), writable);
    assert_eq!(matrix.resolve(editor.id, orders.id).unwrap(), PermissionFlags::ALL);
    assert_eq!(matrix.get_for_role(editor.id).unwrap().len(), 2);
}

#[test]
fn bulk_set_is_all_or_nothing() {
    let conn = open_db_in_memory().unwrap();
    let invoices = SchemaRegistry::new(&conn)
        .create_table(None, "invoices", None)
        .unwrap();
    let matrix = PermissionMatrix::new(&conn);
    let editor = matrix.create_role("Editor", None, false).unwrap();

    let err = matrix
        .bulk_set(
            editor.id,
            [
                (invoices.id, PermissionFlags::ALL),
                (Uuid::new_v4(), PermissionFlags::ALL),
            ],
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound { entity: "table", .. }));
    assert_eq!(
        matrix.resolve(editor.id, invoices.id).unwrap(),
        PermissionFlags::NONE
    );
}

#[test]
fn role_names_are_unique_and_delete_removes_rows() {
    let conn = open_db_in_memory().unwrap();
    let invoices = SchemaRegistry::new(&conn)
        .create_table(None, "invoices", None)
        .unwrap();
    let matrix = PermissionMatrix::new(&conn);
    let editor = matrix.create_role("Editor", None, false).unwrap();
    let err = matrix.create_role("editor", None, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    matrix
        .bulk_set(editor.id, [(invoices.id, PermissionFlags::ALL)])
        .unwrap();
    matrix.delete_role(editor.id).unwrap();
    assert_eq!(matrix.get_role(editor.id).unwrap_err().kind(), ErrorKind::NotFound);
    let rows: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM permissions WHERE role_id = ?1;",
            [editor.id.to_string()],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(rows, 0);
}
