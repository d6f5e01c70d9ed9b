//! Role and permission matrix repository.
//!
//! # Invariants
//! - At most one permission row per `(role_id, table_id)`; writes upsert.
//! - A missing row is reported as `None`, never as default flags; the
//!   permission service decides what absence means.

use crate::model::permission::{Permission, PermissionFlags, Role, RoleId};
use crate::model::schema::TableId;
use crate::repo::{
    bool_to_int, ensure_connection_ready, parse_bool, parse_uuid, RepoError, RepoResult,
};
use rusqlite::{params, Connection, OptionalExtension, Row};

/// Repository interface for roles and permission rows.
pub trait PermissionRepository {
    fn insert_role(&self, role: &Role) -> RepoResult<()>;
    fn get_role(&self, id: RoleId) -> RepoResult<Option<Role>>;
    fn list_roles(&self) -> RepoResult<Vec<Role>>;
    /// Deletes one role together with its permission rows.
    fn delete_role(&self, id: RoleId) -> RepoResult<()>;
    fn get_flags(&self, role_id: RoleId, table_id: TableId) -> RepoResult<Option<PermissionFlags>>;
    fn list_for_role(&self, role_id: RoleId) -> RepoResult<Vec<Permission>>;
    fn upsert(&self, permission: &Permission) -> RepoResult<()>;
    fn delete_for_table(&self, table_id: TableId) -> RepoResult<usize>;
    fn count_for_table(&self, table_id: TableId) -> RepoResult<u64>;
}

/// SQLite-backed permission repository.
pub struct SqlitePermissionRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqlitePermissionRepository<'conn> {
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_connection_ready(conn, &["roles", "permissions"])?;
        Ok(Self { conn })
    }
}

impl PermissionRepository for SqlitePermissionRepository<'_> {
    fn insert_role(&self, role: &Role) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO roles (id, name, description, is_admin) VALUES (?1, ?2, ?3, ?4);",
            params![
                role.id.to_string(),
                role.name,
                role.description,
                bool_to_int(role.is_admin),
            ],
        )?;
        Ok(())
    }

    fn get_role(&self, id: RoleId) -> RepoResult<Option<Role>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, description, is_admin FROM roles WHERE id = ?1;")?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_role_row(row)?));
        }
        Ok(None)
    }

    fn list_roles(&self) -> RepoResult<Vec<Role>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, description, is_admin FROM roles ORDER BY name COLLATE NOCASE ASC;",
        )?;
        let mut rows = stmt.query([])?;
        let mut roles = Vec::new();
        while let Some(row) = rows.next()? {
            roles.push(parse_role_row(row)?);
        }
        Ok(roles)
    }

    fn delete_role(&self, id: RoleId) -> RepoResult<()> {
        self.conn
            .execute("DELETE FROM permissions WHERE role_id = ?1;", [id.to_string()])?;
        let changed = self
            .conn
            .execute("DELETE FROM roles WHERE id = ?1;", [id.to_string()])?;
        if changed == 0 {
            return Err(RepoError::not_found("role", id));
        }
        Ok(())
    }

    fn get_flags(&self, role_id: RoleId, table_id: TableId) -> RepoResult<Option<PermissionFlags>> {
        let raw: Option<(i64, i64, i64, i64)> = self
            .conn
            .query_row(
                "SELECT can_create, can_read, can_update, can_delete
                 FROM permissions
                 WHERE role_id = ?1 AND table_id = ?2;",
                params![role_id.to_string(), table_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((create, read, update, delete)) = raw else {
            return Ok(None);
        };
        Ok(Some(PermissionFlags {
            can_create: parse_bool(create, "permissions.can_create")?,
            can_read: parse_bool(read, "permissions.can_read")?,
            can_update: parse_bool(update, "permissions.can_update")?,
            can_delete: parse_bool(delete, "permissions.can_delete")?,
        }))
    }

    fn list_for_role(&self, role_id: RoleId) -> RepoResult<Vec<Permission>> {
        let mut stmt = self.conn.prepare(
            "SELECT role_id, table_id, can_create, can_read, can_update, can_delete
             FROM permissions
             WHERE role_id = ?1
             ORDER BY table_id ASC;",
        )?;
        let mut rows = stmt.query([role_id.to_string()])?;
        let mut permissions = Vec::new();
        while let Some(row) = rows.next()? {
            let role_id: String = row.get("role_id")?;
            let table_id: String = row.get("table_id")?;
            permissions.push(Permission {
                role_id: parse_uuid(&role_id, "permissions.role_id")?,
                table_id: parse_uuid(&table_id, "permissions.table_id")?,
                flags: PermissionFlags {
                    can_create: parse_bool(row.get("can_create")?, "permissions.can_create")?,
                    can_read: parse_bool(row.get("can_read")?, "permissions.can_read")?,
                    can_update: parse_bool(row.get("can_update")?, "permissions.can_update")?,
                    can_delete: parse_bool(row.get("can_delete")?, "permissions.can_delete")?,
                },
            });
        }
        Ok(permissions)
    }

    fn upsert(&self, permission: &Permission) -> RepoResult<()> {
        let flags = permission.flags;
        self.conn.execute(
            "INSERT INTO permissions (role_id, table_id, can_create, can_read, can_update, can_delete)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (role_id, table_id) DO UPDATE SET
                can_create = excluded.can_create,
                can_read = excluded.can_read,
                can_update = excluded.can_update,
                can_delete = excluded.can_delete,
                updated_at = (strftime('%s', 'now') * 1000);",
            params![
                permission.role_id.to_string(),
                permission.table_id.to_string(),
                bool_to_int(flags.can_create),
                bool_to_int(flags.can_read),
                bool_to_int(flags.can_update),
                bool_to_int(flags.can_delete),
            ],
        )?;
        Ok(())
    }

    fn delete_for_table(&self, table_id: TableId) -> RepoResult<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM permissions WHERE table_id = ?1;",
            [table_id.to_string()],
        )?;
        Ok(deleted)
    }

    fn count_for_table(&self, table_id: TableId) -> RepoResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM permissions WHERE table_id = ?1;",
            [table_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

fn parse_role_row(row: &Row<'_>) -> RepoResult<Role> {
    let id: String = row.get("id")?;
    Ok(Role {
        id: parse_uuid(&id, "roles.id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        is_admin: parse_bool(row.get("is_admin")?, "roles.is_admin")?,
    })
}
