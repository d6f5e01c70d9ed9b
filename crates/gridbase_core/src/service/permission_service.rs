//! Role-scoped permission matrix.
//!
//! # Responsibility
//! - Manage roles and per-table CRUD flags.
//! - Resolve effective flags for record operations.
//!
//! # Invariants
//! - Admin roles resolve to all-true regardless of stored rows.
//! - A missing (role, table) row resolves to all-false.
//! - `bulk_set` applies every entry or none.

use crate::db::begin_immediate;
use crate::error::{CoreError, CoreResult};
use crate::model::permission::{Actor, Operation, Permission, PermissionFlags, Role, RoleId};
use crate::model::schema::{normalize_name, TableId};
use crate::repo::permission_repo::{PermissionRepository, SqlitePermissionRepository};
use crate::repo::schema_repo::table_exists;
use log::{info, warn};
use rusqlite::Connection;
use uuid::Uuid;

/// Permission matrix facade over one connection.
pub struct PermissionMatrix<'conn> {
    conn: &'conn Connection,
}

impl<'conn> PermissionMatrix<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    pub fn create_role(
        &self,
        name: &str,
        description: Option<&str>,
        is_admin: bool,
    ) -> CoreResult<Role> {
        let role = Role {
            id: Uuid::new_v4(),
            name: normalize_name(name, "role").map_err(CoreError::Validation)?,
            description: description.map(str::to_string),
            is_admin,
        };
        SqlitePermissionRepository::try_new(self.conn)?.insert_role(&role)?;
        info!(
            "event=role_create module=permission status=ok role_id={} is_admin={}",
            role.id, role.is_admin
        );
        Ok(role)
    }

    pub fn get_role(&self, role_id: RoleId) -> CoreResult<Role> {
        SqlitePermissionRepository::try_new(self.conn)?
            .get_role(role_id)?
            .ok_or_else(|| CoreError::not_found("role", role_id))
    }

    pub fn list_roles(&self) -> CoreResult<Vec<Role>> {
        Ok(SqlitePermissionRepository::try_new(self.conn)?.list_roles()?)
    }

    /// Deletes a role and its permission rows atomically.
    pub fn delete_role(&self, role_id: RoleId) -> CoreResult<()> {
        let tx = begin_immediate(self.conn)?;
        SqlitePermissionRepository::try_new(&tx)?.delete_role(role_id)?;
        tx.commit()?;
        info!("event=role_delete module=permission status=ok role_id={role_id}");
        Ok(())
    }

    /// Effective flags of `role_id` on `table_id`.
    pub fn resolve(&self, role_id: RoleId, table_id: TableId) -> CoreResult<PermissionFlags> {
        resolve_flags(self.conn, role_id, table_id)
    }

    /// Upserts flags for many tables in one transaction.
    ///
    /// Unknown role or table fails the whole batch with `NotFound`.
    pub fn bulk_set<I>(&self, role_id: RoleId, entries: I) -> CoreResult<Vec<Permission>>
    where
        I: IntoIterator<Item = (TableId, PermissionFlags)>,
    {
        let tx = begin_immediate(self.conn)?;
        let repo = SqlitePermissionRepository::try_new(&tx)?;
        repo.get_role(role_id)?
            .ok_or_else(|| CoreError::not_found("role", role_id))?;

        let mut applied = Vec::new();
        for (table_id, flags) in entries {
            if !table_exists(&tx, table_id)? {
                return Err(CoreError::not_found("table", table_id));
            }
            let permission = Permission {
                role_id,
                table_id,
                flags,
            };
            repo.upsert(&permission)?;
            applied.push(permission);
        }
        tx.commit()?;
        info!(
            "event=permission_bulk_set module=permission status=ok role_id={} count={}",
            role_id,
            applied.len()
        );
        Ok(applied)
    }

    /// Stored permission rows of one role.
    pub fn get_for_role(&self, role_id: RoleId) -> CoreResult<Vec<Permission>> {
        let repo = SqlitePermissionRepository::try_new(self.conn)?;
        repo.get_role(role_id)?
            .ok_or_else(|| CoreError::not_found("role", role_id))?;
        Ok(repo.list_for_role(role_id)?)
    }
}

pub(crate) fn resolve_flags(
    conn: &Connection,
    role_id: RoleId,
    table_id: TableId,
) -> CoreResult<PermissionFlags> {
    let repo = SqlitePermissionRepository::try_new(conn)?;
    let role = repo
        .get_role(role_id)?
        .ok_or_else(|| CoreError::not_found("role", role_id))?;
    if role.is_admin {
        return Ok(PermissionFlags::ALL);
    }
    Ok(repo.get_flags(role_id, table_id)?.unwrap_or(PermissionFlags::NONE))
}

/// Fails with `PermissionDenied` unless `actor` may perform `operation`.
pub(crate) fn require(
    conn: &Connection,
    actor: &Actor,
    table_id: TableId,
    operation: Operation,
) -> CoreResult<()> {
    if resolve_flags(conn, actor.role_id, table_id)?.allows(operation) {
        return Ok(());
    }
    warn!(
        "event=permission_check module=permission status=denied role_id={} table_id={} operation={}",
        actor.role_id,
        table_id,
        operation.as_str()
    );
    Err(CoreError::PermissionDenied {
        role_id: actor.role_id,
        table_id,
        operation,
    })
}
