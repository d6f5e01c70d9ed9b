//! Roles, permission flags and the caller identity.

use crate::model::schema::TableId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type RoleId = Uuid;

/// Named set of rights; admin roles bypass the matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub description: Option<String>,
    pub is_admin: bool,
}

/// CRUD flags for one (role, table) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PermissionFlags {
    pub can_create: bool,
    pub can_read: bool,
    pub can_update: bool,
    pub can_delete: bool,
}

impl PermissionFlags {
    pub const NONE: Self = Self {
        can_create: false,
        can_read: false,
        can_update: false,
        can_delete: false,
    };

    pub const ALL: Self = Self {
        can_create: true,
        can_read: true,
        can_update: true,
        can_delete: true,
    };

    pub fn read_only() -> Self {
        Self {
            can_read: true,
            ..Self::NONE
        }
    }

    pub fn allows(&self, operation: Operation) -> bool {
        match operation {
            Operation::Create => self.can_create,
            Operation::Read => self.can_read,
            Operation::Update => self.can_update,
            Operation::Delete => self.can_delete,
        }
    }
}

/// Stored permission row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub role_id: RoleId,
    pub table_id: TableId,
    #[serde(flatten)]
    pub flags: PermissionFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Caller identity supplied by the external authentication layer.
///
/// The core trusts this value as given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub role_id: RoleId,
    /// Stored in `created_by` / `changed_by` fields.
    pub user_id: String,
}

impl Actor {
    pub fn new(role_id: RoleId, user_id: impl Into<String>) -> Self {
        Self {
            role_id,
            user_id: user_id.into(),
        }
    }
}
