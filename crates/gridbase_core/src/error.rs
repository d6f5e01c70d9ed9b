//! Core error taxonomy surfaced to callers.
//!
//! # Responsibility
//! - Map repository failures into the caller-facing error kinds.
//! - Give every kind a stable code and status for the transport boundary.
//!
//! # Invariants
//! - Every variant is surfaced synchronously; none are swallowed.
//! - `ErrorKind::code()` strings are stable API.

use crate::db::DbError;
use crate::model::permission::{Operation, RoleId};
use crate::model::schema::TableId;
use crate::repo::RepoError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type CoreResult<T> = Result<T, CoreError>;

/// Errors returned by core services.
#[derive(Debug)]
pub enum CoreError {
    /// Malformed schema or record input.
    Validation(String),
    /// A value cannot be read as its column's declared type.
    TypeMismatch {
        column: String,
        expected: &'static str,
        message: String,
    },
    /// Dangling foreign key or schema reference.
    Reference(String),
    /// Actor's role lacks the CRUD flag for the table.
    PermissionDenied {
        role_id: RoleId,
        table_id: TableId,
        operation: Operation,
    },
    /// Name collision or delete blocked by dependents.
    Conflict(String),
    /// Unknown id.
    NotFound { entity: &'static str, id: String },
    /// Persistence-layer failure.
    Repo(RepoError),
}

/// Stable classification of `CoreError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    TypeMismatch,
    Reference,
    PermissionDenied,
    Conflict,
    NotFound,
    Internal,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::TypeMismatch => "type_mismatch",
            Self::Reference => "reference_error",
            Self::PermissionDenied => "permission_denied",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        }
    }

    /// HTTP-equivalent status for request/response transports.
    pub fn http_status(self) -> u16 {
        match self {
            Self::Validation | Self::TypeMismatch | Self::Reference => 422,
            Self::PermissionDenied => 403,
            Self::Conflict => 409,
            Self::NotFound => 404,
            Self::Internal => 500,
        }
    }
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            Self::Reference(_) => ErrorKind::Reference,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Repo(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(message) => write!(f, "validation failed: {message}"),
            Self::TypeMismatch {
                column,
                expected,
                message,
            } => write!(f, "column `{column}` expects {expected}: {message}"),
            Self::Reference(message) => write!(f, "dangling reference: {message}"),
            Self::PermissionDenied {
                role_id,
                table_id,
                operation,
            } => write!(
                f,
                "role {role_id} may not {} records of table {table_id}",
                operation.as_str()
            ),
            Self::Conflict(message) => write!(f, "conflict: {message}"),
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for CoreError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::NotFound { entity, id } => Self::NotFound { entity, id },
            RepoError::Db(DbError::Sqlite(err)) if is_unique_violation(&err) => {
                Self::Conflict(err.to_string())
            }
            other => Self::Repo(other),
        }
    }
}

impl From<DbError> for CoreError {
    fn from(value: DbError) -> Self {
        RepoError::Db(value).into()
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(value: rusqlite::Error) -> Self {
        RepoError::from(value).into()
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, _)
            if code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

#[cfg(test)]
mod tests {
    use super::{CoreError, ErrorKind};
    use crate::repo::RepoError;

    #[test]
    fn kinds_map_to_stable_codes_and_statuses() {
        let err = CoreError::Validation("bad".to_string());
        assert_eq!(err.kind().code(), "validation_error");
        assert_eq!(ErrorKind::PermissionDenied.http_status(), 403);
        assert_eq!(ErrorKind::NotFound.http_status(), 404);
        assert_eq!(ErrorKind::Conflict.http_status(), 409);
    }

    #[test]
    fn repo_not_found_becomes_core_not_found() {
        let err: CoreError = RepoError::NotFound {
            entity: "record",
            id: "abc".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "record not found: abc");
    }
}
