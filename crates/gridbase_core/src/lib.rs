//! Core engine for gridbase: metadata-driven tables, schema-validated
//! records, role-scoped permissions, notifications and audit.
//! This crate is the single source of truth for business invariants.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use config::{ConfigError, CoreConfig, PageLimits};
pub use db::{open_db, open_db_in_memory, DbError};
pub use error::{CoreError, CoreResult, ErrorKind};
pub use logging::{
    default_log_level, init_logging, init_logging_from_config, logging_status, LoggingError,
};
pub use model::audit::AuditLogEntry;
pub use model::notification::{
    NewScheduledNotification, NotificationScope, NotificationState, OutboxEntry, OutboxSource,
    RecordSubscription, ScheduledNotification, MAX_NOTIFY_BEFORE_DAYS,
};
pub use model::permission::{Actor, Operation, Permission, PermissionFlags, Role};
pub use model::record::{
    Record, RecordAction, RecordData, RecordEvent, RecordFilter, RecordPage, RecordQuery,
    SortDirection, SortSpec,
};
pub use model::schema::{
    Column, ColumnOption, ColumnOptionSpec, ColumnSpec, ColumnType, ColumnUpdate,
    ColumnValidations, LogicalTable, Module, ModuleSpec, ModuleUpdate, TableUpdate,
};
pub use model::view::{View, ViewSpec, ViewUpdate};
pub use repo::{RepoError, RepoResult};
pub use service::audit_service::{AuditCursor, AuditLogger, AuditTrail};
pub use service::notification_service::{NotificationCenter, NotificationPipeline};
pub use service::ordering_service::merge_order;
pub use service::permission_service::PermissionMatrix;
pub use service::record_service::RecordStore;
pub use service::scheduler::{
    DispatchError, NotificationDispatcher, NotificationScheduler, OutboxDispatcher, TickReport,
};
pub use service::schema_service::{SchemaRegistry, TableDeleteReport};
pub use service::view_service::ViewRegistry;
pub use service::RecordEventSink;

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::{core_version, ping};

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
