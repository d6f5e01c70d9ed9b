//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate repository calls into use-case level APIs.
//! - Own transaction scope: every mutating call opens one `BEGIN IMMEDIATE`
//!   transaction and builds repositories over it.
//!
//! # Invariants
//! - A failed call leaves no partial writes behind.
//! - Record events reach every registered sink inside the record transaction.

use crate::error::CoreResult;
use crate::model::record::RecordEvent;
use rusqlite::Connection;

pub mod audit_service;
pub mod notification_service;
pub mod ordering_service;
pub mod permission_service;
pub mod record_service;
pub mod scheduler;
pub mod schema_service;
pub mod view_service;

/// Consumer of record lifecycle events.
///
/// `conn` is the open record transaction; an error aborts the mutation.
pub trait RecordEventSink {
    fn on_record_event(&self, conn: &Connection, event: &RecordEvent) -> CoreResult<()>;
}
