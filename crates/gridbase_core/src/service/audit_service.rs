//! Append-only audit logging.
//!
//! # Responsibility
//! - Record one immutable entry per record mutation, inside the mutation's
//!   transaction.
//! - Read history back lazily in ascending `changed_at` order.
//!
//! # Invariants
//! - Entries are never updated or deleted; the store rejects both.
//! - Entries with equal `changed_at` keep insertion order.

use crate::error::CoreResult;
use crate::model::audit::AuditLogEntry;
use crate::model::record::{RecordEvent, RecordId};
use crate::model::schema::TableId;
use crate::repo::audit_repo::{AuditKey, AuditRepository, AuditSubject, SqliteAuditRepository};
use crate::service::RecordEventSink;
use rusqlite::Connection;
use std::collections::VecDeque;
use uuid::Uuid;

const DEFAULT_BATCH_SIZE: u32 = 100;

/// Record event sink writing the audit trail.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn append(&self, conn: &Connection, event: &RecordEvent) -> CoreResult<AuditLogEntry> {
        let entry = AuditLogEntry {
            id: Uuid::new_v4(),
            table_id: event.table_id,
            record_id: event.record_id,
            action: event.action,
            old_data: event.old_data.clone(),
            new_data: event.new_data.clone(),
            changed_by: event.actor.user_id.clone(),
            changed_at: event.occurred_at,
        };
        SqliteAuditRepository::try_new(conn)?.append(&entry)?;
        Ok(entry)
    }
}

impl RecordEventSink for AuditLogger {
    fn on_record_event(&self, conn: &Connection, event: &RecordEvent) -> CoreResult<()> {
        self.append(conn, event).map(|_| ())
    }
}

/// Read access to the audit trail.
pub struct AuditTrail<'conn> {
    conn: &'conn Connection,
    batch_size: u32,
}

impl<'conn> AuditTrail<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self {
            conn,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Rows fetched per round trip by cursors from this trail.
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Appends one entry outside a record mutation.
    pub fn append(&self, event: &RecordEvent) -> CoreResult<AuditLogEntry> {
        AuditLogger.append(self.conn, event)
    }

    /// History of one record, oldest first.
    pub fn query(&self, record_id: RecordId) -> AuditCursor<'conn> {
        AuditCursor::new(self.conn, AuditSubject::Record(record_id), self.batch_size)
    }

    /// History of every record of a table, oldest first.
    pub fn query_table(&self, table_id: TableId) -> AuditCursor<'conn> {
        AuditCursor::new(self.conn, AuditSubject::Table(table_id), self.batch_size)
    }

    pub fn count(&self, record_id: RecordId) -> CoreResult<u64> {
        Ok(SqliteAuditRepository::try_new(self.conn)?.count(AuditSubject::Record(record_id))?)
    }
}

/// Lazy ascending iterator over audit entries.
///
/// Pages by `(changed_at, seq)` keyset; rows appended after the cursor's
/// position become visible on later pages.
pub struct AuditCursor<'conn> {
    conn: &'conn Connection,
    subject: AuditSubject,
    batch_size: u32,
    after: Option<AuditKey>,
    buffer: VecDeque<AuditLogEntry>,
    exhausted: bool,
}

impl<'conn> AuditCursor<'conn> {
    fn new(conn: &'conn Connection, subject: AuditSubject, batch_size: u32) -> Self {
        Self {
            conn,
            subject,
            batch_size,
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn fill(&mut self) -> CoreResult<()> {
        let page = SqliteAuditRepository::try_new(self.conn)?.page(
            self.subject,
            self.after,
            self.batch_size,
        )?;
        if page.len() < self.batch_size as usize {
            self.exhausted = true;
        }
        for (key, entry) in page {
            self.after = Some(key);
            self.buffer.push_back(entry);
        }
        Ok(())
    }
}

impl Iterator for AuditCursor<'_> {
    type Item = CoreResult<AuditLogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
