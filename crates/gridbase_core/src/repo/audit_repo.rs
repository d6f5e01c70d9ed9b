//! Append-only audit log repository.
//!
//! # Invariants
//! - Rows are only ever inserted; triggers reject UPDATE and DELETE.
//! - Reads page by the `(changed_at, seq)` keyset so ties on `changed_at`
//!   keep insertion order.

use crate::model::audit::AuditLogEntry;
use crate::model::record::{RecordAction, RecordData, RecordId};
use crate::model::schema::TableId;
use crate::repo::{
    ensure_connection_ready, from_json_text, parse_uuid, to_json_text, RepoError, RepoResult,
};
use rusqlite::{params, Connection, Row};

/// Position of one audit row inside the ascending keyset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AuditKey {
    pub changed_at: i64,
    pub seq: i64,
}

/// Subject an audit page is read for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditSubject {
    Record(RecordId),
    Table(TableId),
}

impl AuditSubject {
    fn column(self) -> &'static str {
        match self {
            Self::Record(_) => "record_id",
            Self::Table(_) => "table_id",
        }
    }

    fn id(self) -> String {
        match self {
            Self::Record(id) | Self::Table(id) => id.to_string(),
        }
    }
}

pub trait AuditRepository {
    fn append(&self, entry: &AuditLogEntry) -> RepoResult<AuditKey>;
    /// Returns up to `limit` rows strictly after `after`, ascending.
    fn page(
        &self,
        subject: AuditSubject,
        after: Option<AuditKey>,
        limit: u32,
    ) -> RepoResult<Vec<(AuditKey, AuditLogEntry)>>;
    fn count(&self, subject: AuditSubject) -> RepoResult<u64>;
}

pub struct SqliteAuditRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteAuditRepository<'conn> {
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_connection_ready(conn, &["audit_log"])?;
        Ok(Self { conn })
    }
}

impl AuditRepository for SqliteAuditRepository<'_> {
    fn append(&self, entry: &AuditLogEntry) -> RepoResult<AuditKey> {
        let old_data = entry
            .old_data
            .as_ref()
            .map(|data| to_json_text(data, "audit_log.old_data"))
            .transpose()?;
        let new_data = entry
            .new_data
            .as_ref()
            .map(|data| to_json_text(data, "audit_log.new_data"))
            .transpose()?;
        self.conn.execute(
            "INSERT INTO audit_log (
                id,
                table_id,
                record_id,
                action,
                old_data,
                new_data,
                changed_by,
                changed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
            params![
                entry.id.to_string(),
                entry.table_id.to_string(),
                entry.record_id.to_string(),
                entry.action.as_str(),
                old_data,
                new_data,
                entry.changed_by,
                entry.changed_at,
            ],
        )?;
        Ok(AuditKey {
            changed_at: entry.changed_at,
            seq: self.conn.last_insert_rowid(),
        })
    }

    fn page(
        &self,
        subject: AuditSubject,
        after: Option<AuditKey>,
        limit: u32,
    ) -> RepoResult<Vec<(AuditKey, AuditLogEntry)>> {
        let (after_at, after_seq) = after
            .map(|key| (key.changed_at, key.seq))
            .unwrap_or((i64::MIN, i64::MIN));
        let mut stmt = self.conn.prepare(&format!(
            "SELECT seq, id, table_id, record_id, action, old_data, new_data, changed_by, changed_at
             FROM audit_log
             WHERE {} = ?1
               AND (changed_at > ?2 OR (changed_at = ?2 AND seq > ?3))
             ORDER BY changed_at ASC, seq ASC
             LIMIT ?4;",
            subject.column()
        ))?;
        let mut rows = stmt.query(params![
            subject.id(),
            after_at,
            after_seq,
            i64::from(limit)
        ])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            let entry = parse_audit_row(row)?;
            let key = AuditKey {
                changed_at: entry.changed_at,
                seq: row.get("seq")?,
            };
            items.push((key, entry));
        }
        Ok(items)
    }

    fn count(&self, subject: AuditSubject) -> RepoResult<u64> {
        let count: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM audit_log WHERE {} = ?1;",
                subject.column()
            ),
            [subject.id()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

fn parse_data(value: Option<String>, column: &'static str) -> RepoResult<Option<RecordData>> {
    value.map(|text| from_json_text(&text, column)).transpose()
}

fn parse_audit_row(row: &Row<'_>) -> RepoResult<AuditLogEntry> {
    let id: String = row.get("id")?;
    let table_id: String = row.get("table_id")?;
    let record_id: String = row.get("record_id")?;
    let action: String = row.get("action")?;
    Ok(AuditLogEntry {
        id: parse_uuid(&id, "audit_log.id")?,
        table_id: parse_uuid(&table_id, "audit_log.table_id")?,
        record_id: parse_uuid(&record_id, "audit_log.record_id")?,
        action: RecordAction::parse(&action)
            .ok_or_else(|| RepoError::InvalidData(format!("invalid audit action `{action}`")))?,
        old_data: parse_data(row.get("old_data")?, "audit_log.old_data")?,
        new_data: parse_data(row.get("new_data")?, "audit_log.new_data")?,
        changed_by: row.get("changed_by")?,
        changed_at: row.get("changed_at")?,
    })
}
