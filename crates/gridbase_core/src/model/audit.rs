//! Append-only audit trail entries.

use crate::model::record::{RecordAction, RecordData, RecordId};
use crate::model::schema::TableId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type AuditEntryId = Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: AuditEntryId,
    pub table_id: TableId,
    pub record_id: RecordId,
    pub action: RecordAction,
    pub old_data: Option<RecordData>,
    pub new_data: Option<RecordData>,
    pub changed_by: String,
    /// Epoch milliseconds.
    pub changed_at: i64,
}
