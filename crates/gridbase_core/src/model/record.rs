//! Record domain model and list query types.
//!
//! # Invariants
//! - `record_data` keys are column names of the owning table.
//! - `position` is 1-based within the owning table.
//! - `table_id` is `None` only for rows orphaned by a non-cascade table delete.

use crate::model::permission::Actor;
use crate::model::schema::TableId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type RecordId = Uuid;

/// Column-name keyed record payload.
pub type RecordData = Map<String, Value>;

/// Schema-validated document belonging to a logical table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub table_id: Option<TableId>,
    pub record_data: RecordData,
    pub position: i64,
    pub created_by: String,
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Epoch milliseconds.
    pub updated_at: i64,
}

/// Record lifecycle action, shared by events, subscriptions and audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordAction {
    Create,
    Update,
    Delete,
}

impl RecordAction {
    pub const ALL: [RecordAction; 3] = [Self::Create, Self::Update, Self::Delete];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Domain event emitted by every committed record mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordEvent {
    pub action: RecordAction,
    pub table_id: TableId,
    pub record_id: RecordId,
    pub old_data: Option<RecordData>,
    pub new_data: Option<RecordData>,
    pub actor: Actor,
    /// Epoch milliseconds.
    pub occurred_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// One sort key over a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub column: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Per-column predicate. String-like columns match by substring,
/// all other types by equality of the coerced value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter {
    pub column: String,
    pub value: Value,
}

impl RecordFilter {
    pub fn new(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// Paging, filter and sort options for record listing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordQuery {
    /// 1-based page number. `0` is treated as `1`.
    pub page: u32,
    /// `None` uses the configured default page size.
    pub page_size: Option<u32>,
    pub filters: Vec<RecordFilter>,
    /// Empty means ascending `position`.
    pub sort: Vec<SortSpec>,
}

/// One page of a record listing.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordPage {
    pub items: Vec<Record>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub has_more: bool,
}
