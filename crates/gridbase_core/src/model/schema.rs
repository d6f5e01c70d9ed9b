//! Schema registry domain model.
//!
//! # Responsibility
//! - Define modules, logical tables, columns and select options.
//! - Represent a column's data type as one closed tagged variant.
//!
//! # Invariants
//! - Column names are unique per table (case-insensitive).
//! - `ColumnType::ForeignKey` always carries both target table and column.
//! - `is_foreign_key` is derived from the variant, never stored separately in memory.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ModuleId = Uuid;
pub type TableId = Uuid;
pub type ColumnId = Uuid;
pub type ColumnOptionId = Uuid;

/// Upper bound for module, table and column names.
pub const MAX_NAME_CHARS: usize = 64;

static COLUMN_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("valid column name regex"));

/// Top-level grouping that owns logical tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub id: ModuleId,
    pub name: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    /// 1-based order among all modules.
    pub position: i64,
}

/// Input for module creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleSpec {
    pub name: String,
    pub description: Option<String>,
    pub icon: Option<String>,
}

/// Partial module update. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
}

/// User-defined, runtime-schematized record collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalTable {
    pub id: TableId,
    /// `None` for tables not assigned to a module.
    pub module_id: Option<ModuleId>,
    pub name: String,
    pub alias: Option<String>,
    pub description: Option<String>,
    /// 1-based order among tables of the same module.
    pub position: i64,
}

/// Partial table update. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableUpdate {
    pub name: Option<String>,
    pub alias: Option<String>,
    pub description: Option<String>,
    /// `Some(None)` detaches the table from its module.
    pub module_id: Option<Option<ModuleId>>,
}

/// Closed set of column data types.
///
/// Serialized with a `data_type` tag matching the persisted type names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "data_type", rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Number,
    Boolean,
    Date,
    /// Enumerated choices backed by `ColumnOption` rows.
    Select {
        #[serde(default)]
        multiple: bool,
    },
    /// Reference to a record of another logical table.
    ForeignKey {
        table_id: TableId,
        column_name: String,
    },
    /// Link to an externally managed user id.
    #[serde(rename = "user")]
    UserLink,
}

impl ColumnType {
    /// Stable persisted type name.
    pub fn data_type(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Select { .. } => "select",
            Self::ForeignKey { .. } => "foreign_key",
            Self::UserLink => "user",
        }
    }

    pub fn is_foreign_key(&self) -> bool {
        matches!(self, Self::ForeignKey { .. })
    }

    /// Returns `(target_table, target_column)` for foreign-key columns.
    pub fn foreign_target(&self) -> Option<(TableId, &str)> {
        match self {
            Self::ForeignKey {
                table_id,
                column_name,
            } => Some((*table_id, column_name.as_str())),
            _ => None,
        }
    }

    /// Rebuilds a variant from its flattened storage columns.
    pub(crate) fn from_parts(
        data_type: &str,
        allow_multiple: bool,
        foreign_table_id: Option<TableId>,
        foreign_column_name: Option<String>,
    ) -> Result<Self, String> {
        match data_type {
            "string" => Ok(Self::String),
            "number" => Ok(Self::Number),
            "boolean" => Ok(Self::Boolean),
            "date" => Ok(Self::Date),
            "user" => Ok(Self::UserLink),
            "select" => Ok(Self::Select {
                multiple: allow_multiple,
            }),
            "foreign_key" => match (foreign_table_id, foreign_column_name) {
                (Some(table_id), Some(column_name)) => Ok(Self::ForeignKey {
                    table_id,
                    column_name,
                }),
                _ => Err("foreign_key column is missing its target".to_string()),
            },
            other => Err(format!("unknown data type `{other}`")),
        }
    }
}

/// Extra per-column value constraints, stored as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnValidations {
    /// Inclusive lower bound for numbers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Inclusive upper bound for numbers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Maximum character count for strings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Regex a string value must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl ColumnValidations {
    /// Checks the constraint set itself is coherent.
    pub fn check(&self) -> Result<(), String> {
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(format!("validation min {min} is greater than max {max}"));
            }
        }
        if let Some(pattern) = &self.pattern {
            Regex::new(pattern).map_err(|err| format!("invalid validation pattern: {err}"))?;
        }
        Ok(())
    }
}

/// Column definition of a logical table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub id: ColumnId,
    pub table_id: TableId,
    pub name: String,
    #[serde(flatten)]
    pub column_type: ColumnType,
    pub is_required: bool,
    pub validations: ColumnValidations,
    /// 1-based order among columns of the same table.
    pub column_position: i64,
    pub created_by: String,
}

impl Column {
    pub fn is_foreign_key(&self) -> bool {
        self.column_type.is_foreign_key()
    }
}

/// Enumerated choice for a `select` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnOption {
    pub id: ColumnOptionId,
    pub column_id: ColumnId,
    pub option_value: String,
    pub option_label: String,
    pub option_order: i64,
}

/// Input for one select option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnOptionSpec {
    pub value: String,
    /// Defaults to `value` when `None`.
    pub label: Option<String>,
}

impl ColumnOptionSpec {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: None,
        }
    }
}

/// Input for adding one column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    pub is_required: bool,
    pub validations: ColumnValidations,
    /// Only meaningful for `ColumnType::Select`.
    pub options: Vec<ColumnOptionSpec>,
    pub created_by: String,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            is_required: false,
            validations: ColumnValidations::default(),
            options: Vec::new(),
            created_by: "system".to_string(),
        }
    }

    pub fn required(mut self) -> Self {
        self.is_required = true;
        self
    }

    pub fn with_options<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = values.into_iter().map(ColumnOptionSpec::new).collect();
        self
    }

    pub fn created_by(mut self, user: impl Into<String>) -> Self {
        self.created_by = user.into();
        self
    }
}

/// Partial column update. Data type changes are not supported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnUpdate {
    pub name: Option<String>,
    pub is_required: Option<bool>,
    pub validations: Option<ColumnValidations>,
}

/// Trims a display name and rejects blank or oversized values.
pub fn normalize_name(value: &str, what: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(format!("{what} name must not be blank"));
    }
    if trimmed.chars().count() > MAX_NAME_CHARS {
        return Err(format!(
            "{what} name must be at most {MAX_NAME_CHARS} characters"
        ));
    }
    Ok(trimmed.to_string())
}

/// Normalizes a column name; column names double as record data keys.
pub fn normalize_column_name(value: &str) -> Result<String, String> {
    let name = normalize_name(value, "column")?;
    if !COLUMN_NAME_RE.is_match(&name) {
        return Err(format!(
            "column name `{name}` must start with a letter and contain only letters, digits or `_`"
        ));
    }
    Ok(name)
}
