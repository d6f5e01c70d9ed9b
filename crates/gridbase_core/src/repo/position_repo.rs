//! Positional ordering storage shared by every sibling set.
//!
//! # Responsibility
//! - Map one `SiblingSet` to its table, position column and scope.
//! - Read sibling ids in current order and write 1-based positions.
//!
//! # Invariants
//! - Current order is `position ASC, id ASC`, so ties resolve deterministically.
//! - Written positions are dense: `1..=n` in the given order.

use crate::model::schema::{ModuleId, TableId};
use crate::repo::{parse_uuid, RepoResult};
use rusqlite::{params_from_iter, Connection};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// One group of entities that share a position sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiblingSet {
    Modules,
    /// Tables of one module; `None` groups unassigned tables.
    Tables { module_id: Option<ModuleId> },
    Columns { table_id: TableId },
    Records { table_id: TableId },
    Views { table_id: TableId },
}

struct SiblingLayout {
    table: &'static str,
    position_column: &'static str,
    scope_column: Option<&'static str>,
}

impl SiblingSet {
    fn layout(&self) -> SiblingLayout {
        match self {
            Self::Modules => SiblingLayout {
                table: "modules",
                position_column: "position",
                scope_column: None,
            },
            Self::Tables { .. } => SiblingLayout {
                table: "logical_tables",
                position_column: "position",
                scope_column: Some("module_id"),
            },
            Self::Columns { .. } => SiblingLayout {
                table: "columns",
                position_column: "column_position",
                scope_column: Some("table_id"),
            },
            Self::Records { .. } => SiblingLayout {
                table: "records",
                position_column: "position",
                scope_column: Some("table_id"),
            },
            Self::Views { .. } => SiblingLayout {
                table: "views",
                position_column: "position",
                scope_column: Some("table_id"),
            },
        }
    }

    fn scope_value(&self) -> Option<String> {
        match self {
            Self::Modules => None,
            Self::Tables { module_id } => module_id.map(|id| id.to_string()),
            Self::Columns { table_id } | Self::Records { table_id } | Self::Views { table_id } => {
                Some(table_id.to_string())
            }
        }
    }

    /// Singular entity name used in errors.
    pub fn entity(&self) -> &'static str {
        match self {
            Self::Modules => "module",
            Self::Tables { .. } => "table",
            Self::Columns { .. } => "column",
            Self::Records { .. } => "record",
            Self::Views { .. } => "view",
        }
    }

    /// Builds `WHERE ...` plus its bind values for this set's scope.
    fn scope_clause(&self) -> (String, Vec<String>) {
        let layout = self.layout();
        match (layout.scope_column, self.scope_value()) {
            (None, _) => (String::new(), Vec::new()),
            (Some(column), Some(value)) => (format!(" WHERE {column} = ?"), vec![value]),
            (Some(column), None) => (format!(" WHERE {column} IS NULL"), Vec::new()),
        }
    }
}

impl Display for SiblingSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.scope_value() {
            Some(scope) => write!(f, "{}:{scope}", self.layout().table),
            None => write!(f, "{}:root", self.layout().table),
        }
    }
}

/// Lists sibling ids in current order.
pub fn list_sibling_ids(conn: &Connection, set: SiblingSet) -> RepoResult<Vec<Uuid>> {
    let layout = set.layout();
    let (where_clause, binds) = set.scope_clause();
    let sql = format!(
        "SELECT id FROM {}{where_clause} ORDER BY {} ASC, id ASC;",
        layout.table, layout.position_column
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(binds))?;
    let mut ids = Vec::new();
    while let Some(row) = rows.next()? {
        let value: String = row.get(0)?;
        ids.push(parse_uuid(&value, "sibling id")?);
    }
    Ok(ids)
}

/// Returns the position a newly appended sibling should take.
pub fn next_position(conn: &Connection, set: SiblingSet) -> RepoResult<i64> {
    let layout = set.layout();
    let (where_clause, binds) = set.scope_clause();
    let sql = format!(
        "SELECT COALESCE(MAX({}), 0) + 1 FROM {}{where_clause};",
        layout.position_column, layout.table
    );
    let next = conn.query_row(&sql, params_from_iter(binds), |row| row.get(0))?;
    Ok(next)
}

/// Writes positions `1..=n` following `ordered_ids`.
pub fn write_positions(conn: &Connection, set: SiblingSet, ordered_ids: &[Uuid]) -> RepoResult<()> {
    let layout = set.layout();
    let sql = format!(
        "UPDATE {} SET {} = ?2 WHERE id = ?1;",
        layout.table, layout.position_column
    );
    let mut stmt = conn.prepare(&sql)?;
    for (index, id) in ordered_ids.iter().enumerate() {
        stmt.execute(rusqlite::params![id.to_string(), index as i64 + 1])?;
    }
    Ok(())
}

/// Rewrites positions densely after a sibling was removed.
pub fn compact_positions(conn: &Connection, set: SiblingSet) -> RepoResult<()> {
    let ids = list_sibling_ids(conn, set)?;
    write_positions(conn, set, &ids)
}
