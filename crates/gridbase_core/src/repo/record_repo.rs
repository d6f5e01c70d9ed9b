//! Record repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist schema-validated records as JSON documents.
//! - Translate resolved filters and sort keys into `json_extract` SQL.
//!
//! # Invariants
//! - Writes never validate; the record store validates before calling in.
//! - Default listing order is `position ASC, id ASC`; explicit sort keys are
//!   followed by the same tiebreakers so pages are deterministic.

use crate::model::record::{Record, RecordData, RecordId, SortSpec};
use crate::model::schema::TableId;
use crate::repo::{
    ensure_connection_ready, from_json_text, json_path, parse_optional_uuid, parse_uuid,
    to_json_text, RepoError, RepoResult,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, Row};
use serde_json::Value;

const RECORD_SELECT_SQL: &str = "SELECT
    id,
    table_id,
    record_data,
    position,
    created_by,
    created_at,
    updated_at
FROM records";

/// Predicate over one record data key, chosen from the column type.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordPredicate {
    /// Coerced value equality.
    Equals(Value),
    /// Case-insensitive substring match.
    Contains(String),
    /// Array value contains the element.
    HasElement(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordListFilter {
    pub column: String,
    pub predicate: RecordPredicate,
}

/// Fully resolved listing request.
#[derive(Debug, Clone, Copy)]
pub struct RecordListSpec<'a> {
    pub table_id: TableId,
    pub filters: &'a [RecordListFilter],
    pub sort: &'a [SortSpec],
    pub limit: u32,
    pub offset: u64,
}

/// Repository interface for record persistence.
pub trait RecordRepository {
    fn insert_record(&self, record: &Record) -> RepoResult<()>;
    fn get_record(&self, id: RecordId) -> RepoResult<Option<Record>>;
    fn update_record_data(&self, id: RecordId, data: &RecordData) -> RepoResult<()>;
    fn delete_record(&self, id: RecordId) -> RepoResult<()>;
    fn list_records(&self, spec: &RecordListSpec<'_>) -> RepoResult<Vec<Record>>;
    fn count_records(&self, table_id: TableId, filters: &[RecordListFilter]) -> RepoResult<u64>;
    /// Counts records holding a non-null value at `column_name`.
    fn count_with_value(&self, table_id: TableId, column_name: &str) -> RepoResult<u64>;
    /// Removes `column_name` from every record of the table.
    fn strip_key(&self, table_id: TableId, column_name: &str) -> RepoResult<usize>;
    /// Moves values from `old_name` to `new_name` in every record of the table.
    fn rename_key(&self, table_id: TableId, old_name: &str, new_name: &str) -> RepoResult<usize>;
    /// Returns whether `value` identifies a record of `table_id`, by id or by
    /// the value stored at `column_name`.
    fn reference_exists(
        &self,
        table_id: TableId,
        column_name: &str,
        value: &str,
    ) -> RepoResult<bool>;
    fn delete_for_table(&self, table_id: TableId) -> RepoResult<usize>;
    /// Keeps rows but clears their table reference.
    fn detach_for_table(&self, table_id: TableId) -> RepoResult<usize>;
}

/// SQLite-backed record repository.
pub struct SqliteRecordRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteRecordRepository<'conn> {
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_connection_ready(conn, &["records"])?;
        Ok(Self { conn })
    }
}

impl RecordRepository for SqliteRecordRepository<'_> {
    fn insert_record(&self, record: &Record) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO records (
                id,
                table_id,
                record_data,
                position,
                created_by,
                created_at,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
            params![
                record.id.to_string(),
                record.table_id.map(|value| value.to_string()),
                to_json_text(&record.record_data, "records.record_data")?,
                record.position,
                record.created_by,
                record.created_at,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    fn get_record(&self, id: RecordId) -> RepoResult<Option<Record>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{RECORD_SELECT_SQL} WHERE id = ?1;"))?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_record_row(row)?));
        }
        Ok(None)
    }

    fn update_record_data(&self, id: RecordId, data: &RecordData) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE records
             SET record_data = ?2,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE id = ?1;",
            params![id.to_string(), to_json_text(data, "records.record_data")?],
        )?;
        if changed == 0 {
            return Err(RepoError::not_found("record", id));
        }
        Ok(())
    }

    fn delete_record(&self, id: RecordId) -> RepoResult<()> {
        let changed = self
            .conn
            .execute("DELETE FROM records WHERE id = ?1;", [id.to_string()])?;
        if changed == 0 {
            return Err(RepoError::not_found("record", id));
        }
        Ok(())
    }

    fn list_records(&self, spec: &RecordListSpec<'_>) -> RepoResult<Vec<Record>> {
        let (where_clause, mut binds) = filter_clause(spec.table_id, spec.filters);
        let mut sql = format!("{RECORD_SELECT_SQL}{where_clause} ORDER BY ");
        for sort in spec.sort {
            sql.push_str(&format!(
                "json_extract(record_data, ?) {}, ",
                sort.direction.as_sql()
            ));
            binds.push(SqlValue::Text(json_path(&sort.column)));
        }
        sql.push_str("position ASC, id ASC LIMIT ? OFFSET ?;");
        binds.push(SqlValue::Integer(i64::from(spec.limit)));
        binds.push(SqlValue::Integer(
            i64::try_from(spec.offset).unwrap_or(i64::MAX),
        ));

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(binds))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(parse_record_row(row)?);
        }
        Ok(records)
    }

    fn count_records(&self, table_id: TableId, filters: &[RecordListFilter]) -> RepoResult<u64> {
        let (where_clause, binds) = filter_clause(table_id, filters);
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM records{where_clause};"),
            params_from_iter(binds),
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn count_with_value(&self, table_id: TableId, column_name: &str) -> RepoResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*)
             FROM records
             WHERE table_id = ?1
               AND COALESCE(json_type(record_data, ?2), 'null') != 'null';",
            params![table_id.to_string(), json_path(column_name)],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn strip_key(&self, table_id: TableId, column_name: &str) -> RepoResult<usize> {
        let changed = self.conn.execute(
            "UPDATE records
             SET record_data = json_remove(record_data, ?2),
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE table_id = ?1
               AND json_type(record_data, ?2) IS NOT NULL;",
            params![table_id.to_string(), json_path(column_name)],
        )?;
        Ok(changed)
    }

    fn rename_key(&self, table_id: TableId, old_name: &str, new_name: &str) -> RepoResult<usize> {
        let changed = self.conn.execute(
            "UPDATE records
             SET record_data = json_remove(
                     json_set(record_data, ?3, json(record_data -> ?2)),
                     ?2
                 ),
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE table_id = ?1
               AND json_type(record_data, ?2) IS NOT NULL;",
            params![table_id.to_string(), json_path(old_name), json_path(new_name)],
        )?;
        Ok(changed)
    }

    fn reference_exists(
        &self,
        table_id: TableId,
        column_name: &str,
        value: &str,
    ) -> RepoResult<bool> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM records
                WHERE table_id = ?1
                  AND (id = ?2 OR CAST(json_extract(record_data, ?3) AS TEXT) = ?2)
            );",
            params![table_id.to_string(), value, json_path(column_name)],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }

    fn delete_for_table(&self, table_id: TableId) -> RepoResult<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM records WHERE table_id = ?1;",
            [table_id.to_string()],
        )?;
        Ok(deleted)
    }

    fn detach_for_table(&self, table_id: TableId) -> RepoResult<usize> {
        let changed = self.conn.execute(
            "UPDATE records
             SET table_id = NULL,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE table_id = ?1;",
            [table_id.to_string()],
        )?;
        Ok(changed)
    }
}

fn filter_clause(table_id: TableId, filters: &[RecordListFilter]) -> (String, Vec<SqlValue>) {
    let mut clause = String::from(" WHERE table_id = ?");
    let mut binds = vec![SqlValue::Text(table_id.to_string())];
    for filter in filters {
        let path = SqlValue::Text(json_path(&filter.column));
        match &filter.predicate {
            RecordPredicate::Equals(value) => {
                clause.push_str(" AND json_extract(record_data, ?) = ?");
                binds.push(path);
                binds.push(json_to_sql(value));
            }
            RecordPredicate::Contains(needle) => {
                clause.push_str(
                    " AND instr(lower(CAST(json_extract(record_data, ?) AS TEXT)), lower(?)) > 0",
                );
                binds.push(path);
                binds.push(SqlValue::Text(needle.clone()));
            }
            RecordPredicate::HasElement(element) => {
                clause.push_str(
                    " AND EXISTS (SELECT 1 FROM json_each(records.record_data, ?) AS item WHERE item.value = ?)",
                );
                binds.push(path);
                binds.push(SqlValue::Text(element.clone()));
            }
        }
    }
    (clause, binds)
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => SqlValue::Integer(integer),
            None => SqlValue::Real(number.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn parse_record_row(row: &Row<'_>) -> RepoResult<Record> {
    let id: String = row.get("id")?;
    let record_data: String = row.get("record_data")?;
    Ok(Record {
        id: parse_uuid(&id, "records.id")?,
        table_id: parse_optional_uuid(row.get("table_id")?, "records.table_id")?,
        record_data: from_json_text(&record_data, "records.record_data")?,
        position: row.get("position")?,
        created_by: row.get("created_by")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}
