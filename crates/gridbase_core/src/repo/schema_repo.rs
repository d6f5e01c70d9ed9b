//! Schema registry repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist modules, logical tables, columns and select options.
//! - Keep flattened column-type storage behind `ColumnType`.
//!
//! # Invariants
//! - Listing is deterministic: `position ASC, id ASC`.
//! - Name lookups are case-insensitive, matching the unique indexes.

use crate::model::schema::{
    Column, ColumnId, ColumnOption, ColumnType, LogicalTable, Module, ModuleId, TableId,
};
use crate::repo::{
    bool_to_int, ensure_connection_ready, from_json_text, parse_bool, parse_optional_uuid,
    parse_uuid, to_json_text, RepoError, RepoResult,
};
use rusqlite::{params, Connection, OptionalExtension, Row};

const MODULE_SELECT_SQL: &str = "SELECT id, name, description, icon, position FROM modules";

const TABLE_SELECT_SQL: &str =
    "SELECT id, module_id, name, alias, description, position FROM logical_tables";

const COLUMN_SELECT_SQL: &str = "SELECT
    id,
    table_id,
    name,
    data_type,
    is_required,
    allow_multiple,
    foreign_table_id,
    foreign_column_name,
    validations,
    column_position,
    created_by
FROM columns";

/// Repository interface for schema registry persistence.
pub trait SchemaRepository {
    fn insert_module(&self, module: &Module) -> RepoResult<()>;
    fn get_module(&self, id: ModuleId) -> RepoResult<Option<Module>>;
    fn list_modules(&self) -> RepoResult<Vec<Module>>;
    fn update_module(&self, module: &Module) -> RepoResult<()>;
    /// Deletes one module after moving its tables to no module.
    fn delete_module(&self, id: ModuleId) -> RepoResult<()>;

    fn insert_table(&self, table: &LogicalTable) -> RepoResult<()>;
    fn get_table(&self, id: TableId) -> RepoResult<Option<LogicalTable>>;
    fn find_table_by_name(&self, name: &str) -> RepoResult<Option<LogicalTable>>;
    /// Lists tables of one module, or unassigned tables for `None`.
    fn list_tables(&self, module_id: Option<ModuleId>) -> RepoResult<Vec<LogicalTable>>;
    fn update_table(&self, table: &LogicalTable) -> RepoResult<()>;
    fn delete_table(&self, id: TableId) -> RepoResult<()>;

    fn insert_column(&self, column: &Column) -> RepoResult<()>;
    fn get_column(&self, id: ColumnId) -> RepoResult<Option<Column>>;
    fn find_column_by_name(&self, table_id: TableId, name: &str) -> RepoResult<Option<Column>>;
    fn list_columns(&self, table_id: TableId) -> RepoResult<Vec<Column>>;
    fn update_column(&self, column: &Column) -> RepoResult<()>;
    fn delete_column(&self, id: ColumnId) -> RepoResult<()>;
    /// Deletes every column (and option) of one table. Returns column count.
    fn delete_columns_for_table(&self, table_id: TableId) -> RepoResult<usize>;
    /// Foreign-key columns of other tables pointing at `table_id`.
    fn list_columns_referencing_table(&self, table_id: TableId) -> RepoResult<Vec<Column>>;
    /// Points foreign keys targeting `(table_id, old_name)` at `new_name`.
    fn retarget_foreign_column(
        &self,
        table_id: TableId,
        old_name: &str,
        new_name: &str,
    ) -> RepoResult<usize>;

    fn replace_options(&self, column_id: ColumnId, options: &[ColumnOption]) -> RepoResult<()>;
    fn list_options(&self, column_id: ColumnId) -> RepoResult<Vec<ColumnOption>>;
}

/// SQLite-backed schema repository.
pub struct SqliteSchemaRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteSchemaRepository<'conn> {
    /// Creates repository from a migrated connection.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_connection_ready(
            conn,
            &["modules", "logical_tables", "columns", "column_options"],
        )?;
        Ok(Self { conn })
    }
}

impl SchemaRepository for SqliteSchemaRepository<'_> {
    fn insert_module(&self, module: &Module) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO modules (id, name, description, icon, position)
             VALUES (?1, ?2, ?3, ?4, ?5);",
            params![
                module.id.to_string(),
                module.name,
                module.description,
                module.icon,
                module.position,
            ],
        )?;
        Ok(())
    }

    fn get_module(&self, id: ModuleId) -> RepoResult<Option<Module>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{MODULE_SELECT_SQL} WHERE id = ?1;"))?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_module_row(row)?));
        }
        Ok(None)
    }

    fn list_modules(&self) -> RepoResult<Vec<Module>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{MODULE_SELECT_SQL} ORDER BY position ASC, id ASC;"))?;
        let mut rows = stmt.query([])?;
        let mut modules = Vec::new();
        while let Some(row) = rows.next()? {
            modules.push(parse_module_row(row)?);
        }
        Ok(modules)
    }

    fn update_module(&self, module: &Module) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE modules
             SET name = ?2,
                 description = ?3,
                 icon = ?4,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE id = ?1;",
            params![
                module.id.to_string(),
                module.name,
                module.description,
                module.icon,
            ],
        )?;
        if changed == 0 {
            return Err(RepoError::not_found("module", module.id));
        }
        Ok(())
    }

    fn delete_module(&self, id: ModuleId) -> RepoResult<()> {
        self.conn.execute(
            "UPDATE logical_tables
             SET module_id = NULL,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE module_id = ?1;",
            [id.to_string()],
        )?;
        let changed = self
            .conn
            .execute("DELETE FROM modules WHERE id = ?1;", [id.to_string()])?;
        if changed == 0 {
            return Err(RepoError::not_found("module", id));
        }
        Ok(())
    }

    fn insert_table(&self, table: &LogicalTable) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO logical_tables (id, module_id, name, alias, description, position)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            params![
                table.id.to_string(),
                table.module_id.map(|value| value.to_string()),
                table.name,
                table.alias,
                table.description,
                table.position,
            ],
        )?;
        Ok(())
    }

    fn get_table(&self, id: TableId) -> RepoResult<Option<LogicalTable>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{TABLE_SELECT_SQL} WHERE id = ?1;"))?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_table_row(row)?));
        }
        Ok(None)
    }

    fn find_table_by_name(&self, name: &str) -> RepoResult<Option<LogicalTable>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{TABLE_SELECT_SQL} WHERE lower(name) = lower(?1);"))?;
        let mut rows = stmt.query([name])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_table_row(row)?));
        }
        Ok(None)
    }

    fn list_tables(&self, module_id: Option<ModuleId>) -> RepoResult<Vec<LogicalTable>> {
        let mut tables = Vec::new();
        match module_id {
            Some(module_id) => {
                let mut stmt = self.conn.prepare(&format!(
                    "{TABLE_SELECT_SQL} WHERE module_id = ?1 ORDER BY position ASC, id ASC;"
                ))?;
                let mut rows = stmt.query([module_id.to_string()])?;
                while let Some(row) = rows.next()? {
                    tables.push(parse_table_row(row)?);
                }
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "{TABLE_SELECT_SQL} WHERE module_id IS NULL ORDER BY position ASC, id ASC;"
                ))?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    tables.push(parse_table_row(row)?);
                }
            }
        }
        Ok(tables)
    }

    fn update_table(&self, table: &LogicalTable) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE logical_tables
             SET module_id = ?2,
                 name = ?3,
                 alias = ?4,
                 description = ?5,
                 position = ?6,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE id = ?1;",
            params![
                table.id.to_string(),
                table.module_id.map(|value| value.to_string()),
                table.name,
                table.alias,
                table.description,
                table.position,
            ],
        )?;
        if changed == 0 {
            return Err(RepoError::not_found("table", table.id));
        }
        Ok(())
    }

    fn delete_table(&self, id: TableId) -> RepoResult<()> {
        let changed = self
            .conn
            .execute("DELETE FROM logical_tables WHERE id = ?1;", [id.to_string()])?;
        if changed == 0 {
            return Err(RepoError::not_found("table", id));
        }
        Ok(())
    }

    fn insert_column(&self, column: &Column) -> RepoResult<()> {
        let (foreign_table_id, foreign_column_name) = match column.column_type.foreign_target() {
            Some((table_id, column_name)) => {
                (Some(table_id.to_string()), Some(column_name.to_string()))
            }
            None => (None, None),
        };
        let allow_multiple = matches!(column.column_type, ColumnType::Select { multiple: true });
        self.conn.execute(
            "INSERT INTO columns (
                id,
                table_id,
                name,
                data_type,
                is_required,
                is_foreign_key,
                foreign_table_id,
                foreign_column_name,
                allow_multiple,
                validations,
                column_position,
                created_by
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12);",
            params![
                column.id.to_string(),
                column.table_id.to_string(),
                column.name,
                column.column_type.data_type(),
                bool_to_int(column.is_required),
                bool_to_int(column.is_foreign_key()),
                foreign_table_id,
                foreign_column_name,
                bool_to_int(allow_multiple),
                to_json_text(&column.validations, "columns.validations")?,
                column.column_position,
                column.created_by,
            ],
        )?;
        Ok(())
    }

    fn get_column(&self, id: ColumnId) -> RepoResult<Option<Column>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{COLUMN_SELECT_SQL} WHERE id = ?1 AND table_id IS NOT NULL;"))?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_column_row(row)?));
        }
        Ok(None)
    }

    fn find_column_by_name(&self, table_id: TableId, name: &str) -> RepoResult<Option<Column>> {
        let mut stmt = self.conn.prepare(&format!(
            "{COLUMN_SELECT_SQL} WHERE table_id = ?1 AND lower(name) = lower(?2);"
        ))?;
        let mut rows = stmt.query(params![table_id.to_string(), name])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_column_row(row)?));
        }
        Ok(None)
    }

    fn list_columns(&self, table_id: TableId) -> RepoResult<Vec<Column>> {
        let mut stmt = self.conn.prepare(&format!(
            "{COLUMN_SELECT_SQL} WHERE table_id = ?1 ORDER BY column_position ASC, id ASC;"
        ))?;
        let mut rows = stmt.query([table_id.to_string()])?;
        let mut columns = Vec::new();
        while let Some(row) = rows.next()? {
            columns.push(parse_column_row(row)?);
        }
        Ok(columns)
    }

    fn update_column(&self, column: &Column) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE columns
             SET name = ?2,
                 is_required = ?3,
                 validations = ?4,
                 column_position = ?5,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE id = ?1;",
            params![
                column.id.to_string(),
                column.name,
                bool_to_int(column.is_required),
                to_json_text(&column.validations, "columns.validations")?,
                column.column_position,
            ],
        )?;
        if changed == 0 {
            return Err(RepoError::not_found("column", column.id));
        }
        Ok(())
    }

    fn delete_column(&self, id: ColumnId) -> RepoResult<()> {
        self.conn.execute(
            "DELETE FROM column_options WHERE column_id = ?1;",
            [id.to_string()],
        )?;
        let changed = self
            .conn
            .execute("DELETE FROM columns WHERE id = ?1;", [id.to_string()])?;
        if changed == 0 {
            return Err(RepoError::not_found("column", id));
        }
        Ok(())
    }

    fn delete_columns_for_table(&self, table_id: TableId) -> RepoResult<usize> {
        self.conn.execute(
            "DELETE FROM column_options
             WHERE column_id IN (SELECT id FROM columns WHERE table_id = ?1);",
            [table_id.to_string()],
        )?;
        let deleted = self.conn.execute(
            "DELETE FROM columns WHERE table_id = ?1;",
            [table_id.to_string()],
        )?;
        Ok(deleted)
    }

    fn list_columns_referencing_table(&self, table_id: TableId) -> RepoResult<Vec<Column>> {
        let mut stmt = self.conn.prepare(&format!(
            "{COLUMN_SELECT_SQL}
             WHERE foreign_table_id = ?1
               AND table_id IS NOT NULL
             ORDER BY table_id ASC, column_position ASC;"
        ))?;
        let mut rows = stmt.query([table_id.to_string()])?;
        let mut columns = Vec::new();
        while let Some(row) = rows.next()? {
            columns.push(parse_column_row(row)?);
        }
        Ok(columns)
    }

    fn retarget_foreign_column(
        &self,
        table_id: TableId,
        old_name: &str,
        new_name: &str,
    ) -> RepoResult<usize> {
        let changed = self.conn.execute(
            "UPDATE columns
             SET foreign_column_name = ?3,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE foreign_table_id = ?1
               AND lower(foreign_column_name) = lower(?2);",
            params![table_id.to_string(), old_name, new_name],
        )?;
        Ok(changed)
    }

    fn replace_options(&self, column_id: ColumnId, options: &[ColumnOption]) -> RepoResult<()> {
        self.conn.execute(
            "DELETE FROM column_options WHERE column_id = ?1;",
            [column_id.to_string()],
        )?;
        for option in options {
            self.conn.execute(
                "INSERT INTO column_options (id, column_id, option_value, option_label, option_order)
                 VALUES (?1, ?2, ?3, ?4, ?5);",
                params![
                    option.id.to_string(),
                    column_id.to_string(),
                    option.option_value,
                    option.option_label,
                    option.option_order,
                ],
            )?;
        }
        Ok(())
    }

    fn list_options(&self, column_id: ColumnId) -> RepoResult<Vec<ColumnOption>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, column_id, option_value, option_label, option_order
             FROM column_options
             WHERE column_id = ?1
             ORDER BY option_order ASC, id ASC;",
        )?;
        let mut rows = stmt.query([column_id.to_string()])?;
        let mut options = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get("id")?;
            let column_id: String = row.get("column_id")?;
            options.push(ColumnOption {
                id: parse_uuid(&id, "column_options.id")?,
                column_id: parse_uuid(&column_id, "column_options.column_id")?,
                option_value: row.get("option_value")?,
                option_label: row.get("option_label")?,
                option_order: row.get("option_order")?,
            });
        }
        Ok(options)
    }
}

/// Returns whether a table row exists, without loading it.
pub(crate) fn table_exists(conn: &Connection, id: TableId) -> RepoResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM logical_tables WHERE id = ?1;",
            [id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn parse_module_row(row: &Row<'_>) -> RepoResult<Module> {
    let id: String = row.get("id")?;
    Ok(Module {
        id: parse_uuid(&id, "modules.id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        icon: row.get("icon")?,
        position: row.get("position")?,
    })
}

fn parse_table_row(row: &Row<'_>) -> RepoResult<LogicalTable> {
    let id: String = row.get("id")?;
    Ok(LogicalTable {
        id: parse_uuid(&id, "logical_tables.id")?,
        module_id: parse_optional_uuid(row.get("module_id")?, "logical_tables.module_id")?,
        name: row.get("name")?,
        alias: row.get("alias")?,
        description: row.get("description")?,
        position: row.get("position")?,
    })
}

fn parse_column_row(row: &Row<'_>) -> RepoResult<Column> {
    let id: String = row.get("id")?;
    let table_id: Option<String> = row.get("table_id")?;
    let table_id = table_id
        .ok_or_else(|| RepoError::InvalidData(format!("column {id} is detached from its table")))?;
    let data_type: String = row.get("data_type")?;
    let foreign_table_id =
        parse_optional_uuid(row.get("foreign_table_id")?, "columns.foreign_table_id")?;
    let column_type = ColumnType::from_parts(
        &data_type,
        parse_bool(row.get("allow_multiple")?, "columns.allow_multiple")?,
        foreign_table_id,
        row.get("foreign_column_name")?,
    )
    .map_err(|message| RepoError::InvalidData(format!("column {id}: {message}")))?;
    let validations: String = row.get("validations")?;

    Ok(Column {
        id: parse_uuid(&id, "columns.id")?,
        table_id: parse_uuid(&table_id, "columns.table_id")?,
        name: row.get("name")?,
        column_type,
        is_required: parse_bool(row.get("is_required")?, "columns.is_required")?,
        validations: from_json_text(&validations, "columns.validations")?,
        column_position: row.get("column_position")?,
        created_by: row.get("created_by")?,
    })
}
