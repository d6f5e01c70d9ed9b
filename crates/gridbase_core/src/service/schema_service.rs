//! Schema registry use-case service.
//!
//! # Responsibility
//! - Create, update, reorder and delete modules, logical tables, columns and
//!   select options.
//! - Keep records, views and notifications consistent with schema changes.
//!
//! # Invariants
//! - Table names are unique case-insensitively; column names are unique
//!   case-insensitively per table.
//! - Foreign-key columns always point at an existing table and column.
//! - A column or table still targeted by a foreign key elsewhere cannot be
//!   deleted.
//! - Every mutation runs in one immediate transaction; a failure rolls back
//!   all of it, cascades included.

use crate::db::begin_immediate;
use crate::error::{CoreError, CoreResult};
use crate::model::notification::NotificationScope;
use crate::model::schema::{
    normalize_column_name, normalize_name, Column, ColumnId, ColumnOption, ColumnOptionSpec,
    ColumnSpec, ColumnType, ColumnUpdate, LogicalTable, Module, ModuleId, ModuleSpec,
    ModuleUpdate, TableId, TableUpdate,
};
use crate::repo::notification_repo::{NotificationRepository, SqliteNotificationRepository};
use crate::repo::permission_repo::{PermissionRepository, SqlitePermissionRepository};
use crate::repo::position_repo::{compact_positions, next_position, SiblingSet};
use crate::repo::record_repo::{
    RecordListFilter, RecordPredicate, RecordRepository, SqliteRecordRepository,
};
use crate::repo::schema_repo::{SchemaRepository, SqliteSchemaRepository};
use crate::repo::view_repo::{SqliteViewRepository, ViewRepository};
use crate::service::ordering_service;
use crate::service::view_service::{prune_column_refs, rename_column_refs};
use log::info;
use rusqlite::Connection;
use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

/// Dependents removed or detached by a table delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableDeleteReport {
    pub cascade: bool,
    pub columns: usize,
    /// Deleted on cascade, detached otherwise.
    pub records: usize,
    /// Deleted on cascade, detached otherwise.
    pub views: usize,
    pub permissions: usize,
    pub notifications_deactivated: usize,
    pub subscriptions_deactivated: usize,
}

/// Schema registry facade over one connection.
pub struct SchemaRegistry<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SchemaRegistry<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    fn repo(&self) -> CoreResult<SqliteSchemaRepository<'conn>> {
        Ok(SqliteSchemaRepository::try_new(self.conn)?)
    }

    // Modules

    pub fn create_module(&self, spec: ModuleSpec) -> CoreResult<Module> {
        let tx = begin_immediate(self.conn)?;
        let module = Module {
            id: Uuid::new_v4(),
            name: normalize_name(&spec.name, "module").map_err(CoreError::Validation)?,
            description: spec.description,
            icon: spec.icon,
            position: next_position(&tx, SiblingSet::Modules)?,
        };
        SqliteSchemaRepository::try_new(&tx)?.insert_module(&module)?;
        tx.commit()?;
        info!(
            "event=module_create module=schema status=ok module_id={}",
            module.id
        );
        Ok(module)
    }

    pub fn get_module(&self, module_id: ModuleId) -> CoreResult<Module> {
        self.repo()?
            .get_module(module_id)?
            .ok_or_else(|| CoreError::not_found("module", module_id))
    }

    pub fn list_modules(&self) -> CoreResult<Vec<Module>> {
        Ok(self.repo()?.list_modules()?)
    }

    pub fn update_module(&self, module_id: ModuleId, update: ModuleUpdate) -> CoreResult<Module> {
        let tx = begin_immediate(self.conn)?;
        let repo = SqliteSchemaRepository::try_new(&tx)?;
        let mut module = repo
            .get_module(module_id)?
            .ok_or_else(|| CoreError::not_found("module", module_id))?;
        if let Some(name) = update.name {
            module.name = normalize_name(&name, "module").map_err(CoreError::Validation)?;
        }
        if let Some(description) = update.description {
            module.description = non_blank(description);
        }
        if let Some(icon) = update.icon {
            module.icon = non_blank(icon);
        }
        repo.update_module(&module)?;
        tx.commit()?;
        Ok(module)
    }

    /// Deletes a module; its tables move to the unassigned group.
    pub fn delete_module(&self, module_id: ModuleId) -> CoreResult<()> {
        let tx = begin_immediate(self.conn)?;
        SqliteSchemaRepository::try_new(&tx)?.delete_module(module_id)?;
        compact_positions(&tx, SiblingSet::Tables { module_id: None })?;
        compact_positions(&tx, SiblingSet::Modules)?;
        tx.commit()?;
        info!("event=module_delete module=schema status=ok module_id={module_id}");
        Ok(())
    }

    pub fn reorder_modules(&self, ordered_ids: &[ModuleId]) -> CoreResult<()> {
        ordering_service::reorder(self.conn, SiblingSet::Modules, ordered_ids)?;
        Ok(())
    }

    // Tables

    /// Creates a logical table; `ConflictError` when the name is taken.
    pub fn create_table(
        &self,
        module_id: Option<ModuleId>,
        name: &str,
        description: Option<&str>,
    ) -> CoreResult<LogicalTable> {
        let tx = begin_immediate(self.conn)?;
        let repo = SqliteSchemaRepository::try_new(&tx)?;
        if let Some(module_id) = module_id {
            repo.get_module(module_id)?
                .ok_or_else(|| CoreError::not_found("module", module_id))?;
        }
        let name = normalize_name(name, "table").map_err(CoreError::Validation)?;
        if repo.find_table_by_name(&name)?.is_some() {
            return Err(CoreError::Conflict(format!("table `{name}` already exists")));
        }

        let table = LogicalTable {
            id: Uuid::new_v4(),
            module_id,
            name,
            alias: None,
            description: description.map(str::to_string).and_then(non_blank),
            position: next_position(&tx, SiblingSet::Tables { module_id })?,
        };
        repo.insert_table(&table)?;
        tx.commit()?;
        info!(
            "event=table_create module=schema status=ok table_id={}",
            table.id
        );
        Ok(table)
    }

    pub fn get_table(&self, table_id: TableId) -> CoreResult<LogicalTable> {
        self.repo()?
            .get_table(table_id)?
            .ok_or_else(|| CoreError::not_found("table", table_id))
    }

    /// Lists tables of a module, or unassigned tables for `None`.
    pub fn list_tables(&self, module_id: Option<ModuleId>) -> CoreResult<Vec<LogicalTable>> {
        let repo = self.repo()?;
        if let Some(module_id) = module_id {
            repo.get_module(module_id)?
                .ok_or_else(|| CoreError::not_found("module", module_id))?;
        }
        Ok(repo.list_tables(module_id)?)
    }

    pub fn update_table(&self, table_id: TableId, update: TableUpdate) -> CoreResult<LogicalTable> {
        let tx = begin_immediate(self.conn)?;
        let repo = SqliteSchemaRepository::try_new(&tx)?;
        let mut table = repo
            .get_table(table_id)?
            .ok_or_else(|| CoreError::not_found("table", table_id))?;

        if let Some(name) = update.name {
            let name = normalize_name(&name, "table").map_err(CoreError::Validation)?;
            if let Some(existing) = repo.find_table_by_name(&name)? {
                if existing.id != table_id {
                    return Err(CoreError::Conflict(format!("table `{name}` already exists")));
                }
            }
            table.name = name;
        }
        if let Some(alias) = update.alias {
            table.alias = non_blank(alias);
        }
        if let Some(description) = update.description {
            table.description = non_blank(description);
        }

        let previous_module = table.module_id;
        let moved = matches!(update.module_id, Some(target) if target != previous_module);
        if let (true, Some(target)) = (moved, update.module_id) {
            if let Some(module_id) = target {
                repo.get_module(module_id)?
                    .ok_or_else(|| CoreError::not_found("module", module_id))?;
            }
            table.module_id = target;
            table.position = next_position(&tx, SiblingSet::Tables { module_id: target })?;
        }

        repo.update_table(&table)?;
        if moved {
            compact_positions(
                &tx,
                SiblingSet::Tables {
                    module_id: previous_module,
                },
            )?;
        }
        tx.commit()?;
        info!("event=table_update module=schema status=ok table_id={table_id}");
        Ok(table)
    }

    /// Deletes a table.
    ///
    /// With `cascade` the table's columns, options, records, views and
    /// permissions are removed. Without it records and views are kept with
    /// no table reference, while columns, options and permissions are
    /// removed. Either way its notifications and subscriptions are
    /// deactivated and its audit history is kept.
    pub fn delete_table(&self, table_id: TableId, cascade: bool) -> CoreResult<TableDeleteReport> {
        let tx = begin_immediate(self.conn)?;
        let schema = SqliteSchemaRepository::try_new(&tx)?;
        let table = schema
            .get_table(table_id)?
            .ok_or_else(|| CoreError::not_found("table", table_id))?;

        let blocking: Vec<String> = schema
            .list_columns_referencing_table(table_id)?
            .into_iter()
            .filter(|column| column.table_id != table_id)
            .map(|column| format!("{}:{}", column.table_id, column.name))
            .collect();
        if !blocking.is_empty() {
            return Err(CoreError::Conflict(format!(
                "table `{}` is referenced by foreign-key columns [{}]",
                table.name,
                blocking.join(", ")
            )));
        }

        let records = SqliteRecordRepository::try_new(&tx)?;
        let views = SqliteViewRepository::try_new(&tx)?;
        let notifications = SqliteNotificationRepository::try_new(&tx)?;
        let mut report = TableDeleteReport {
            cascade,
            ..TableDeleteReport::default()
        };
        if cascade {
            report.records = records.delete_for_table(table_id)?;
            report.views = views.delete_for_table(table_id)?;
        } else {
            report.records = records.detach_for_table(table_id)?;
            report.views = views.detach_for_table(table_id)?;
        }
        report.columns = schema.delete_columns_for_table(table_id)?;
        report.permissions = SqlitePermissionRepository::try_new(&tx)?.delete_for_table(table_id)?;
        report.notifications_deactivated =
            notifications.deactivate_scope(NotificationScope::Table(table_id))?;
        report.subscriptions_deactivated =
            notifications.deactivate_subscriptions_for_table(table_id)?;
        schema.delete_table(table_id)?;
        compact_positions(
            &tx,
            SiblingSet::Tables {
                module_id: table.module_id,
            },
        )?;
        tx.commit()?;

        info!(
            "event=table_delete module=schema status=ok table_id={} cascade={} columns={} records={} views={} permissions={}",
            table_id, cascade, report.columns, report.records, report.views, report.permissions
        );
        Ok(report)
    }

    pub fn reorder_tables(
        &self,
        module_id: Option<ModuleId>,
        ordered_ids: &[TableId],
    ) -> CoreResult<()> {
        if let Some(module_id) = module_id {
            self.get_module(module_id)?;
        }
        ordering_service::reorder(self.conn, SiblingSet::Tables { module_id }, ordered_ids)?;
        Ok(())
    }

    // Columns

    /// Adds a column at the end of the table.
    ///
    /// Foreign-key columns must target an existing table and one of its
    /// active columns, else `ReferenceError`.
    pub fn add_column(&self, table_id: TableId, spec: ColumnSpec) -> CoreResult<Column> {
        let tx = begin_immediate(self.conn)?;
        let repo = SqliteSchemaRepository::try_new(&tx)?;
        repo.get_table(table_id)?
            .ok_or_else(|| CoreError::not_found("table", table_id))?;

        let name = normalize_column_name(&spec.name).map_err(CoreError::Validation)?;
        if repo.find_column_by_name(table_id, &name)?.is_some() {
            return Err(CoreError::Conflict(format!(
                "column `{name}` already exists in table {table_id}"
            )));
        }
        spec.validations.check().map_err(CoreError::Validation)?;

        let column_type = match spec.column_type {
            ColumnType::ForeignKey {
                table_id: target_table,
                column_name,
            } => {
                repo.get_table(target_table)?.ok_or_else(|| {
                    CoreError::Reference(format!("foreign table {target_table} does not exist"))
                })?;
                let target = repo
                    .find_column_by_name(target_table, &column_name)?
                    .ok_or_else(|| {
                        CoreError::Reference(format!(
                            "foreign column `{column_name}` does not exist in table {target_table}"
                        ))
                    })?;
                ColumnType::ForeignKey {
                    table_id: target_table,
                    column_name: target.name,
                }
            }
            other => other,
        };
        if !spec.options.is_empty() && !matches!(column_type, ColumnType::Select { .. }) {
            return Err(CoreError::Validation(format!(
                "options are only allowed on select columns, `{name}` is {}",
                column_type.data_type()
            )));
        }
        if spec.is_required {
            let existing = SqliteRecordRepository::try_new(&tx)?.count_records(table_id, &[])?;
            if existing > 0 {
                return Err(CoreError::Conflict(format!(
                    "cannot add required column `{name}` to a table with {existing} records"
                )));
            }
        }

        let column = Column {
            id: Uuid::new_v4(),
            table_id,
            name,
            column_type,
            is_required: spec.is_required,
            validations: spec.validations,
            column_position: next_position(&tx, SiblingSet::Columns { table_id })?,
            created_by: spec.created_by,
        };
        let options = build_options(column.id, spec.options)?;
        repo.insert_column(&column)?;
        repo.replace_options(column.id, &options)?;
        tx.commit()?;
        info!(
            "event=column_add module=schema status=ok table_id={} column_id={} data_type={}",
            table_id,
            column.id,
            column.column_type.data_type()
        );
        Ok(column)
    }

    pub fn get_column(&self, column_id: ColumnId) -> CoreResult<Column> {
        self.repo()?
            .get_column(column_id)?
            .ok_or_else(|| CoreError::not_found("column", column_id))
    }

    /// Active columns of a table by position.
    pub fn list_columns(&self, table_id: TableId) -> CoreResult<Vec<Column>> {
        let repo = self.repo()?;
        repo.get_table(table_id)?
            .ok_or_else(|| CoreError::not_found("table", table_id))?;
        Ok(repo.list_columns(table_id)?)
    }

    /// Renames, toggles required, or replaces validations.
    ///
    /// A rename carries record keys, view references, foreign-key targets
    /// and scheduled notifications along.
    pub fn update_column(&self, column_id: ColumnId, update: ColumnUpdate) -> CoreResult<Column> {
        let tx = begin_immediate(self.conn)?;
        let schema = SqliteSchemaRepository::try_new(&tx)?;
        let records = SqliteRecordRepository::try_new(&tx)?;
        let mut column = schema
            .get_column(column_id)?
            .ok_or_else(|| CoreError::not_found("column", column_id))?;
        let table_id = column.table_id;
        let old_name = column.name.clone();

        if let Some(name) = update.name {
            let name = normalize_column_name(&name).map_err(CoreError::Validation)?;
            if let Some(existing) = schema.find_column_by_name(table_id, &name)? {
                if existing.id != column_id {
                    return Err(CoreError::Conflict(format!(
                        "column `{name}` already exists in table {table_id}"
                    )));
                }
            }
            column.name = name;
        }
        if let Some(validations) = update.validations {
            validations.check().map_err(CoreError::Validation)?;
            column.validations = validations;
        }
        if update.is_required == Some(true) && !column.is_required {
            let total = records.count_records(table_id, &[])?;
            let filled = records.count_with_value(table_id, &old_name)?;
            if filled < total {
                return Err(CoreError::Conflict(format!(
                    "{} records have no value for `{old_name}`",
                    total - filled
                )));
            }
        }
        if let Some(is_required) = update.is_required {
            column.is_required = is_required;
        }

        schema.update_column(&column)?;
        if column.name != old_name {
            records.rename_key(table_id, &old_name, &column.name)?;
            rename_column_refs(&tx, table_id, &old_name, &column.name)?;
            schema.retarget_foreign_column(table_id, &old_name, &column.name)?;
            SqliteNotificationRepository::try_new(&tx)?.rename_column(
                table_id,
                &old_name,
                &column.name,
            )?;
        }
        tx.commit()?;
        info!("event=column_update module=schema status=ok column_id={column_id}");
        Ok(column)
    }

    /// Deletes a column.
    ///
    /// Fails with `ConflictError` when a foreign key targets the column, or
    /// when records hold a value for it and `force` is false. With `force`
    /// the key is stripped from every record. Returns the stripped count.
    pub fn delete_column(&self, column_id: ColumnId, force: bool) -> CoreResult<usize> {
        let tx = begin_immediate(self.conn)?;
        let schema = SqliteSchemaRepository::try_new(&tx)?;
        let records = SqliteRecordRepository::try_new(&tx)?;
        let column = schema
            .get_column(column_id)?
            .ok_or_else(|| CoreError::not_found("column", column_id))?;
        let table_id = column.table_id;

        let referencing = schema
            .list_columns_referencing_table(table_id)?
            .into_iter()
            .find(|other| {
                other.id != column_id
                    && other
                        .column_type
                        .foreign_target()
                        .is_some_and(|(_, name)| name.eq_ignore_ascii_case(&column.name))
            });
        if let Some(other) = referencing {
            return Err(CoreError::Conflict(format!(
                "column `{}` is referenced by foreign key `{}` of table {}",
                column.name, other.name, other.table_id
            )));
        }

        let in_use = records.count_with_value(table_id, &column.name)?;
        if in_use > 0 && !force {
            return Err(CoreError::Conflict(format!(
                "{in_use} records hold a value for column `{}`",
                column.name
            )));
        }

        let stripped = records.strip_key(table_id, &column.name)?;
        prune_column_refs(&tx, table_id, &column.name)?;
        SqliteNotificationRepository::try_new(&tx)?
            .deactivate_for_column(table_id, &column.name)?;
        schema.delete_column(column_id)?;
        compact_positions(&tx, SiblingSet::Columns { table_id })?;
        tx.commit()?;
        info!(
            "event=column_delete module=schema status=ok column_id={} force={} stripped={}",
            column_id, force, stripped
        );
        Ok(stripped)
    }

    pub fn reorder_columns(&self, table_id: TableId, ordered_ids: &[ColumnId]) -> CoreResult<()> {
        let tx = begin_immediate(self.conn)?;
        SqliteSchemaRepository::try_new(&tx)?
            .get_table(table_id)?
            .ok_or_else(|| CoreError::not_found("table", table_id))?;
        let merged =
            ordering_service::reorder_in(&tx, SiblingSet::Columns { table_id }, ordered_ids)?;
        tx.commit()?;
        info!(
            "event=reorder module=ordering status=ok set=columns:{} count={}",
            table_id,
            merged.len()
        );
        Ok(())
    }

    /// Returns whether `name` is free in the table, ignoring `exclude`.
    pub fn is_column_name_available(
        &self,
        table_id: TableId,
        name: &str,
        exclude: Option<ColumnId>,
    ) -> CoreResult<bool> {
        let name = normalize_column_name(name).map_err(CoreError::Validation)?;
        let repo = self.repo()?;
        repo.get_table(table_id)?
            .ok_or_else(|| CoreError::not_found("table", table_id))?;
        Ok(match repo.find_column_by_name(table_id, &name)? {
            Some(existing) => Some(existing.id) == exclude,
            None => true,
        })
    }

    /// Returns whether any record holds a value for the column.
    pub fn column_has_records(&self, column_id: ColumnId) -> CoreResult<bool> {
        let column = self.get_column(column_id)?;
        let count = SqliteRecordRepository::try_new(self.conn)?
            .count_with_value(column.table_id, &column.name)?;
        Ok(count > 0)
    }

    pub fn list_options(&self, column_id: ColumnId) -> CoreResult<Vec<ColumnOption>> {
        let repo = self.repo()?;
        repo.get_column(column_id)?
            .ok_or_else(|| CoreError::not_found("column", column_id))?;
        Ok(repo.list_options(column_id)?)
    }

    /// Replaces the options of a select column.
    ///
    /// Dropping a value still stored in some record is a `ConflictError`.
    pub fn replace_options(
        &self,
        column_id: ColumnId,
        specs: Vec<ColumnOptionSpec>,
    ) -> CoreResult<Vec<ColumnOption>> {
        let tx = begin_immediate(self.conn)?;
        let schema = SqliteSchemaRepository::try_new(&tx)?;
        let column = schema
            .get_column(column_id)?
            .ok_or_else(|| CoreError::not_found("column", column_id))?;
        let ColumnType::Select { multiple } = column.column_type else {
            return Err(CoreError::Validation(format!(
                "column `{}` is not a select column",
                column.name
            )));
        };

        let options = build_options(column_id, specs)?;
        let kept: HashSet<&str> = options
            .iter()
            .map(|option| option.option_value.as_str())
            .collect();
        let records = SqliteRecordRepository::try_new(&tx)?;
        for removed in schema.list_options(column_id)? {
            if kept.contains(removed.option_value.as_str()) {
                continue;
            }
            let predicate = if multiple {
                RecordPredicate::HasElement(removed.option_value.clone())
            } else {
                RecordPredicate::Equals(Value::String(removed.option_value.clone()))
            };
            let filter = RecordListFilter {
                column: column.name.clone(),
                predicate,
            };
            let used = records.count_records(column.table_id, std::slice::from_ref(&filter))?;
            if used > 0 {
                return Err(CoreError::Conflict(format!(
                    "option `{}` is used by {used} records",
                    removed.option_value
                )));
            }
        }

        schema.replace_options(column_id, &options)?;
        tx.commit()?;
        Ok(options)
    }
}

fn build_options(column_id: ColumnId, specs: Vec<ColumnOptionSpec>) -> CoreResult<Vec<ColumnOption>> {
    let mut seen = HashSet::new();
    let mut options = Vec::with_capacity(specs.len());
    for (index, spec) in specs.into_iter().enumerate() {
        let value = spec.value.trim().to_string();
        if value.is_empty() {
            return Err(CoreError::Validation(
                "option value must not be blank".to_string(),
            ));
        }
        if !seen.insert(value.clone()) {
            return Err(CoreError::Validation(format!(
                "option `{value}` is listed more than once"
            )));
        }
        let label = spec
            .label
            .and_then(non_blank)
            .unwrap_or_else(|| value.clone());
        options.push(ColumnOption {
            id: Uuid::new_v4(),
            column_id,
            option_value: value,
            option_label: label,
            option_order: index as i64 + 1,
        });
    }
    Ok(options)
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
