//! Record store use-case service.
//!
//! # Responsibility
//! - Validate record payloads against the live column schema.
//! - Gate every operation on the actor's permission flags.
//! - Persist records and hand each mutation to the event sinks in the same
//!   transaction.
//!
//! # Invariants
//! - Committed `record_data` keys are a subset of the table's active column
//!   names and every value is coerced to its column type.
//! - Required columns are never missing or empty on committed records.
//! - A sink failure rolls the whole mutation back.

use crate::config::PageLimits;
use crate::db::begin_immediate;
use crate::error::{CoreError, CoreResult};
use crate::model::permission::{Actor, Operation};
use crate::model::record::{
    Record, RecordAction, RecordData, RecordEvent, RecordFilter, RecordId, RecordPage,
    RecordQuery,
};
use crate::model::schema::{Column, ColumnType, ColumnValidations, TableId};
use crate::model::value::{coerce_value, is_empty_value, ValueError};
use crate::repo::now_ms;
use crate::repo::position_repo::{compact_positions, next_position, SiblingSet};
use crate::repo::record_repo::{
    RecordListFilter, RecordListSpec, RecordPredicate, RecordRepository, SqliteRecordRepository,
};
use crate::repo::schema_repo::{SchemaRepository, SqliteSchemaRepository};
use crate::service::audit_service::AuditLogger;
use crate::service::notification_service::NotificationPipeline;
use crate::service::ordering_service;
use crate::service::permission_service::require;
use crate::service::RecordEventSink;
use log::info;
use rusqlite::Connection;
use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

/// Record store facade over one connection.
pub struct RecordStore<'conn> {
    conn: &'conn Connection,
    limits: PageLimits,
    sinks: Vec<Box<dyn RecordEventSink>>,
}

impl<'conn> RecordStore<'conn> {
    /// Creates a store that feeds the notification pipeline and audit log.
    pub fn new(conn: &'conn Connection) -> Self {
        Self {
            conn,
            limits: PageLimits::default(),
            sinks: vec![Box::new(NotificationPipeline), Box::new(AuditLogger)],
        }
    }

    pub fn with_page_limits(mut self, limits: PageLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Registers an additional event sink after the built-in ones.
    pub fn with_sink(mut self, sink: Box<dyn RecordEventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Validates and coerces `record_data` without persisting.
    ///
    /// Returns the canonical payload that would be stored.
    pub fn validate_record(
        &self,
        table_id: TableId,
        record_data: &RecordData,
    ) -> CoreResult<RecordData> {
        validate_in(self.conn, table_id, record_data)
    }

    pub fn create_record(
        &self,
        table_id: TableId,
        record_data: RecordData,
        actor: &Actor,
    ) -> CoreResult<Record> {
        let tx = begin_immediate(self.conn)?;
        ensure_table(&tx, table_id)?;
        require(&tx, actor, table_id, Operation::Create)?;
        let record_data = validate_in(&tx, table_id, &record_data)?;

        let now = now_ms();
        let record = Record {
            id: Uuid::new_v4(),
            table_id: Some(table_id),
            record_data,
            position: next_position(&tx, SiblingSet::Records { table_id })?,
            created_by: actor.user_id.clone(),
            created_at: now,
            updated_at: now,
        };
        SqliteRecordRepository::try_new(&tx)?.insert_record(&record)?;
        self.emit(
            &tx,
            &RecordEvent {
                action: RecordAction::Create,
                table_id,
                record_id: record.id,
                old_data: None,
                new_data: Some(record.record_data.clone()),
                actor: actor.clone(),
                occurred_at: now,
            },
        )?;
        tx.commit()?;
        info!(
            "event=record_create module=record status=ok table_id={} record_id={}",
            table_id, record.id
        );
        Ok(record)
    }

    pub fn get_record(
        &self,
        table_id: TableId,
        record_id: RecordId,
        actor: &Actor,
    ) -> CoreResult<Record> {
        ensure_table(self.conn, table_id)?;
        require(self.conn, actor, table_id, Operation::Read)?;
        load_record(self.conn, table_id, record_id)
    }

    /// Replaces `record_data` wholesale after validating it like a create.
    pub fn update_record(
        &self,
        table_id: TableId,
        record_id: RecordId,
        record_data: RecordData,
        actor: &Actor,
    ) -> CoreResult<Record> {
        let tx = begin_immediate(self.conn)?;
        ensure_table(&tx, table_id)?;
        require(&tx, actor, table_id, Operation::Update)?;
        let existing = load_record(&tx, table_id, record_id)?;
        let record_data = validate_in(&tx, table_id, &record_data)?;

        let repo = SqliteRecordRepository::try_new(&tx)?;
        repo.update_record_data(record_id, &record_data)?;
        let updated = repo
            .get_record(record_id)?
            .ok_or_else(|| CoreError::not_found("record", record_id))?;
        self.emit(
            &tx,
            &RecordEvent {
                action: RecordAction::Update,
                table_id,
                record_id,
                old_data: Some(existing.record_data),
                new_data: Some(record_data),
                actor: actor.clone(),
                occurred_at: now_ms(),
            },
        )?;
        tx.commit()?;
        info!(
            "event=record_update module=record status=ok table_id={} record_id={}",
            table_id, record_id
        );
        Ok(updated)
    }

    pub fn delete_record(
        &self,
        table_id: TableId,
        record_id: RecordId,
        actor: &Actor,
    ) -> CoreResult<()> {
        let tx = begin_immediate(self.conn)?;
        ensure_table(&tx, table_id)?;
        require(&tx, actor, table_id, Operation::Delete)?;
        let existing = load_record(&tx, table_id, record_id)?;

        SqliteRecordRepository::try_new(&tx)?.delete_record(record_id)?;
        compact_positions(&tx, SiblingSet::Records { table_id })?;
        self.emit(
            &tx,
            &RecordEvent {
                action: RecordAction::Delete,
                table_id,
                record_id,
                old_data: Some(existing.record_data),
                new_data: None,
                actor: actor.clone(),
                occurred_at: now_ms(),
            },
        )?;
        tx.commit()?;
        info!(
            "event=record_delete module=record status=ok table_id={} record_id={}",
            table_id, record_id
        );
        Ok(())
    }

    /// Lists one page of records.
    ///
    /// Order is the explicit sort keys, then ascending position. String and
    /// user columns filter by substring, multi-select by element, all other
    /// types by equality of the coerced value.
    pub fn list_records(
        &self,
        table_id: TableId,
        query: &RecordQuery,
        actor: &Actor,
    ) -> CoreResult<RecordPage> {
        ensure_table(self.conn, table_id)?;
        require(self.conn, actor, table_id, Operation::Read)?;

        let schema = SqliteSchemaRepository::try_new(self.conn)?;
        let columns = schema.list_columns(table_id)?;
        let filters = resolve_filters(&schema, &columns, &query.filters)?;
        let known: HashSet<&str> = columns.iter().map(|column| column.name.as_str()).collect();
        if let Some(sort) = query.sort.iter().find(|sort| !known.contains(sort.column.as_str())) {
            return Err(CoreError::Validation(format!(
                "cannot sort by unknown column `{}`",
                sort.column
            )));
        }

        let page = query.page.max(1);
        let page_size = self.limits.clamp(query.page_size);
        let offset = u64::from(page - 1) * u64::from(page_size);
        let repo = SqliteRecordRepository::try_new(self.conn)?;
        let total = repo.count_records(table_id, &filters)?;
        let items = repo.list_records(&RecordListSpec {
            table_id,
            filters: &filters,
            sort: &query.sort,
            limit: page_size,
            offset,
        })?;
        let has_more = offset + (items.len() as u64) < total;
        Ok(RecordPage {
            items,
            page,
            page_size,
            total,
            has_more,
        })
    }

    /// Moves the listed records first, in order; the rest follow.
    pub fn reorder_records(
        &self,
        table_id: TableId,
        ordered_ids: &[RecordId],
        actor: &Actor,
    ) -> CoreResult<()> {
        let tx = begin_immediate(self.conn)?;
        ensure_table(&tx, table_id)?;
        require(&tx, actor, table_id, Operation::Update)?;
        let merged =
            ordering_service::reorder_in(&tx, SiblingSet::Records { table_id }, ordered_ids)?;
        tx.commit()?;
        info!(
            "event=reorder module=ordering status=ok set=records:{} count={}",
            table_id,
            merged.len()
        );
        Ok(())
    }

    fn emit(&self, conn: &Connection, event: &RecordEvent) -> CoreResult<()> {
        for sink in &self.sinks {
            sink.on_record_event(conn, event)?;
        }
        Ok(())
    }
}

fn ensure_table(conn: &Connection, table_id: TableId) -> CoreResult<()> {
    SqliteSchemaRepository::try_new(conn)?
        .get_table(table_id)?
        .map(|_| ())
        .ok_or_else(|| CoreError::not_found("table", table_id))
}

fn load_record(conn: &Connection, table_id: TableId, record_id: RecordId) -> CoreResult<Record> {
    SqliteRecordRepository::try_new(conn)?
        .get_record(record_id)?
        .filter(|record| record.table_id == Some(table_id))
        .ok_or_else(|| CoreError::not_found("record", record_id))
}

pub(crate) fn validate_in(
    conn: &Connection,
    table_id: TableId,
    record_data: &RecordData,
) -> CoreResult<RecordData> {
    let schema = SqliteSchemaRepository::try_new(conn)?;
    schema
        .get_table(table_id)?
        .ok_or_else(|| CoreError::not_found("table", table_id))?;
    let columns = schema.list_columns(table_id)?;

    let known: HashSet<&str> = columns.iter().map(|column| column.name.as_str()).collect();
    let mut unknown: Vec<&str> = record_data
        .keys()
        .map(String::as_str)
        .filter(|key| !known.contains(key))
        .collect();
    if !unknown.is_empty() {
        unknown.sort_unstable();
        return Err(CoreError::Validation(format!(
            "unknown columns [{}]",
            unknown.join(", ")
        )));
    }

    let records = SqliteRecordRepository::try_new(conn)?;
    let mut clean = RecordData::new();
    for column in &columns {
        let value = match record_data.get(&column.name) {
            Some(value) if !is_empty_value(value) => value,
            _ => {
                if column.is_required {
                    return Err(CoreError::Validation(format!(
                        "column `{}` is required",
                        column.name
                    )));
                }
                continue;
            }
        };

        let options = match column.column_type {
            ColumnType::Select { .. } => schema.list_options(column.id)?,
            _ => Vec::new(),
        };
        let coerced =
            coerce_value(column, &options, value).map_err(|err| value_error(column, err))?;

        if let (Some((target_table, target_column)), Value::String(reference)) =
            (column.column_type.foreign_target(), &coerced)
        {
            if !records.reference_exists(target_table, target_column, reference)? {
                return Err(CoreError::Reference(format!(
                    "column `{}` references `{reference}`, which matches no record of table {target_table}",
                    column.name
                )));
            }
        }
        clean.insert(column.name.clone(), coerced);
    }
    Ok(clean)
}

fn resolve_filters(
    schema: &SqliteSchemaRepository<'_>,
    columns: &[Column],
    filters: &[RecordFilter],
) -> CoreResult<Vec<RecordListFilter>> {
    let mut resolved = Vec::with_capacity(filters.len());
    for filter in filters {
        let column = columns
            .iter()
            .find(|column| column.name == filter.column)
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "cannot filter by unknown column `{}`",
                    filter.column
                ))
            })?;
        if is_empty_value(&filter.value) {
            continue;
        }

        let predicate = match column.column_type {
            ColumnType::String | ColumnType::UserLink => {
                RecordPredicate::Contains(value_text(&filter.value))
            }
            ColumnType::Select { multiple: true } => {
                RecordPredicate::HasElement(value_text(&filter.value))
            }
            _ => {
                let options = match column.column_type {
                    ColumnType::Select { .. } => schema.list_options(column.id)?,
                    _ => Vec::new(),
                };
                // Filters match stored values; range and length limits only gate writes.
                let filter_column = Column {
                    validations: ColumnValidations::default(),
                    ..column.clone()
                };
                let value = coerce_value(&filter_column, &options, &filter.value)
                    .map_err(|err| value_error(column, err))?;
                RecordPredicate::Equals(value)
            }
        };
        resolved.push(RecordListFilter {
            column: column.name.clone(),
            predicate,
        });
    }
    Ok(resolved)
}

fn value_error(column: &Column, err: ValueError) -> CoreError {
    match err {
        ValueError::TypeMismatch { expected, message } => CoreError::TypeMismatch {
            column: column.name.clone(),
            expected,
            message,
        },
        ValueError::Invalid(message) => {
            CoreError::Validation(format!("column `{}`: {message}", column.name))
        }
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.trim().to_string(),
        other => other.to_string(),
    }
}
