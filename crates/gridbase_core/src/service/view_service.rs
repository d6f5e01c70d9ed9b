//! Saved view presets per logical table.
//!
//! # Invariants
//! - Stored views only reference columns that were active when written.
//! - Reads sanitize against the current active columns, so a view never
//!   surfaces a reference to a removed column.

use crate::db::begin_immediate;
use crate::error::{CoreError, CoreResult};
use crate::model::schema::{normalize_name, TableId};
use crate::model::view::{View, ViewId, ViewSpec, ViewUpdate};
use crate::repo::position_repo::{compact_positions, next_position, SiblingSet};
use crate::repo::schema_repo::{SchemaRepository, SqliteSchemaRepository};
use crate::repo::view_repo::{SqliteViewRepository, ViewRepository};
use crate::service::ordering_service;
use log::info;
use rusqlite::Connection;
use std::collections::HashSet;
use uuid::Uuid;

pub struct ViewRegistry<'conn> {
    conn: &'conn Connection,
}

impl<'conn> ViewRegistry<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    pub fn create_view(&self, table_id: TableId, spec: ViewSpec) -> CoreResult<View> {
        let tx = begin_immediate(self.conn)?;
        let active = active_column_names(&tx, table_id)?;
        let mut view = View {
            id: Uuid::new_v4(),
            table_id: Some(table_id),
            name: normalize_name(&spec.name, "view").map_err(CoreError::Validation)?,
            sort_config: spec.sort_config,
            filter_config: spec.filter_config,
            visible_columns: spec.visible_columns,
            position: next_position(&tx, SiblingSet::Views { table_id })?,
            created_by: spec.created_by,
        };
        ensure_known_columns(&view, &active)?;
        view.visible_columns = dedup(view.visible_columns);

        SqliteViewRepository::try_new(&tx)?.insert_view(&view)?;
        tx.commit()?;
        info!(
            "event=view_create module=view status=ok view_id={} table_id={}",
            view.id, table_id
        );
        Ok(view)
    }

    /// Loads a view sanitized against its table's active columns.
    pub fn get_view(&self, view_id: ViewId) -> CoreResult<View> {
        let mut view = SqliteViewRepository::try_new(self.conn)?
            .get_view(view_id)?
            .ok_or_else(|| CoreError::not_found("view", view_id))?;
        if let Some(table_id) = view.table_id {
            view.retain_columns(&active_column_names(self.conn, table_id)?);
        }
        Ok(view)
    }

    pub fn list_views(&self, table_id: TableId) -> CoreResult<Vec<View>> {
        let active = active_column_names(self.conn, table_id)?;
        let mut views = SqliteViewRepository::try_new(self.conn)?.list_views(table_id)?;
        for view in &mut views {
            view.retain_columns(&active);
        }
        Ok(views)
    }

    pub fn update_view(&self, view_id: ViewId, update: ViewUpdate) -> CoreResult<View> {
        let tx = begin_immediate(self.conn)?;
        let repo = SqliteViewRepository::try_new(&tx)?;
        let mut view = repo
            .get_view(view_id)?
            .ok_or_else(|| CoreError::not_found("view", view_id))?;
        let table_id = view
            .table_id
            .ok_or_else(|| CoreError::Conflict(format!("view {view_id} has no table")))?;

        let active = active_column_names(&tx, table_id)?;
        view.retain_columns(&active);
        if let Some(name) = update.name {
            view.name = normalize_name(&name, "view").map_err(CoreError::Validation)?;
        }
        if let Some(sort_config) = update.sort_config {
            view.sort_config = sort_config;
        }
        if let Some(filter_config) = update.filter_config {
            view.filter_config = filter_config;
        }
        if let Some(visible_columns) = update.visible_columns {
            view.visible_columns = dedup(visible_columns);
        }
        ensure_known_columns(&view, &active)?;
        repo.update_view(&view)?;
        tx.commit()?;
        info!("event=view_update module=view status=ok view_id={view_id}");
        Ok(view)
    }

    pub fn delete_view(&self, view_id: ViewId) -> CoreResult<()> {
        let tx = begin_immediate(self.conn)?;
        let repo = SqliteViewRepository::try_new(&tx)?;
        let view = repo
            .get_view(view_id)?
            .ok_or_else(|| CoreError::not_found("view", view_id))?;
        repo.delete_view(view_id)?;
        if let Some(table_id) = view.table_id {
            compact_positions(&tx, SiblingSet::Views { table_id })?;
        }
        tx.commit()?;
        info!("event=view_delete module=view status=ok view_id={view_id}");
        Ok(())
    }

    pub fn reorder_views(&self, table_id: TableId, ordered_ids: &[ViewId]) -> CoreResult<()> {
        let tx = begin_immediate(self.conn)?;
        ensure_table(&tx, table_id)?;
        ordering_service::reorder_in(&tx, SiblingSet::Views { table_id }, ordered_ids)?;
        tx.commit()?;
        Ok(())
    }
}

/// Removes references to `column_name` from every view of the table.
pub(crate) fn prune_column_refs(
    conn: &Connection,
    table_id: TableId,
    column_name: &str,
) -> CoreResult<usize> {
    let repo = SqliteViewRepository::try_new(conn)?;
    let mut touched = 0;
    for mut view in repo.list_views(table_id)? {
        let keep: HashSet<String> = view
            .visible_columns
            .iter()
            .chain(view.sort_config.iter().map(|sort| &sort.column))
            .chain(view.filter_config.iter().map(|filter| &filter.column))
            .filter(|name| name.as_str() != column_name)
            .cloned()
            .collect();
        if view.retain_columns(&keep) {
            repo.update_view(&view)?;
            touched += 1;
        }
    }
    Ok(touched)
}

/// Follows a column rename in every view of the table.
pub(crate) fn rename_column_refs(
    conn: &Connection,
    table_id: TableId,
    old_name: &str,
    new_name: &str,
) -> CoreResult<usize> {
    let repo = SqliteViewRepository::try_new(conn)?;
    let mut touched = 0;
    for mut view in repo.list_views(table_id)? {
        if view.rename_column(old_name, new_name) {
            repo.update_view(&view)?;
            touched += 1;
        }
    }
    Ok(touched)
}

fn ensure_table(conn: &Connection, table_id: TableId) -> CoreResult<()> {
    SqliteSchemaRepository::try_new(conn)?
        .get_table(table_id)?
        .map(|_| ())
        .ok_or_else(|| CoreError::not_found("table", table_id))
}

fn active_column_names(conn: &Connection, table_id: TableId) -> CoreResult<HashSet<String>> {
    ensure_table(conn, table_id)?;
    let columns = SqliteSchemaRepository::try_new(conn)?.list_columns(table_id)?;
    Ok(columns.into_iter().map(|column| column.name).collect())
}

fn ensure_known_columns(view: &View, active: &HashSet<String>) -> CoreResult<()> {
    let referenced = view
        .visible_columns
        .iter()
        .chain(view.sort_config.iter().map(|sort| &sort.column))
        .chain(view.filter_config.iter().map(|filter| &filter.column));
    for name in referenced {
        if !active.contains(name) {
            return Err(CoreError::Validation(format!(
                "view references unknown column `{name}`"
            )));
        }
    }
    Ok(())
}

fn dedup(names: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .into_iter()
        .filter(|name| seen.insert(name.clone()))
        .collect()
}
