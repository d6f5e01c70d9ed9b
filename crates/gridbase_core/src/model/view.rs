//! Saved view presets.
//!
//! # Invariants
//! - Views never hold references to columns that are no longer active once
//!   `retain_columns` has been applied.

use crate::model::record::{RecordFilter, RecordQuery, SortSpec};
use crate::model::schema::TableId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

pub type ViewId = Uuid;

/// Saved sort/filter/visible-column preset for a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct View {
    pub id: ViewId,
    /// `None` once the owning table was deleted without cascade.
    pub table_id: Option<TableId>,
    pub name: String,
    pub sort_config: Vec<SortSpec>,
    pub filter_config: Vec<RecordFilter>,
    pub visible_columns: Vec<String>,
    pub position: i64,
    pub created_by: String,
}

impl View {
    /// Drops sort, filter and visibility entries naming inactive columns.
    ///
    /// Returns `true` when anything was removed.
    pub fn retain_columns(&mut self, active: &HashSet<String>) -> bool {
        let before = (
            self.sort_config.len(),
            self.filter_config.len(),
            self.visible_columns.len(),
        );
        self.sort_config.retain(|sort| active.contains(&sort.column));
        self.filter_config
            .retain(|filter| active.contains(&filter.column));
        self.visible_columns.retain(|name| active.contains(name));
        before
            != (
                self.sort_config.len(),
                self.filter_config.len(),
                self.visible_columns.len(),
            )
    }

    /// Rewrites references after a column rename. Returns `true` on change.
    pub fn rename_column(&mut self, old_name: &str, new_name: &str) -> bool {
        let mut changed = false;
        for sort in &mut self.sort_config {
            if sort.column == old_name {
                sort.column = new_name.to_string();
                changed = true;
            }
        }
        for filter in &mut self.filter_config {
            if filter.column == old_name {
                filter.column = new_name.to_string();
                changed = true;
            }
        }
        for name in &mut self.visible_columns {
            if name == old_name {
                *name = new_name.to_string();
                changed = true;
            }
        }
        changed
    }

    /// Builds a record query applying this view's sort and filters.
    pub fn record_query(&self, page: u32, page_size: Option<u32>) -> RecordQuery {
        RecordQuery {
            page,
            page_size,
            filters: self.filter_config.clone(),
            sort: self.sort_config.clone(),
        }
    }
}

/// Input for view creation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewSpec {
    pub name: String,
    pub sort_config: Vec<SortSpec>,
    pub filter_config: Vec<RecordFilter>,
    pub visible_columns: Vec<String>,
    pub created_by: String,
}

/// Partial view update. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewUpdate {
    pub name: Option<String>,
    pub sort_config: Option<Vec<SortSpec>>,
    pub filter_config: Option<Vec<RecordFilter>>,
    pub visible_columns: Option<Vec<String>>,
}
