//! View preset repository contracts and SQLite implementation.

use crate::model::schema::TableId;
use crate::model::view::{View, ViewId};
use crate::repo::{
    ensure_connection_ready, from_json_text, parse_optional_uuid, parse_uuid, to_json_text,
    RepoError, RepoResult,
};
use rusqlite::{params, Connection, Row};

const VIEW_SELECT_SQL: &str = "SELECT
    id,
    table_id,
    name,
    sort_config,
    filter_config,
    visible_columns,
    position,
    created_by
FROM views";

/// Repository interface for saved views.
pub trait ViewRepository {
    fn insert_view(&self, view: &View) -> RepoResult<()>;
    fn get_view(&self, id: ViewId) -> RepoResult<Option<View>>;
    fn list_views(&self, table_id: TableId) -> RepoResult<Vec<View>>;
    /// Rewrites name and configuration; position is owned by ordering.
    fn update_view(&self, view: &View) -> RepoResult<()>;
    fn delete_view(&self, id: ViewId) -> RepoResult<()>;
    fn delete_for_table(&self, table_id: TableId) -> RepoResult<usize>;
    fn detach_for_table(&self, table_id: TableId) -> RepoResult<usize>;
}

/// SQLite-backed view repository.
pub struct SqliteViewRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteViewRepository<'conn> {
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_connection_ready(conn, &["views"])?;
        Ok(Self { conn })
    }
}

impl ViewRepository for SqliteViewRepository<'_> {
    fn insert_view(&self, view: &View) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO views (
                id,
                table_id,
                name,
                sort_config,
                filter_config,
                visible_columns,
                position,
                created_by
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
            params![
                view.id.to_string(),
                view.table_id.map(|value| value.to_string()),
                view.name,
                to_json_text(&view.sort_config, "views.sort_config")?,
                to_json_text(&view.filter_config, "views.filter_config")?,
                to_json_text(&view.visible_columns, "views.visible_columns")?,
                view.position,
                view.created_by,
            ],
        )?;
        Ok(())
    }

    fn get_view(&self, id: ViewId) -> RepoResult<Option<View>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{VIEW_SELECT_SQL} WHERE id = ?1;"))?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_view_row(row)?));
        }
        Ok(None)
    }

    fn list_views(&self, table_id: TableId) -> RepoResult<Vec<View>> {
        let mut stmt = self.conn.prepare(&format!(
            "{VIEW_SELECT_SQL} WHERE table_id = ?1 ORDER BY position ASC, id ASC;"
        ))?;
        let mut rows = stmt.query([table_id.to_string()])?;
        let mut views = Vec::new();
        while let Some(row) = rows.next()? {
            views.push(parse_view_row(row)?);
        }
        Ok(views)
    }

    fn update_view(&self, view: &View) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE views
             SET name = ?2,
                 sort_config = ?3,
                 filter_config = ?4,
                 visible_columns = ?5,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE id = ?1;",
            params![
                view.id.to_string(),
                view.name,
                to_json_text(&view.sort_config, "views.sort_config")?,
                to_json_text(&view.filter_config, "views.filter_config")?,
                to_json_text(&view.visible_columns, "views.visible_columns")?,
            ],
        )?;
        if changed == 0 {
            return Err(RepoError::not_found("view", view.id));
        }
        Ok(())
    }

    fn delete_view(&self, id: ViewId) -> RepoResult<()> {
        let changed = self
            .conn
            .execute("DELETE FROM views WHERE id = ?1;", [id.to_string()])?;
        if changed == 0 {
            return Err(RepoError::not_found("view", id));
        }
        Ok(())
    }

    fn delete_for_table(&self, table_id: TableId) -> RepoResult<usize> {
        let deleted = self
            .conn
            .execute("DELETE FROM views WHERE table_id = ?1;", [table_id.to_string()])?;
        Ok(deleted)
    }

    fn detach_for_table(&self, table_id: TableId) -> RepoResult<usize> {
        let changed = self.conn.execute(
            "UPDATE views
             SET table_id = NULL,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE table_id = ?1;",
            [table_id.to_string()],
        )?;
        Ok(changed)
    }
}

fn parse_view_row(row: &Row<'_>) -> RepoResult<View> {
    let id: String = row.get("id")?;
    let sort_config: String = row.get("sort_config")?;
    let filter_config: String = row.get("filter_config")?;
    let visible_columns: String = row.get("visible_columns")?;
    Ok(View {
        id: parse_uuid(&id, "views.id")?,
        table_id: parse_optional_uuid(row.get("table_id")?, "views.table_id")?,
        name: row.get("name")?,
        sort_config: from_json_text(&sort_config, "views.sort_config")?,
        filter_config: from_json_text(&filter_config, "views.filter_config")?,
        visible_columns: from_json_text(&visible_columns, "views.visible_columns")?,
        position: row.get("position")?,
        created_by: row.get("created_by")?,
    })
}
