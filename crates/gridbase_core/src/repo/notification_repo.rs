//! Scheduled notification, subscription and outbox repository.
//!
//! # Responsibility
//! - Persist scheduled notifications and record subscriptions.
//! - Provide the due-scan and compare-and-swap `mark_sent` used by the scheduler.
//! - Append deliveries to the notification outbox.
//!
//! # Invariants
//! - `mark_sent` only flips rows that are active and unsent; it reports
//!   whether this call performed the flip.
//! - Deactivation only clears `is_active`; no path here deletes rows.

use crate::model::notification::{
    NotificationId, NotificationScope, OutboxEntry, OutboxSource, RecordSubscription,
    ScheduledNotification, SubscriptionId,
};
use crate::model::record::{RecordAction, RecordId};
use crate::model::schema::TableId;
use crate::repo::{
    bool_to_int, ensure_connection_ready, from_json_text, parse_bool, parse_optional_uuid,
    parse_uuid, to_json_text, RepoError, RepoResult,
};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, Row};

const NOTIFICATION_SELECT_SQL: &str = "SELECT
    id,
    table_id,
    record_id,
    column_name,
    target_date,
    notify_before_days,
    title,
    message,
    assigned_user_ids,
    is_active,
    notification_sent,
    sent_at,
    created_by
FROM scheduled_notifications";

const DUE_PREDICATE_SQL: &str = "is_active = 1
    AND notification_sent = 0
    AND target_date - (notify_before_days * 86400000) <= ?";

const SUBSCRIPTION_SELECT_SQL: &str = "SELECT
    id,
    user_id,
    table_id,
    record_id,
    notification_types,
    is_active
FROM record_subscriptions";

/// Repository interface for notification persistence.
pub trait NotificationRepository {
    fn insert_notification(&self, notification: &ScheduledNotification) -> RepoResult<()>;
    fn get_notification(&self, id: NotificationId) -> RepoResult<Option<ScheduledNotification>>;
    fn list_active(&self) -> RepoResult<Vec<ScheduledNotification>>;
    /// Lists every notification of a table, including inactive history.
    fn list_by_table(&self, table_id: TableId) -> RepoResult<Vec<ScheduledNotification>>;
    fn list_by_record(&self, record_id: RecordId) -> RepoResult<Vec<ScheduledNotification>>;
    /// Active, unsent notifications bound to one record date column.
    fn list_pending_for_column(
        &self,
        table_id: TableId,
        record_id: RecordId,
        column_name: &str,
    ) -> RepoResult<Vec<ScheduledNotification>>;
    fn reschedule(&self, id: NotificationId, target_date: DateTime<Utc>) -> RepoResult<()>;
    fn deactivate(&self, id: NotificationId) -> RepoResult<()>;
    fn deactivate_scope(&self, scope: NotificationScope) -> RepoResult<usize>;
    /// Deactivates every active notification bound to one table column.
    fn deactivate_for_column(&self, table_id: TableId, column_name: &str) -> RepoResult<usize>;
    fn rename_column(&self, table_id: TableId, old_name: &str, new_name: &str)
        -> RepoResult<usize>;
    fn list_due_ids(&self, now: DateTime<Utc>, limit: u32) -> RepoResult<Vec<NotificationId>>;
    /// Re-reads one notification only if it is still due and unsent.
    fn load_if_due(
        &self,
        id: NotificationId,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<ScheduledNotification>>;
    fn mark_sent(&self, id: NotificationId, sent_at: DateTime<Utc>) -> RepoResult<bool>;

    fn insert_subscription(&self, subscription: &RecordSubscription) -> RepoResult<()>;
    /// Active subscriptions for the table that are table-wide or bound to `record_id`.
    fn list_matching_subscriptions(
        &self,
        table_id: TableId,
        record_id: RecordId,
    ) -> RepoResult<Vec<RecordSubscription>>;
    fn list_subscriptions_for_user(&self, user_id: &str) -> RepoResult<Vec<RecordSubscription>>;
    fn deactivate_subscription(&self, id: SubscriptionId) -> RepoResult<()>;
    fn deactivate_subscriptions_for_table(&self, table_id: TableId) -> RepoResult<usize>;

    fn insert_outbox(&self, entry: &OutboxEntry) -> RepoResult<()>;
    fn list_outbox_for_user(&self, user_id: &str) -> RepoResult<Vec<OutboxEntry>>;
}

/// SQLite-backed notification repository.
pub struct SqliteNotificationRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteNotificationRepository<'conn> {
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_connection_ready(
            conn,
            &[
                "scheduled_notifications",
                "record_subscriptions",
                "notification_outbox",
            ],
        )?;
        Ok(Self { conn })
    }

    fn query_notifications(
        &self,
        where_clause: &str,
        binds: Vec<SqlValue>,
    ) -> RepoResult<Vec<ScheduledNotification>> {
        let mut stmt = self.conn.prepare(&format!(
            "{NOTIFICATION_SELECT_SQL} WHERE {where_clause} ORDER BY target_date ASC, id ASC;"
        ))?;
        let mut rows = stmt.query(params_from_iter(binds))?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(parse_notification_row(row)?);
        }
        Ok(items)
    }

    fn query_subscriptions(
        &self,
        where_clause: &str,
        binds: Vec<SqlValue>,
    ) -> RepoResult<Vec<RecordSubscription>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SUBSCRIPTION_SELECT_SQL} WHERE {where_clause} ORDER BY created_at ASC, id ASC;"
        ))?;
        let mut rows = stmt.query(params_from_iter(binds))?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(parse_subscription_row(row)?);
        }
        Ok(items)
    }
}

impl NotificationRepository for SqliteNotificationRepository<'_> {
    fn insert_notification(&self, notification: &ScheduledNotification) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO scheduled_notifications (
                id,
                table_id,
                record_id,
                column_name,
                target_date,
                notify_before_days,
                title,
                message,
                assigned_user_ids,
                is_active,
                notification_sent,
                sent_at,
                created_by
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13);",
            params![
                notification.id.to_string(),
                notification.table_id.to_string(),
                notification.record_id.map(|value| value.to_string()),
                notification.column_name,
                notification.target_date.timestamp_millis(),
                i64::from(notification.notify_before_days),
                notification.title,
                notification.message,
                to_json_text(
                    &notification.assigned_user_ids,
                    "scheduled_notifications.assigned_user_ids"
                )?,
                bool_to_int(notification.is_active),
                bool_to_int(notification.notification_sent),
                notification.sent_at.map(|value| value.timestamp_millis()),
                notification.created_by,
            ],
        )?;
        Ok(())
    }

    fn get_notification(&self, id: NotificationId) -> RepoResult<Option<ScheduledNotification>> {
        let mut items =
            self.query_notifications("id = ?", vec![SqlValue::Text(id.to_string())])?;
        Ok(items.pop())
    }

    fn list_active(&self) -> RepoResult<Vec<ScheduledNotification>> {
        self.query_notifications("is_active = 1", Vec::new())
    }

    fn list_by_table(&self, table_id: TableId) -> RepoResult<Vec<ScheduledNotification>> {
        self.query_notifications("table_id = ?", vec![SqlValue::Text(table_id.to_string())])
    }

    fn list_by_record(&self, record_id: RecordId) -> RepoResult<Vec<ScheduledNotification>> {
        self.query_notifications(
            "record_id = ?",
            vec![SqlValue::Text(record_id.to_string())],
        )
    }

    fn list_pending_for_column(
        &self,
        table_id: TableId,
        record_id: RecordId,
        column_name: &str,
    ) -> RepoResult<Vec<ScheduledNotification>> {
        self.query_notifications(
            "table_id = ? AND record_id = ? AND column_name = ?
             AND is_active = 1 AND notification_sent = 0",
            vec![
                SqlValue::Text(table_id.to_string()),
                SqlValue::Text(record_id.to_string()),
                SqlValue::Text(column_name.to_string()),
            ],
        )
    }

    fn reschedule(&self, id: NotificationId, target_date: DateTime<Utc>) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE scheduled_notifications
             SET target_date = ?2,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE id = ?1
               AND notification_sent = 0;",
            params![id.to_string(), target_date.timestamp_millis()],
        )?;
        if changed == 0 {
            return Err(RepoError::not_found("pending notification", id));
        }
        Ok(())
    }

    fn deactivate(&self, id: NotificationId) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE scheduled_notifications
             SET is_active = 0,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE id = ?1;",
            [id.to_string()],
        )?;
        if changed == 0 {
            return Err(RepoError::not_found("notification", id));
        }
        Ok(())
    }

    fn deactivate_scope(&self, scope: NotificationScope) -> RepoResult<usize> {
        let (where_clause, bind) = match scope {
            NotificationScope::All => ("", None),
            NotificationScope::Table(table_id) => (" AND table_id = ?1", Some(table_id)),
            NotificationScope::Record(record_id) => (" AND record_id = ?1", Some(record_id)),
        };
        let sql = format!(
            "UPDATE scheduled_notifications
             SET is_active = 0,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE is_active = 1{where_clause};"
        );
        let changed = match bind {
            Some(id) => self.conn.execute(&sql, [id.to_string()])?,
            None => self.conn.execute(&sql, [])?,
        };
        Ok(changed)
    }

    fn deactivate_for_column(&self, table_id: TableId, column_name: &str) -> RepoResult<usize> {
        let changed = self.conn.execute(
            "UPDATE scheduled_notifications
             SET is_active = 0,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE table_id = ?1
               AND column_name = ?2
               AND is_active = 1;",
            params![table_id.to_string(), column_name],
        )?;
        Ok(changed)
    }

    fn rename_column(
        &self,
        table_id: TableId,
        old_name: &str,
        new_name: &str,
    ) -> RepoResult<usize> {
        let changed = self.conn.execute(
            "UPDATE scheduled_notifications
             SET column_name = ?3,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE table_id = ?1
               AND column_name = ?2;",
            params![table_id.to_string(), old_name, new_name],
        )?;
        Ok(changed)
    }

    fn list_due_ids(&self, now: DateTime<Utc>, limit: u32) -> RepoResult<Vec<NotificationId>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id
             FROM scheduled_notifications
             WHERE {DUE_PREDICATE_SQL}
             ORDER BY target_date ASC, id ASC
             LIMIT ?;"
        ))?;
        let mut rows = stmt.query(params![now.timestamp_millis(), i64::from(limit)])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            let value: String = row.get(0)?;
            ids.push(parse_uuid(&value, "scheduled_notifications.id")?);
        }
        Ok(ids)
    }

    fn load_if_due(
        &self,
        id: NotificationId,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<ScheduledNotification>> {
        let mut items = self.query_notifications(
            &format!("id = ? AND {DUE_PREDICATE_SQL}"),
            vec![
                SqlValue::Text(id.to_string()),
                SqlValue::Integer(now.timestamp_millis()),
            ],
        )?;
        Ok(items.pop())
    }

    fn mark_sent(&self, id: NotificationId, sent_at: DateTime<Utc>) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "UPDATE scheduled_notifications
             SET notification_sent = 1,
                 sent_at = ?2,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE id = ?1
               AND is_active = 1
               AND notification_sent = 0;",
            params![id.to_string(), sent_at.timestamp_millis()],
        )?;
        Ok(changed == 1)
    }

    fn insert_subscription(&self, subscription: &RecordSubscription) -> RepoResult<()> {
        let types: Vec<&str> = subscription
            .notification_types
            .iter()
            .map(|action| action.as_str())
            .collect();
        self.conn.execute(
            "INSERT INTO record_subscriptions (
                id,
                user_id,
                table_id,
                record_id,
                notification_types,
                is_active
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            params![
                subscription.id.to_string(),
                subscription.user_id,
                subscription.table_id.to_string(),
                subscription.record_id.map(|value| value.to_string()),
                to_json_text(&types, "record_subscriptions.notification_types")?,
                bool_to_int(subscription.is_active),
            ],
        )?;
        Ok(())
    }

    fn list_matching_subscriptions(
        &self,
        table_id: TableId,
        record_id: RecordId,
    ) -> RepoResult<Vec<RecordSubscription>> {
        self.query_subscriptions(
            "is_active = 1 AND table_id = ? AND (record_id IS NULL OR record_id = ?)",
            vec![
                SqlValue::Text(table_id.to_string()),
                SqlValue::Text(record_id.to_string()),
            ],
        )
    }

    fn list_subscriptions_for_user(&self, user_id: &str) -> RepoResult<Vec<RecordSubscription>> {
        self.query_subscriptions("user_id = ?", vec![SqlValue::Text(user_id.to_string())])
    }

    fn deactivate_subscription(&self, id: SubscriptionId) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE record_subscriptions SET is_active = 0 WHERE id = ?1;",
            [id.to_string()],
        )?;
        if changed == 0 {
            return Err(RepoError::not_found("subscription", id));
        }
        Ok(())
    }

    fn deactivate_subscriptions_for_table(&self, table_id: TableId) -> RepoResult<usize> {
        let changed = self.conn.execute(
            "UPDATE record_subscriptions SET is_active = 0 WHERE table_id = ?1 AND is_active = 1;",
            [table_id.to_string()],
        )?;
        Ok(changed)
    }

    fn insert_outbox(&self, entry: &OutboxEntry) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO notification_outbox (
                id,
                user_id,
                source,
                source_id,
                table_id,
                record_id,
                action,
                title,
                message,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);",
            params![
                entry.id.to_string(),
                entry.user_id,
                entry.source.as_str(),
                entry.source_id.to_string(),
                entry.table_id.to_string(),
                entry.record_id.map(|value| value.to_string()),
                entry.action.map(RecordAction::as_str),
                entry.title,
                entry.message,
                entry.created_at,
            ],
        )?;
        Ok(())
    }

    fn list_outbox_for_user(&self, user_id: &str) -> RepoResult<Vec<OutboxEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, source, source_id, table_id, record_id, action, title, message, created_at
             FROM notification_outbox
             WHERE user_id = ?1
             ORDER BY seq ASC;",
        )?;
        let mut rows = stmt.query([user_id])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(parse_outbox_row(row)?);
        }
        Ok(entries)
    }
}

fn millis_to_datetime(value: i64, column: &'static str) -> RepoResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(value)
        .single()
        .ok_or_else(|| RepoError::InvalidData(format!("invalid timestamp `{value}` in {column}")))
}

fn parse_notification_row(row: &Row<'_>) -> RepoResult<ScheduledNotification> {
    let id: String = row.get("id")?;
    let table_id: String = row.get("table_id")?;
    let assigned: String = row.get("assigned_user_ids")?;
    let notify_before_days: i64 = row.get("notify_before_days")?;
    let sent_at: Option<i64> = row.get("sent_at")?;

    Ok(ScheduledNotification {
        id: parse_uuid(&id, "scheduled_notifications.id")?,
        table_id: parse_uuid(&table_id, "scheduled_notifications.table_id")?,
        record_id: parse_optional_uuid(row.get("record_id")?, "scheduled_notifications.record_id")?,
        column_name: row.get("column_name")?,
        target_date: millis_to_datetime(
            row.get("target_date")?,
            "scheduled_notifications.target_date",
        )?,
        notify_before_days: u32::try_from(notify_before_days).map_err(|_| {
            RepoError::InvalidData(format!(
                "invalid notify_before_days `{notify_before_days}`"
            ))
        })?,
        title: row.get("title")?,
        message: row.get("message")?,
        assigned_user_ids: from_json_text(&assigned, "scheduled_notifications.assigned_user_ids")?,
        is_active: parse_bool(row.get("is_active")?, "scheduled_notifications.is_active")?,
        notification_sent: parse_bool(
            row.get("notification_sent")?,
            "scheduled_notifications.notification_sent",
        )?,
        sent_at: sent_at
            .map(|value| millis_to_datetime(value, "scheduled_notifications.sent_at"))
            .transpose()?,
        created_by: row.get("created_by")?,
    })
}

fn parse_subscription_row(row: &Row<'_>) -> RepoResult<RecordSubscription> {
    let id: String = row.get("id")?;
    let table_id: String = row.get("table_id")?;
    let types_text: String = row.get("notification_types")?;
    let raw_types: Vec<String> =
        from_json_text(&types_text, "record_subscriptions.notification_types")?;
    let notification_types = raw_types
        .iter()
        .map(|value| {
            RecordAction::parse(value).ok_or_else(|| {
                RepoError::InvalidData(format!("invalid notification type `{value}`"))
            })
        })
        .collect::<RepoResult<Vec<_>>>()?;

    Ok(RecordSubscription {
        id: parse_uuid(&id, "record_subscriptions.id")?,
        user_id: row.get("user_id")?,
        table_id: parse_uuid(&table_id, "record_subscriptions.table_id")?,
        record_id: parse_optional_uuid(row.get("record_id")?, "record_subscriptions.record_id")?,
        notification_types,
        is_active: parse_bool(row.get("is_active")?, "record_subscriptions.is_active")?,
    })
}

fn parse_outbox_row(row: &Row<'_>) -> RepoResult<OutboxEntry> {
    let id: String = row.get("id")?;
    let source: String = row.get("source")?;
    let source_id: String = row.get("source_id")?;
    let table_id: String = row.get("table_id")?;
    let action: Option<String> = row.get("action")?;
    Ok(OutboxEntry {
        id: parse_uuid(&id, "notification_outbox.id")?,
        user_id: row.get("user_id")?,
        source: OutboxSource::parse(&source).ok_or_else(|| {
            RepoError::InvalidData(format!("invalid outbox source `{source}`"))
        })?,
        source_id: parse_uuid(&source_id, "notification_outbox.source_id")?,
        table_id: parse_uuid(&table_id, "notification_outbox.table_id")?,
        record_id: parse_optional_uuid(row.get("record_id")?, "notification_outbox.record_id")?,
        action: action
            .map(|value| {
                RecordAction::parse(&value).ok_or_else(|| {
                    RepoError::InvalidData(format!("invalid outbox action `{value}`"))
                })
            })
            .transpose()?,
        title: row.get("title")?,
        message: row.get("message")?,
        created_at: row.get("created_at")?,
    })
}
