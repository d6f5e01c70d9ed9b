//! Change notification pipeline and notification management.
//!
//! # Responsibility
//! - React to record events: deliver matching subscriptions to the outbox
//!   and keep date-bound scheduled notifications in step with record data.
//! - Create, list and deactivate scheduled notifications and subscriptions.
//!
//! # Invariants
//! - Pipeline writes happen inside the record transaction that raised the
//!   event.
//! - Sent notifications are never rescheduled or reactivated.
//! - Deactivation is soft; rows stay for history.

use crate::db::begin_immediate;
use crate::error::{CoreError, CoreResult};
use crate::model::notification::{
    NewScheduledNotification, NotificationId, NotificationScope, OutboxEntry, OutboxSource,
    RecordSubscription, ScheduledNotification, SubscriptionId, MAX_NOTIFY_BEFORE_DAYS,
};
use crate::model::record::{RecordAction, RecordData, RecordEvent, RecordId};
use crate::model::schema::{ColumnType, TableId};
use crate::model::value::parse_date_value;
use crate::repo::notification_repo::{NotificationRepository, SqliteNotificationRepository};
use crate::repo::record_repo::{RecordRepository, SqliteRecordRepository};
use crate::repo::schema_repo::{SchemaRepository, SqliteSchemaRepository};
use crate::service::RecordEventSink;
use log::{debug, info};
use rusqlite::Connection;
use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

/// Record event sink feeding subscriptions and scheduled notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotificationPipeline;

impl RecordEventSink for NotificationPipeline {
    fn on_record_event(&self, conn: &Connection, event: &RecordEvent) -> CoreResult<()> {
        let repo = SqliteNotificationRepository::try_new(conn)?;
        let schema = SqliteSchemaRepository::try_new(conn)?;
        let table_name = schema
            .get_table(event.table_id)?
            .map(|table| table.name)
            .unwrap_or_else(|| event.table_id.to_string());

        let mut delivered = 0;
        for subscription in repo.list_matching_subscriptions(event.table_id, event.record_id)? {
            if !subscription.wants(event.action) {
                continue;
            }
            repo.insert_outbox(&OutboxEntry {
                id: Uuid::new_v4(),
                user_id: subscription.user_id.clone(),
                source: OutboxSource::Subscription,
                source_id: subscription.id,
                table_id: event.table_id,
                record_id: Some(event.record_id),
                action: Some(event.action),
                title: format!("{table_name}: record {}", past_tense(event.action)),
                message: format!(
                    "record {} was {} by {}",
                    event.record_id,
                    past_tense(event.action),
                    event.actor.user_id
                ),
                created_at: event.occurred_at,
            })?;
            delivered += 1;
        }

        let (mut rescheduled, mut deactivated) = (0, 0);
        match event.action {
            RecordAction::Create => {}
            RecordAction::Delete => {
                deactivated = repo.deactivate_scope(NotificationScope::Record(event.record_id))?;
            }
            RecordAction::Update => {
                for column in schema.list_columns(event.table_id)? {
                    if column.column_type != ColumnType::Date {
                        continue;
                    }
                    let old = date_field(event.old_data.as_ref(), &column.name);
                    let new = date_field(event.new_data.as_ref(), &column.name);
                    if old == new {
                        continue;
                    }
                    let pending = repo.list_pending_for_column(
                        event.table_id,
                        event.record_id,
                        &column.name,
                    )?;
                    for notification in pending {
                        match new.as_deref().and_then(parse_date_value) {
                            Some(target_date) => {
                                repo.reschedule(notification.id, target_date)?;
                                rescheduled += 1;
                            }
                            None => {
                                repo.deactivate(notification.id)?;
                                deactivated += 1;
                            }
                        }
                    }
                }
            }
        }

        debug!(
            "event=notification_pipeline module=notification status=ok action={} record_id={} delivered={} rescheduled={} deactivated={}",
            event.action.as_str(),
            event.record_id,
            delivered,
            rescheduled,
            deactivated
        );
        Ok(())
    }
}

/// Scheduled notification and subscription management.
pub struct NotificationCenter<'conn> {
    conn: &'conn Connection,
}

impl<'conn> NotificationCenter<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    fn repo(&self) -> CoreResult<SqliteNotificationRepository<'conn>> {
        Ok(SqliteNotificationRepository::try_new(self.conn)?)
    }

    /// Schedules a notification on a date column.
    ///
    /// Without an explicit `target_date` the date is read from the record,
    /// which must then be given and hold a value for the column.
    pub fn create_notification(
        &self,
        input: NewScheduledNotification,
    ) -> CoreResult<ScheduledNotification> {
        let title = input.title.trim().to_string();
        if title.is_empty() {
            return Err(CoreError::Validation(
                "notification title must not be blank".to_string(),
            ));
        }
        if input.notify_before_days > MAX_NOTIFY_BEFORE_DAYS {
            return Err(CoreError::Validation(format!(
                "notify_before_days {} exceeds {MAX_NOTIFY_BEFORE_DAYS}",
                input.notify_before_days
            )));
        }
        let mut seen = HashSet::new();
        let assigned_user_ids: Vec<String> = input
            .assigned_user_ids
            .iter()
            .map(|user| user.trim().to_string())
            .filter(|user| !user.is_empty() && seen.insert(user.clone()))
            .collect();
        if assigned_user_ids.is_empty() {
            return Err(CoreError::Validation(
                "notification needs at least one assigned user".to_string(),
            ));
        }

        let tx = begin_immediate(self.conn)?;
        let schema = SqliteSchemaRepository::try_new(&tx)?;
        schema
            .get_table(input.table_id)?
            .ok_or_else(|| CoreError::not_found("table", input.table_id))?;
        let column = schema
            .find_column_by_name(input.table_id, &input.column_name)?
            .ok_or_else(|| {
                CoreError::Reference(format!(
                    "column `{}` does not exist in table {}",
                    input.column_name, input.table_id
                ))
            })?;
        if column.column_type != ColumnType::Date {
            return Err(CoreError::Validation(format!(
                "column `{}` is {}, notifications need a date column",
                column.name,
                column.column_type.data_type()
            )));
        }

        let record = match input.record_id {
            Some(record_id) => Some(
                SqliteRecordRepository::try_new(&tx)?
                    .get_record(record_id)?
                    .filter(|record| record.table_id == Some(input.table_id))
                    .ok_or_else(|| CoreError::not_found("record", record_id))?,
            ),
            None => None,
        };
        let target_date = match (input.target_date, &record) {
            (Some(target_date), _) => target_date,
            (None, Some(record)) => record
                .record_data
                .get(&column.name)
                .and_then(Value::as_str)
                .and_then(parse_date_value)
                .ok_or_else(|| {
                    CoreError::Validation(format!(
                        "record {} has no date in column `{}`",
                        record.id, column.name
                    ))
                })?,
            (None, None) => {
                return Err(CoreError::Validation(
                    "target_date is required when no record is given".to_string(),
                ))
            }
        };

        let notification = ScheduledNotification {
            id: Uuid::new_v4(),
            table_id: input.table_id,
            record_id: input.record_id,
            column_name: column.name,
            target_date,
            notify_before_days: input.notify_before_days,
            title,
            message: input.message,
            assigned_user_ids,
            is_active: true,
            notification_sent: false,
            sent_at: None,
            created_by: input.created_by,
        };
        SqliteNotificationRepository::try_new(&tx)?.insert_notification(&notification)?;
        tx.commit()?;
        info!(
            "event=notification_create module=notification status=ok notification_id={} table_id={} due_at_ms={}",
            notification.id,
            notification.table_id,
            notification.due_at().timestamp_millis()
        );
        Ok(notification)
    }

    pub fn get_notification(&self, id: NotificationId) -> CoreResult<ScheduledNotification> {
        self.repo()?
            .get_notification(id)?
            .ok_or_else(|| CoreError::not_found("notification", id))
    }

    pub fn list_active(&self) -> CoreResult<Vec<ScheduledNotification>> {
        Ok(self.repo()?.list_active()?)
    }

    pub fn list_by_table(&self, table_id: TableId) -> CoreResult<Vec<ScheduledNotification>> {
        Ok(self.repo()?.list_by_table(table_id)?)
    }

    pub fn list_by_record(&self, record_id: RecordId) -> CoreResult<Vec<ScheduledNotification>> {
        Ok(self.repo()?.list_by_record(record_id)?)
    }

    pub fn deactivate(&self, id: NotificationId) -> CoreResult<()> {
        self.repo()?.deactivate(id)?;
        info!("event=notification_deactivate module=notification status=ok notification_id={id}");
        Ok(())
    }

    /// Deactivates every active notification in `scope`. Returns the count.
    pub fn deactivate_all(&self, scope: NotificationScope) -> CoreResult<usize> {
        let tx = begin_immediate(self.conn)?;
        let count = SqliteNotificationRepository::try_new(&tx)?.deactivate_scope(scope)?;
        tx.commit()?;
        info!(
            "event=notification_deactivate_all module=notification status=ok scope={:?} count={}",
            scope, count
        );
        Ok(count)
    }

    /// Subscribes a user to a table, or to one record when `record_id` is set.
    ///
    /// Empty `notification_types` subscribes to every action.
    pub fn subscribe(
        &self,
        user_id: &str,
        table_id: TableId,
        record_id: Option<RecordId>,
        notification_types: &[RecordAction],
    ) -> CoreResult<RecordSubscription> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(CoreError::Validation("user id must not be blank".to_string()));
        }
        let tx = begin_immediate(self.conn)?;
        SqliteSchemaRepository::try_new(&tx)?
            .get_table(table_id)?
            .ok_or_else(|| CoreError::not_found("table", table_id))?;
        if let Some(record_id) = record_id {
            SqliteRecordRepository::try_new(&tx)?
                .get_record(record_id)?
                .filter(|record| record.table_id == Some(table_id))
                .ok_or_else(|| CoreError::not_found("record", record_id))?;
        }

        let mut types: Vec<RecordAction> = Vec::new();
        for action in notification_types {
            if !types.contains(action) {
                types.push(*action);
            }
        }
        if types.is_empty() {
            types = RecordAction::ALL.to_vec();
        }
        let subscription = RecordSubscription {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            table_id,
            record_id,
            notification_types: types,
            is_active: true,
        };
        SqliteNotificationRepository::try_new(&tx)?.insert_subscription(&subscription)?;
        tx.commit()?;
        info!(
            "event=subscription_create module=notification status=ok subscription_id={} table_id={}",
            subscription.id, table_id
        );
        Ok(subscription)
    }

    pub fn list_subscriptions(&self, user_id: &str) -> CoreResult<Vec<RecordSubscription>> {
        Ok(self.repo()?.list_subscriptions_for_user(user_id.trim())?)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> CoreResult<()> {
        self.repo()?.deactivate_subscription(id)?;
        Ok(())
    }

    /// Deliveries queued for one user, oldest first.
    pub fn outbox_for_user(&self, user_id: &str) -> CoreResult<Vec<OutboxEntry>> {
        Ok(self.repo()?.list_outbox_for_user(user_id.trim())?)
    }
}

fn date_field(data: Option<&RecordData>, column: &str) -> Option<String> {
    data.and_then(|data| data.get(column))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn past_tense(action: RecordAction) -> &'static str {
    match action {
        RecordAction::Create => "created",
        RecordAction::Update => "updated",
        RecordAction::Delete => "deleted",
    }
}
