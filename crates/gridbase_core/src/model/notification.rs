//! Scheduled notifications, record subscriptions and the delivery outbox.
//!
//! # Invariants
//! - `notification_sent` flips to `true` at most once per notification.
//! - Deactivation is a soft flag; rows are never removed by it.
//! - A deactivated notification reports `Deactivated` regardless of other flags.

use crate::model::record::{RecordAction, RecordId};
use crate::model::schema::TableId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type NotificationId = Uuid;
pub type SubscriptionId = Uuid;

/// Upper bound for `notify_before_days`, about a century.
pub const MAX_NOTIFY_BEFORE_DAYS: u32 = 36_500;

/// Lifecycle state derived from flags and the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationState {
    Scheduled,
    Due,
    Sent,
    Deactivated,
}

/// Time-triggered alert tied to a date column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledNotification {
    pub id: NotificationId,
    pub table_id: TableId,
    pub record_id: Option<RecordId>,
    pub column_name: String,
    pub target_date: DateTime<Utc>,
    pub notify_before_days: u32,
    pub title: String,
    pub message: String,
    pub assigned_user_ids: Vec<String>,
    pub is_active: bool,
    pub notification_sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_by: String,
}

impl ScheduledNotification {
    /// Earliest instant the notification becomes due.
    ///
    /// Saturates at the earliest representable instant.
    pub fn due_at(&self) -> DateTime<Utc> {
        Duration::try_days(i64::from(self.notify_before_days))
            .and_then(|lead| self.target_date.checked_sub_signed(lead))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Instant the scheduler fires it: `max(due_at, now)`.
    pub fn fires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.due_at().max(now)
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> NotificationState {
        if !self.is_active {
            NotificationState::Deactivated
        } else if self.notification_sent {
            NotificationState::Sent
        } else if now >= self.due_at() {
            NotificationState::Due
        } else {
            NotificationState::Scheduled
        }
    }
}

/// Input for creating a scheduled notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewScheduledNotification {
    pub table_id: TableId,
    pub record_id: Option<RecordId>,
    /// Must name an active `date` column of `table_id`.
    pub column_name: String,
    /// `None` reads the date from the record's column value.
    pub target_date: Option<DateTime<Utc>>,
    pub notify_before_days: u32,
    pub title: String,
    pub message: String,
    pub assigned_user_ids: Vec<String>,
    pub created_by: String,
}

/// Bulk deactivation scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationScope {
    All,
    Table(TableId),
    Record(RecordId),
}

/// A user's opt-in to record lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSubscription {
    pub id: SubscriptionId,
    pub user_id: String,
    pub table_id: TableId,
    /// `None` subscribes to every record of the table.
    pub record_id: Option<RecordId>,
    pub notification_types: Vec<RecordAction>,
    pub is_active: bool,
}

impl RecordSubscription {
    pub fn wants(&self, action: RecordAction) -> bool {
        self.is_active && self.notification_types.contains(&action)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxSource {
    Subscription,
    Scheduled,
}

impl OutboxSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::Scheduled => "scheduled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "subscription" => Some(Self::Subscription),
            "scheduled" => Some(Self::Scheduled),
            _ => None,
        }
    }
}

/// One pending delivery for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub user_id: String,
    pub source: OutboxSource,
    pub source_id: Uuid,
    pub table_id: TableId,
    pub record_id: Option<RecordId>,
    pub action: Option<RecordAction>,
    pub title: String,
    pub message: String,
    /// Epoch milliseconds.
    pub created_at: i64,
}
