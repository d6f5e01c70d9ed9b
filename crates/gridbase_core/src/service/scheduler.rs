//! Periodic dispatcher for scheduled notifications.
//!
//! # Responsibility
//! - Find notifications whose `target_date - notify_before_days` has passed.
//! - Dispatch each one and flip `notification_sent` exactly once.
//!
//! # Invariants
//! - Every notification is handled in its own immediate transaction:
//!   re-check due, dispatch, compare-and-swap `notification_sent`, commit.
//!   A lost swap rolls the dispatch back, so two concurrent ticks deliver
//!   once.
//! - A dispatch failure rolls back that row only; it stays due for the next
//!   tick.
//! - The due scan runs under a database lease so only one scheduler scans at
//!   a time; lease expiry never weakens the per-row guarantee.

use crate::db::begin_immediate;
use crate::error::CoreResult;
use crate::model::notification::{NotificationId, OutboxEntry, OutboxSource, ScheduledNotification};
use crate::repo::lock_repo::{LockRepository, SqliteLockRepository};
use crate::repo::notification_repo::{NotificationRepository, SqliteNotificationRepository};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use rusqlite::Connection;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Lease key guarding the due scan.
pub const SCHEDULER_LEASE_KEY: &str = "notification_scheduler";
const DUE_BATCH_LIMIT: u32 = 500;
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Delivery failure reported by a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchError {
    pub message: String,
}

impl DispatchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Display for DispatchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "dispatch failed: {}", self.message)
    }
}

impl Error for DispatchError {}

/// Delivery channel for due notifications.
///
/// `conn` is the per-notification transaction; writes made through it commit
/// only if the notification is marked sent. `sent_at` is the tick time that
/// `notification_sent` is stamped with.
pub trait NotificationDispatcher {
    fn dispatch(
        &self,
        conn: &Connection,
        notification: &ScheduledNotification,
        sent_at: DateTime<Utc>,
    ) -> Result<(), DispatchError>;
}

/// Queues one outbox row per assigned user.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboxDispatcher;

impl NotificationDispatcher for OutboxDispatcher {
    fn dispatch(
        &self,
        conn: &Connection,
        notification: &ScheduledNotification,
        sent_at: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        let repo = SqliteNotificationRepository::try_new(conn)
            .map_err(|err| DispatchError::new(err.to_string()))?;
        let created_at = sent_at.timestamp_millis();
        for user_id in &notification.assigned_user_ids {
            repo.insert_outbox(&OutboxEntry {
                id: Uuid::new_v4(),
                user_id: user_id.clone(),
                source: OutboxSource::Scheduled,
                source_id: notification.id,
                table_id: notification.table_id,
                record_id: notification.record_id,
                action: None,
                title: notification.title.clone(),
                message: notification.message.clone(),
                created_at,
            })
            .map_err(|err| DispatchError::new(err.to_string()))?;
        }
        Ok(())
    }
}

/// Counters for one scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickReport {
    /// `false` when another scheduler held the lease and nothing was scanned.
    pub lease_acquired: bool,
    pub scanned: usize,
    pub sent: usize,
    /// Already sent or deactivated by the time this tick reached them.
    pub skipped: usize,
    pub failed: usize,
}

enum RowOutcome {
    Sent,
    Skipped,
    Failed(String),
}

pub struct NotificationScheduler<'conn, D: NotificationDispatcher> {
    conn: &'conn Connection,
    dispatcher: D,
    holder: String,
    lease_ttl: Option<Duration>,
}

impl<'conn, D: NotificationDispatcher> NotificationScheduler<'conn, D> {
    pub fn new(conn: &'conn Connection, dispatcher: D) -> Self {
        Self {
            conn,
            dispatcher,
            holder: format!("scheduler-{}", Uuid::new_v4()),
            lease_ttl: Some(DEFAULT_LEASE_TTL),
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = Some(ttl);
        self
    }

    /// Scans without taking the lease; per-row transactions still hold.
    pub fn without_lease(mut self) -> Self {
        self.lease_ttl = None;
        self
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Runs one scan at `now`.
    pub fn tick(&self, now: DateTime<Utc>) -> CoreResult<TickReport> {
        let Some(ttl) = self.lease_ttl else {
            return self.scan(now);
        };
        if !self.acquire_lease(now, ttl)? {
            info!(
                "event=scheduler_tick module=scheduler status=skipped reason=lease_held holder={}",
                self.holder
            );
            return Ok(TickReport::default());
        }

        let report = self.scan(now);
        if let Err(err) = self.release_lease() {
            warn!(
                "event=scheduler_lease module=scheduler status=error op=release holder={} error={}",
                self.holder, err
            );
        }
        report
    }

    pub fn tick_now(&self) -> CoreResult<TickReport> {
        self.tick(Utc::now())
    }

    /// Ticks every `interval` until `stop` is set.
    pub fn run(&self, interval: Duration, stop: &AtomicBool) -> CoreResult<()> {
        info!(
            "event=scheduler_run module=scheduler status=start holder={} interval_ms={}",
            self.holder,
            interval.as_millis()
        );
        while !stop.load(Ordering::Relaxed) {
            if let Err(err) = self.tick_now() {
                error!(
                    "event=scheduler_tick module=scheduler status=error holder={} error={}",
                    self.holder, err
                );
            }
            let deadline = Instant::now() + interval;
            while !stop.load(Ordering::Relaxed) && Instant::now() < deadline {
                std::thread::sleep(STOP_POLL_INTERVAL.min(interval));
            }
        }
        info!(
            "event=scheduler_run module=scheduler status=ok holder={}",
            self.holder
        );
        Ok(())
    }

    fn scan(&self, now: DateTime<Utc>) -> CoreResult<TickReport> {
        let due = SqliteNotificationRepository::try_new(self.conn)?
            .list_due_ids(now, DUE_BATCH_LIMIT)?;
        let mut report = TickReport {
            lease_acquired: self.lease_ttl.is_some(),
            scanned: due.len(),
            ..TickReport::default()
        };

        for id in due {
            match self.process(id, now) {
                Ok(RowOutcome::Sent) => report.sent += 1,
                Ok(RowOutcome::Skipped) => report.skipped += 1,
                Ok(RowOutcome::Failed(message)) => {
                    report.failed += 1;
                    warn!(
                        "event=notification_dispatch module=scheduler status=error notification_id={} error={}",
                        id, message
                    );
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        "event=notification_dispatch module=scheduler status=error notification_id={} error={}",
                        id, err
                    );
                }
            }
        }

        info!(
            "event=scheduler_tick module=scheduler status=ok holder={} scanned={} sent={} skipped={} failed={}",
            self.holder, report.scanned, report.sent, report.skipped, report.failed
        );
        Ok(report)
    }

    fn process(&self, id: NotificationId, now: DateTime<Utc>) -> CoreResult<RowOutcome> {
        let tx = begin_immediate(self.conn)?;
        let repo = SqliteNotificationRepository::try_new(&tx)?;
        let Some(notification) = repo.load_if_due(id, now)? else {
            return Ok(RowOutcome::Skipped);
        };
        if let Err(err) = self.dispatcher.dispatch(&tx, &notification, now) {
            return Ok(RowOutcome::Failed(err.to_string()));
        }
        if !repo.mark_sent(id, now)? {
            return Ok(RowOutcome::Skipped);
        }
        tx.commit()?;
        Ok(RowOutcome::Sent)
    }

    fn acquire_lease(&self, now: DateTime<Utc>, ttl: Duration) -> CoreResult<bool> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let tx = begin_immediate(self.conn)?;
        let acquired = SqliteLockRepository::try_new(&tx)?.try_acquire(
            SCHEDULER_LEASE_KEY,
            &self.holder,
            now.timestamp_millis(),
            ttl_ms,
        )?;
        tx.commit()?;
        Ok(acquired)
    }

    fn release_lease(&self) -> CoreResult<bool> {
        let tx = begin_immediate(self.conn)?;
        let released =
            SqliteLockRepository::try_new(&tx)?.release(SCHEDULER_LEASE_KEY, &self.holder)?;
        tx.commit()?;
        Ok(released)
    }
}
