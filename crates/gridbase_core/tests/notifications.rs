use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use gridbase_core::repo::lock_repo::{LockRepository, SqliteLockRepository};
use gridbase_core::service::scheduler::SCHEDULER_LEASE_KEY;
use gridbase_core::{
    open_db, open_db_in_memory, Actor, ColumnSpec, ColumnType, CoreError, DispatchError,
    NewScheduledNotification, NotificationCenter, NotificationDispatcher, NotificationScheduler,
    NotificationScope, NotificationState, OutboxDispatcher, OutboxSource, PermissionMatrix,
    RecordAction, RecordData, RecordStore, ScheduledNotification, SchemaRegistry,
    MAX_NOTIFY_BEFORE_DAYS,
};
use rusqlite::Connection;
use serde_json::json;
use std::sync::{Arc, Barrier};
use std::time::Duration;
use uuid::Uuid;

fn data(value: serde_json::Value) -> RecordData {
    value.as_object().cloned().unwrap()
}

fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
}

fn contracts(conn: &Connection) -> (Actor, Uuid) {
    let role = PermissionMatrix::new(conn)
        .create_role("Admin", None, true)
        .unwrap();
    let schema = SchemaRegistry::new(conn);
    let table = schema.create_table(None, "contracts", None).unwrap();
    schema
        .add_column(table.id, ColumnSpec::new("title", ColumnType::String))
        .unwrap();
    schema
        .add_column(table.id, ColumnSpec::new("renewal", ColumnType::Date))
        .unwrap();
    (Actor::new(role.id, "admin"), table.id)
}

fn schedule(
    conn: &Connection,
    table_id: Uuid,
    record_id: Option<Uuid>,
    target_date: Option<DateTime<Utc>>,
) -> ScheduledNotification {
    NotificationCenter::new(conn)
        .create_notification(NewScheduledNotification {
            table_id,
            record_id,
            column_name: "renewal".to_string(),
            target_date,
            notify_before_days: 3,
            title: "Renewal due".to_string(),
            message: "Check the contract".to_string(),
            assigned_user_ids: vec!["ops".to_string(), "legal".to_string(), "ops".to_string()],
            created_by: "admin".to_string(),
        })
        .unwrap()
}

#[test]
fn create_rejects_non_date_columns_and_blank_input() {
    let conn = open_db_in_memory().unwrap();
    let (_, table_id) = contracts(&conn);
    let center = NotificationCenter::new(&conn);
    let base = NewScheduledNotification {
        table_id,
        record_id: None,
        column_name: "renewal".to_string(),
        target_date: Some(at(2026, 5, 10)),
        notify_before_days: 0,
        title: "Renewal".to_string(),
        message: String::new(),
        assigned_user_ids: vec!["ops".to_string()],
        created_by: "admin".to_string(),
    };

    let err = center
        .create_notification(NewScheduledNotification {
            column_name: "title".to_string(),
            ..base.clone()
        })
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)), "unexpected: {err}");

    let err = center
        .create_notification(NewScheduledNotification {
            column_name: "missing".to_string(),
            ..base.clone()
        })
        .unwrap_err();
    assert!(matches!(err, CoreError::Reference(_)));

    let err = center
        .create_notification(NewScheduledNotification {
            assigned_user_ids: vec!["  ".to_string()],
            ..base.clone()
        })
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));

    let err = center
        .create_notification(NewScheduledNotification {
            target_date: None,
            ..base
        })
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}

#[test]
fn notification_moves_from_scheduled_to_sent_once() {
    let conn = open_db_in_memory().unwrap();
    let (_, table_id) = contracts(&conn);
    let notification = schedule(&conn, table_id, None, Some(at(2026, 5, 10)));
    assert_eq!(notification.assigned_user_ids, ["ops", "legal"]);
    assert_eq!(notification.due_at(), at(2026, 5, 7));

    let scheduler = NotificationScheduler::new(&conn, OutboxDispatcher);
    let early = scheduler.tick(at(2026, 5, 6)).unwrap();
    assert!(early.lease_acquired);
    assert_eq!((early.scanned, early.sent), (0, 0));

    let due = at(2026, 5, 7);
    let center = NotificationCenter::new(&conn);
    assert_eq!(
        center.get_notification(notification.id).unwrap().state_at(due),
        NotificationState::Due
    );
    let report = scheduler.tick(due).unwrap();
    assert_eq!((report.scanned, report.sent, report.failed), (1, 1, 0));

    let sent = center.get_notification(notification.id).unwrap();
    assert_eq!(sent.state_at(due), NotificationState::Sent);
    assert_eq!(sent.sent_at, Some(due));

    let again = scheduler.tick(due + ChronoDuration::days(1)).unwrap();
    assert_eq!((again.scanned, again.sent), (0, 0));

    let outbox = center.outbox_for_user("ops").unwrap();
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].source, OutboxSource::Scheduled);
    assert_eq!(outbox[0].source_id, notification.id);
    assert_eq!(outbox[0].title, "Renewal due");
    assert_eq!(center.outbox_for_user("legal").unwrap().len(), 1);
}

#[test]
fn concurrent_ticks_deliver_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scheduler.db");
    let conn = open_db(&path).unwrap();
    let (_, table_id) = contracts(&conn);
    let ids: Vec<Uuid> = (0..5)
        .map(|_| schedule(&conn, table_id, None, Some(at(2026, 1, 1))).id)
        .collect();
    let now = at(2026, 2, 1);

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let conn = open_db(&path).unwrap();
                let scheduler = NotificationScheduler::new(&conn, OutboxDispatcher).without_lease();
                barrier.wait();
                scheduler.tick(now).unwrap()
            })
        })
        .collect();
    let reports: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    let sent: usize = reports.iter().map(|report| report.sent).sum();
    assert_eq!(sent, ids.len());
    assert!(reports.iter().all(|report| report.failed == 0));
    let center = NotificationCenter::new(&conn);
    assert_eq!(center.outbox_for_user("ops").unwrap().len(), ids.len());
    for id in ids {
        assert!(center.get_notification(id).unwrap().notification_sent);
    }
}

#[test]
fn held_lease_skips_the_scan() {
    let conn = open_db_in_memory().unwrap();
    let (_, table_id) = contracts(&conn);
    schedule(&conn, table_id, None, Some(at(2026, 1, 1)));
    let now = at(2026, 2, 1);
    let locks = SqliteLockRepository::try_new(&conn).unwrap();
    assert!(locks
        .try_acquire(SCHEDULER_LEASE_KEY, "other", now.timestamp_millis(), 60_000)
        .unwrap());

    let scheduler =
        NotificationScheduler::new(&conn, OutboxDispatcher).with_lease_ttl(Duration::from_secs(60));
    let skipped = scheduler.tick(now).unwrap();
    assert!(!skipped.lease_acquired);
    assert_eq!(skipped.sent, 0);

    let later = now + ChronoDuration::minutes(2);
    let report = scheduler.tick(later).unwrap();
    assert!(report.lease_acquired);
    assert_eq!(report.sent, 1);
    assert!(locks.current(SCHEDULER_LEASE_KEY).unwrap().is_none());
}

struct FailingDispatcher;

impl NotificationDispatcher for FailingDispatcher {
    fn dispatch(
        &self,
        conn: &Connection,
        notification: &ScheduledNotification,
        sent_at: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        OutboxDispatcher.dispatch(conn, notification, sent_at)?;
        Err(DispatchError::new("channel offline"))
    }
}

/// Fails for one notification and delivers the rest.
struct FlakyDispatcher {
    broken: Uuid,
}

impl NotificationDispatcher for FlakyDispatcher {
    fn dispatch(
        &self,
        conn: &Connection,
        notification: &ScheduledNotification,
        sent_at: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        OutboxDispatcher.dispatch(conn, notification, sent_at)?;
        if notification.id == self.broken {
            return Err(DispatchError::new("mailbox rejected"));
        }
        Ok(())
    }
}

#[test]
fn failed_dispatch_rolls_back_and_stays_due() {
    let conn = open_db_in_memory().unwrap();
    let (_, table_id) = contracts(&conn);
    let notification = schedule(&conn, table_id, None, Some(at(2026, 1, 1)));
    let now = at(2026, 2, 1);

    let report = NotificationScheduler::new(&conn, FailingDispatcher)
        .tick(now)
        .unwrap();
    assert_eq!((report.sent, report.failed), (0, 1));
    let center = NotificationCenter::new(&conn);
    assert!(center.outbox_for_user("ops").unwrap().is_empty());
    assert!(!center.get_notification(notification.id).unwrap().notification_sent);

    let retry = NotificationScheduler::new(&conn, OutboxDispatcher)
        .tick(now)
        .unwrap();
    assert_eq!(retry.sent, 1);
}

#[test]
fn one_failing_row_does_not_block_the_rest_of_the_tick() {
    let conn = open_db_in_memory().unwrap();
    let (_, table_id) = contracts(&conn);
    let broken = schedule(&conn, table_id, None, Some(at(2026, 1, 1)));
    let healthy = schedule(&conn, table_id, None, Some(at(2026, 1, 2)));
    let now = at(2026, 2, 1);

    let report = NotificationScheduler::new(&conn, FlakyDispatcher { broken: broken.id })
        .tick(now)
        .unwrap();
    assert_eq!(
        (report.scanned, report.sent, report.skipped, report.failed),
        (2, 1, 0, 1)
    );
    let center = NotificationCenter::new(&conn);
    assert!(!center.get_notification(broken.id).unwrap().notification_sent);
    assert!(center.get_notification(healthy.id).unwrap().notification_sent);
    let queued: Vec<Uuid> = center
        .outbox_for_user("ops")
        .unwrap()
        .iter()
        .map(|entry| entry.source_id)
        .collect();
    assert_eq!(queued, [healthy.id]);

    let next = NotificationScheduler::new(&conn, OutboxDispatcher)
        .tick(now + ChronoDuration::minutes(1))
        .unwrap();
    assert_eq!((next.scanned, next.sent, next.failed), (1, 1, 0));
    assert!(center.get_notification(broken.id).unwrap().notification_sent);
}

#[test]
fn outbox_rows_carry_the_tick_time() {
    let conn = open_db_in_memory().unwrap();
    let (_, table_id) = contracts(&conn);
    let notification = schedule(&conn, table_id, None, Some(at(2026, 1, 1)));
    let now = at(2026, 2, 1);

    NotificationScheduler::new(&conn, OutboxDispatcher)
        .tick(now)
        .unwrap();
    let center = NotificationCenter::new(&conn);
    let sent = center.get_notification(notification.id).unwrap();
    assert_eq!(sent.sent_at, Some(now));
    for entry in center.outbox_for_user("ops").unwrap() {
        assert_eq!(entry.created_at, now.timestamp_millis());
    }
}

#[test]
fn lead_time_is_bounded() {
    let conn = open_db_in_memory().unwrap();
    let (_, table_id) = contracts(&conn);
    let center = NotificationCenter::new(&conn);
    let input = NewScheduledNotification {
        table_id,
        record_id: None,
        column_name: "renewal".to_string(),
        target_date: Some(at(2026, 5, 10)),
        notify_before_days: 200_000_000,
        title: "Renewal".to_string(),
        message: String::new(),
        assigned_user_ids: vec!["ops".to_string()],
        created_by: "admin".to_string(),
    };

    let err = center.create_notification(input.clone()).unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)), "unexpected: {err}");
    assert!(center.list_by_table(table_id).unwrap().is_empty());

    let longest = center
        .create_notification(NewScheduledNotification {
            notify_before_days: MAX_NOTIFY_BEFORE_DAYS,
            ..input
        })
        .unwrap();
    let stored = center.get_notification(longest.id).unwrap();
    assert_eq!(stored.state_at(at(2026, 1, 1)), NotificationState::Due);
    assert!(stored.due_at() < at(1927, 1, 1));
}

#[test]
fn deactivated_notifications_are_never_sent() {
    let conn = open_db_in_memory().unwrap();
    let (_, table_id) = contracts(&conn);
    let first = schedule(&conn, table_id, None, Some(at(2026, 1, 1)));
    schedule(&conn, table_id, None, Some(at(2026, 1, 2)));
    let center = NotificationCenter::new(&conn);

    center.deactivate(first.id).unwrap();
    assert_eq!(center.list_active().unwrap().len(), 1);
    assert_eq!(center.deactivate_all(NotificationScope::Table(table_id)).unwrap(), 1);

    let report = NotificationScheduler::new(&conn, OutboxDispatcher)
        .tick(at(2026, 2, 1))
        .unwrap();
    assert_eq!(report.scanned, 0);
    assert_eq!(
        center.get_notification(first.id).unwrap().state_at(at(2026, 2, 1)),
        NotificationState::Deactivated
    );
}

#[test]
fn record_date_changes_reschedule_pending_notifications() {
    let conn = open_db_in_memory().unwrap();
    let (actor, table_id) = contracts(&conn);
    let store = RecordStore::new(&conn);
    let record = store
        .create_record(
            table_id,
            data(json!({"title": "Lease", "renewal": "2026-06-01"})),
            &actor,
        )
        .unwrap();
    let notification = schedule(&conn, table_id, Some(record.id), None);
    assert_eq!(notification.target_date, at(2026, 6, 1));
    let center = NotificationCenter::new(&conn);

    store
        .update_record(
            table_id,
            record.id,
            data(json!({"title": "Lease", "renewal": "2026-07-15"})),
            &actor,
        )
        .unwrap();
    let moved = center.get_notification(notification.id).unwrap();
    assert_eq!(moved.target_date, at(2026, 7, 15));
    assert!(moved.is_active);

    store
        .update_record(table_id, record.id, data(json!({"title": "Lease"})), &actor)
        .unwrap();
    assert!(!center.get_notification(notification.id).unwrap().is_active);
}

#[test]
fn record_delete_deactivates_its_notifications() {
    let conn = open_db_in_memory().unwrap();
    let (actor, table_id) = contracts(&conn);
    let store = RecordStore::new(&conn);
    let record = store
        .create_record(table_id, data(json!({"renewal": "2026-06-01"})), &actor)
        .unwrap();
    let notification = schedule(&conn, table_id, Some(record.id), None);

    store.delete_record(table_id, record.id, &actor).unwrap();
    let center = NotificationCenter::new(&conn);
    assert!(!center.get_notification(notification.id).unwrap().is_active);
    assert!(center.list_by_record(record.id).unwrap().iter().all(|item| !item.is_active));
}

#[test]
fn subscriptions_fill_the_outbox_for_matching_actions() {
    let conn = open_db_in_memory().unwrap();
    let (actor, table_id) = contracts(&conn);
    let center = NotificationCenter::new(&conn);
    let store = RecordStore::new(&conn);

    center
        .subscribe("watcher", table_id, None, &[RecordAction::Create, RecordAction::Delete])
        .unwrap();
    let record = store
        .create_record(table_id, data(json!({"title": "Lease"})), &actor)
        .unwrap();
    let follower = center
        .subscribe("follower", table_id, Some(record.id), &[])
        .unwrap();
    assert_eq!(follower.notification_types, RecordAction::ALL.to_vec());
    let other = store
        .create_record(table_id, data(json!({"title": "Other"})), &actor)
        .unwrap();

    store
        .update_record(table_id, record.id, data(json!({"title": "Lease v2"})), &actor)
        .unwrap();
    store
        .update_record(table_id, other.id, data(json!({"title": "Other v2"})), &actor)
        .unwrap();
    store.delete_record(table_id, record.id, &actor).unwrap();

    let watcher: Vec<Option<RecordAction>> = center
        .outbox_for_user("watcher")
        .unwrap()
        .into_iter()
        .map(|entry| entry.action)
        .collect();
    assert_eq!(
        watcher,
        [
            Some(RecordAction::Create),
            Some(RecordAction::Create),
            Some(RecordAction::Delete)
        ]
    );

    let follower_outbox = center.outbox_for_user("follower").unwrap();
    let actions: Vec<Option<RecordAction>> =
        follower_outbox.iter().map(|entry| entry.action).collect();
    assert_eq!(
        actions,
        [Some(RecordAction::Update), Some(RecordAction::Delete)]
    );
    assert!(follower_outbox
        .iter()
        .all(|entry| entry.source == OutboxSource::Subscription
            && entry.record_id == Some(record.id)));
    assert_eq!(follower_outbox[0].title, "contracts: record updated");

    center.unsubscribe(follower.id).unwrap();
    assert!(center
        .list_subscriptions("follower")
        .unwrap()
        .iter()
        .all(|subscription| !subscription.is_active));
}
