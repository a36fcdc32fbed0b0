//! Status store: an append-only log of lifecycle events per notification.
//!
//! Rows are only ever inserted, so concurrent reporters never contend on a row.
//! A status may be appended for a notification id the store has never seen;
//! reporters in other processes do not have to coordinate with creation order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sqlx::PgPool;

use herald_common::error::AppError;
use herald_common::types::{NotificationRecord, NotificationStatus, StatusEvent};

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Write the notification row and its initial `pending` event, atomically.
    async fn record_pending(&self, record: &NotificationRecord) -> Result<StatusEvent, AppError>;

    /// Append a status event.
    ///
    /// `retry_count` is 0 except on `failed` events, where it is one more than the
    /// previous `failed` event's count (0 for the first).
    async fn append_status(
        &self,
        notification_id: &str,
        status: NotificationStatus,
        error: Option<&str>,
    ) -> Result<StatusEvent, AppError>;

    /// Most recent event by insertion order.
    async fn latest_status(&self, notification_id: &str) -> Result<Option<StatusEvent>, AppError>;

    /// Every event for `notification_id`, oldest first.
    async fn history(&self, notification_id: &str) -> Result<Vec<StatusEvent>, AppError>;

    async fn ping(&self) -> Result<(), AppError>;
}

/// PostgreSQL-backed status store.
#[derive(Clone)]
pub struct PgStatusStore {
    pool: PgPool,
}

impl PgStatusStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StatusStore for PgStatusStore {
    async fn record_pending(&self, record: &NotificationRecord) -> Result<StatusEvent, AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO notifications
                (notification_id, user_id, channel, template_code, request_id, correlation_id, priority, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&record.notification_id)
        .bind(&record.user_id)
        .bind(record.channel)
        .bind(&record.template_code)
        .bind(&record.request_id)
        .bind(&record.correlation_id)
        .bind(record.priority)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?;

        let event: StatusEvent = sqlx::query_as(
            r#"
            INSERT INTO notification_status (notification_id, status, retry_count)
            VALUES ($1, $2, 0)
            RETURNING id, notification_id, status, error, timestamp, retry_count
            "#,
        )
        .bind(&record.notification_id)
        .bind(NotificationStatus::Pending)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            notification_id = %record.notification_id,
            request_id = %record.request_id,
            "Notification recorded pending"
        );
        Ok(event)
    }

    async fn append_status(
        &self,
        notification_id: &str,
        status: NotificationStatus,
        error: Option<&str>,
    ) -> Result<StatusEvent, AppError> {
        let event: StatusEvent = sqlx::query_as(
            r#"
            INSERT INTO notification_status (notification_id, status, error, retry_count)
            VALUES (
                $1, $2, $3,
                CASE WHEN $2 = 'failed' THEN COALESCE(
                    (SELECT MAX(retry_count) + 1 FROM notification_status
                     WHERE notification_id = $1 AND status = 'failed'),
                    0)
                ELSE 0 END
            )
            RETURNING id, notification_id, status, error, timestamp, retry_count
            "#,
        )
        .bind(notification_id)
        .bind(status)
        .bind(error)
        .fetch_one(&self.pool)
        .await?;

        Ok(event)
    }

    async fn latest_status(&self, notification_id: &str) -> Result<Option<StatusEvent>, AppError> {
        let event: Option<StatusEvent> = sqlx::query_as(
            r#"
            SELECT id, notification_id, status, error, timestamp, retry_count
            FROM notification_status
            WHERE notification_id = $1
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(notification_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(event)
    }

    async fn history(&self, notification_id: &str) -> Result<Vec<StatusEvent>, AppError> {
        let events: Vec<StatusEvent> = sqlx::query_as(
            r#"
            SELECT id, notification_id, status, error, timestamp, retry_count
            FROM notification_status
            WHERE notification_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(notification_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<String, NotificationRecord>,
    events: Vec<StatusEvent>,
}

/// In-process status store with the same semantics as [`PgStatusStore`].
pub struct MemoryStatusStore {
    state: Mutex<MemoryState>,
    available: AtomicBool,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate a store outage.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn record(&self, notification_id: &str) -> Option<NotificationRecord> {
        self.state.lock().records.get(notification_id).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }

    fn check_available(&self) -> Result<(), AppError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::StoreUnavailable(sqlx::Error::PoolTimedOut))
        }
    }

    fn push_event(
        state: &mut MemoryState,
        notification_id: &str,
        status: NotificationStatus,
        error: Option<&str>,
    ) -> StatusEvent {
        let retry_count = match status {
            NotificationStatus::Failed => state
                .events
                .iter()
                .filter(|e| {
                    e.notification_id == notification_id && e.status == NotificationStatus::Failed
                })
                .map(|e| e.retry_count + 1)
                .max()
                .unwrap_or(0),
            _ => 0,
        };

        let event = StatusEvent {
            id: state.events.len() as i64 + 1,
            notification_id: notification_id.to_string(),
            status,
            error: error.map(str::to_string),
            timestamp: Utc::now(),
            retry_count,
        };
        state.events.push(event.clone());
        event
    }
}

impl Default for MemoryStatusStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn record_pending(&self, record: &NotificationRecord) -> Result<StatusEvent, AppError> {
        self.check_available()?;
        let mut state = self.state.lock();
        if state.records.contains_key(&record.notification_id) {
            return Err(AppError::Validation(format!(
                "notification {} already recorded",
                record.notification_id
            )));
        }
        state
            .records
            .insert(record.notification_id.clone(), record.clone());
        Ok(Self::push_event(
            &mut state,
            &record.notification_id,
            NotificationStatus::Pending,
            None,
        ))
    }

    async fn append_status(
        &self,
        notification_id: &str,
        status: NotificationStatus,
        error: Option<&str>,
    ) -> Result<StatusEvent, AppError> {
        self.check_available()?;
        Ok(Self::push_event(
            &mut self.state.lock(),
            notification_id,
            status,
            error,
        ))
    }

    async fn latest_status(&self, notification_id: &str) -> Result<Option<StatusEvent>, AppError> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .events
            .iter()
            .rev()
            .find(|e| e.notification_id == notification_id)
            .cloned())
    }

    async fn history(&self, notification_id: &str) -> Result<Vec<StatusEvent>, AppError> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .events
            .iter()
            .filter(|e| e.notification_id == notification_id)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), AppError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use herald_common::types::{Channel, CreateNotificationRequest};

    use super::*;

    fn record() -> NotificationRecord {
        let request = CreateNotificationRequest {
            notification_type: Channel::Email,
            template_code: "welcome".into(),
            variables: Default::default(),
            request_id: "r1".into(),
            priority: 0,
            metadata: None,
        };
        NotificationRecord::new("user-1", &request)
    }

    #[tokio::test]
    async fn test_record_pending_writes_initial_event() {
        let store = MemoryStatusStore::new();
        let record = record();
        let event = store.record_pending(&record).await.unwrap();

        assert_eq!(event.status, NotificationStatus::Pending);
        assert_eq!(event.retry_count, 0);
        assert_eq!(store.record(&record.notification_id), Some(record.clone()));
        let latest = store
            .latest_status(&record.notification_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest, event);
    }

    #[tokio::test]
    async fn test_failed_retry_count_increments() {
        let store = MemoryStatusStore::new();
        let id = "notif_x";

        let counts = [
            (NotificationStatus::Processing, 0),
            (NotificationStatus::Failed, 0),
            (NotificationStatus::Processing, 0),
            (NotificationStatus::Failed, 1),
            (NotificationStatus::Failed, 2),
            (NotificationStatus::Delivered, 0),
        ];
        for (status, expected) in counts {
            let event = store.append_status(id, status, Some("boom")).await.unwrap();
            assert_eq!(event.retry_count, expected, "status {}", status);
        }

        // Other notifications keep their own count.
        let other = store
            .append_status("notif_y", NotificationStatus::Failed, None)
            .await
            .unwrap();
        assert_eq!(other.retry_count, 0);
    }

    #[tokio::test]
    async fn test_unknown_notification_is_accepted() {
        let store = MemoryStatusStore::new();
        store
            .append_status("notif_never_created", NotificationStatus::Delivered, None)
            .await
            .unwrap();
        assert_eq!(store.history("notif_never_created").await.unwrap().len(), 1);
        assert_eq!(store.record_count(), 0);
    }

    #[tokio::test]
    async fn test_history_is_in_insertion_order() {
        let store = MemoryStatusStore::new();
        let record = record();
        store.record_pending(&record).await.unwrap();
        for status in [NotificationStatus::Processing, NotificationStatus::Delivered] {
            store
                .append_status(&record.notification_id, status, None)
                .await
                .unwrap();
        }

        let history = store.history(&record.notification_id).await.unwrap();
        let statuses: Vec<_> = history.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![
                NotificationStatus::Pending,
                NotificationStatus::Processing,
                NotificationStatus::Delivered
            ]
        );
        assert!(history.windows(2).all(|w| w[0].id < w[1].id));
        assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = MemoryStatusStore::new();
        store.set_available(false);
        let err = store.record_pending(&record()).await.unwrap_err();
        assert_eq!(err.kind().as_str(), "store_unavailable");
        assert_eq!(store.record_count(), 0);
        assert!(store.ping().await.is_err());
    }
}
