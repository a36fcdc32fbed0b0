//! Enqueue gateway: producer-side orchestration.
//!
//! `lookup` → `record_pending` → `try_set` → `publish`. The store write and the
//! publish are not one transaction: a crash between them leaves a `pending` row
//! with no message, never a message with no row.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use herald_broker::{PublishProperties, TopologyManager};
use redis::{ErrorKind, RedisError};
use herald_common::error::AppError;
use herald_common::types::{
    CreateNotificationRequest, DeliveryMessage, EnqueueReceipt, NotificationRecord,
    NotificationStatus,
};

use crate::idempotency::IdempotencyCache;
use crate::status::StatusStore;

/// Broker header carrying the correlation id.
pub const HEADER_TRACE_ID: &str = "x-trace-id";

pub struct EnqueueGateway {
    cache: Arc<dyn IdempotencyCache>,
    store: Arc<dyn StatusStore>,
    broker: Arc<TopologyManager>,
    idempotency_ttl: Duration,
}

impl EnqueueGateway {
    pub fn new(
        cache: Arc<dyn IdempotencyCache>,
        store: Arc<dyn StatusStore>,
        broker: Arc<TopologyManager>,
        idempotency_ttl: Duration,
    ) -> Self {
        Self {
            cache,
            store,
            broker,
            idempotency_ttl,
        }
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<dyn IdempotencyCache> {
        &self.cache
    }

    pub fn broker(&self) -> &Arc<TopologyManager> {
        &self.broker
    }

    /// Accept a notification request on behalf of `user_id`.
    ///
    /// A `request_id` seen before (and not yet expired) returns the original
    /// notification with `idempotent: true` and publishes nothing.
    pub async fn create(
        &self,
        user_id: &str,
        request: &CreateNotificationRequest,
    ) -> Result<EnqueueReceipt, AppError> {
        Self::validate(user_id, request)?;

        if let Some(existing) = self.cache.lookup(&request.request_id).await? {
            return self.replay(&request.request_id, existing).await;
        }

        let record = NotificationRecord::new(user_id, request);
        let pending = self.store.record_pending(&record).await?;

        let mut owner = self.claim(&record).await?;
        if !owner {
            // A concurrent request with the same request_id got there first. Our
            // pending row stays behind unpublished.
            if let Some(winner) = self.cache.lookup(&record.request_id).await? {
                tracing::warn!(
                    request_id = %record.request_id,
                    orphan = %record.notification_id,
                    winner = %winner,
                    "Lost idempotency race, returning existing notification"
                );
                return self.replay(&record.request_id, winner).await;
            }
            // The winner's entry expired before we could read it.
            owner = self.claim(&record).await?;
        }
        if !owner {
            tracing::warn!(
                request_id = %record.request_id,
                orphan = %record.notification_id,
                "Idempotency claim unsettled, not publishing"
            );
            return Err(AppError::CacheUnavailable(RedisError::from((
                ErrorKind::TryAgain,
                "idempotency claim could not be settled",
            ))));
        }

        let message = DeliveryMessage {
            record,
            variables: request.variables.clone(),
            metadata: request.metadata.clone(),
        };
        let record = &message.record;

        let mut headers = BTreeMap::new();
        headers.insert(HEADER_TRACE_ID.to_string(), record.correlation_id.clone());
        let properties = PublishProperties {
            message_id: record.notification_id.clone(),
            correlation_id: record.correlation_id.clone(),
            headers,
        };

        if let Err(e) = self
            .broker
            .publish(record.channel.routing_key(), &message, properties)
            .await
        {
            tracing::error!(
                notification_id = %record.notification_id,
                correlation_id = %record.correlation_id,
                error = %e,
                "Publish failed, notification left pending"
            );
            return Err(e);
        }

        tracing::info!(
            notification_id = %record.notification_id,
            correlation_id = %record.correlation_id,
            request_id = %record.request_id,
            channel = %record.channel,
            "Notification enqueued"
        );

        Ok(EnqueueReceipt {
            notification_id: record.notification_id.clone(),
            latest_status: pending.status,
            idempotent: false,
        })
    }

    async fn claim(&self, record: &NotificationRecord) -> Result<bool, AppError> {
        self.cache
            .try_set(
                &record.request_id,
                &record.notification_id,
                self.idempotency_ttl,
            )
            .await
    }

    async fn replay(
        &self,
        request_id: &str,
        notification_id: String,
    ) -> Result<EnqueueReceipt, AppError> {
        let latest_status = self
            .store
            .latest_status(&notification_id)
            .await?
            .map(|e| e.status)
            .unwrap_or(NotificationStatus::Pending);

        tracing::info!(
            request_id,
            notification_id = %notification_id,
            status = %latest_status,
            "Duplicate request, returning existing notification"
        );

        Ok(EnqueueReceipt {
            notification_id,
            latest_status,
            idempotent: true,
        })
    }

    fn validate(user_id: &str, request: &CreateNotificationRequest) -> Result<(), AppError> {
        if user_id.trim().is_empty() {
            return Err(AppError::Validation("user_id is required".to_string()));
        }
        if request.request_id.trim().is_empty() {
            return Err(AppError::Validation("request_id is required".to_string()));
        }
        if request.template_code.trim().is_empty() {
            return Err(AppError::Validation(
                "template_code is required".to_string(),
            ));
        }
        Ok(())
    }
}
