//! Delivery worker: consumes one channel's queue and drives each message to a
//! terminal state.
//!
//! received → rendering → sending → delivered | retry-scheduled | dead-lettered
//!
//! Transient failures are requeued after `base * 2^retry_count`. Permanent
//! failures, and transient ones once `retry_count` reaches `max_retries`, are
//! rejected to the dead-letter route. Every failed attempt appends a `failed`
//! status event.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use herald_broker::{Delivery, Disposition, MessageHandler};
use herald_common::config::WorkerSettings;
use herald_common::error::AppError;
use herald_common::types::{Channel, DeliveryMessage, NotificationStatus, Template};
use herald_engine::status::StatusStore;

use crate::breaker::BreakerRegistry;
use crate::cache::WorkerCache;
use crate::render::render_template;
use crate::sender::{Sender, breaker_name, resolve_recipient};
use crate::template::TemplateSource;

/// Breaker guarding template lookups.
pub const TEMPLATE_BREAKER: &str = "template_lookup";

pub struct DeliveryWorker {
    channel: Channel,
    store: Arc<dyn StatusStore>,
    cache: Arc<dyn WorkerCache>,
    templates: Arc<dyn TemplateSource>,
    sender: Arc<dyn Sender>,
    breakers: Arc<BreakerRegistry>,
    settings: WorkerSettings,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<dyn StatusStore>,
        cache: Arc<dyn WorkerCache>,
        templates: Arc<dyn TemplateSource>,
        sender: Arc<dyn Sender>,
        breakers: Arc<BreakerRegistry>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            channel: sender.channel(),
            store,
            cache,
            templates,
            sender,
            breakers,
            settings,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Delay before redelivering a message that failed with `retry_count` prior redeliveries.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        self.settings
            .retry_base_delay
            .saturating_mul(2u32.saturating_pow(retry_count))
    }

    /// Template for `code`: render-data cache first, then the template service.
    async fn resolve_template(&self, code: &str) -> Result<Template, AppError> {
        if let Some(template) = self.cache.get_template(code).await {
            tracing::debug!(template_code = code, "Template cache hit");
            return Ok(template);
        }

        let template = self
            .breakers
            .fire(TEMPLATE_BREAKER, || self.templates.fetch(code))
            .await?;
        self.cache
            .put_template(code, &template, self.settings.render_cache_ttl_secs)
            .await;
        Ok(template)
    }

    async fn deliver(&self, message: &DeliveryMessage) -> Result<(), AppError> {
        let template = self.resolve_template(&message.record.template_code).await?;
        let rendered = render_template(&template, &message.variables);
        let recipient = resolve_recipient(message)?;

        self.breakers
            .fire(breaker_name(self.channel), || {
                self.sender.send(&recipient, &rendered, message)
            })
            .await
    }

    /// Append a status event; failures are logged, never retried.
    async fn report(&self, notification_id: &str, status: NotificationStatus, error: Option<&str>) {
        if let Err(e) = self.store.append_status(notification_id, status, error).await {
            tracing::error!(
                notification_id,
                status = %status,
                error = %e,
                "Failed to record status"
            );
        }
    }

    async fn finish(&self, message_id: &str) {
        self.cache
            .mark_processed(message_id, self.settings.processed_marker_ttl_secs)
            .await;
    }
}

#[async_trait]
impl MessageHandler for DeliveryWorker {
    async fn handle(&self, delivery: &Delivery) -> Disposition {
        let envelope = &delivery.envelope;
        let retry_count = envelope.retry_count;

        if self.cache.is_processed(&envelope.message_id).await {
            tracing::info!(
                message_id = %envelope.message_id,
                redelivered = delivery.redelivered,
                "Skipping already processed message"
            );
            return Disposition::Ack;
        }

        let message: DeliveryMessage = match serde_json::from_str(&envelope.body) {
            Ok(message) => message,
            Err(e) => {
                let reason = format!("undecodable message body: {}", e);
                tracing::error!(
                    message_id = %envelope.message_id,
                    correlation_id = %envelope.correlation_id,
                    error = %e,
                    "Rejecting undecodable message"
                );
                if !envelope.message_id.is_empty() {
                    self.report(&envelope.message_id, NotificationStatus::Failed, Some(&reason))
                        .await;
                }
                return Disposition::Reject { reason };
            }
        };
        let id = message.record.notification_id.as_str();

        tracing::info!(
            notification_id = id,
            correlation_id = %message.record.correlation_id,
            channel = %self.channel,
            attempt = retry_count + 1,
            "Processing notification"
        );
        self.report(id, NotificationStatus::Processing, None).await;

        let error = match self.deliver(&message).await {
            Ok(()) => {
                self.report(id, NotificationStatus::Delivered, None).await;
                self.finish(&envelope.message_id).await;
                tracing::info!(notification_id = id, retry_count, "Notification delivered");
                return Disposition::Ack;
            }
            Err(e) => e,
        };

        if !error.is_transient() {
            let reason = error.to_string();
            self.report(id, NotificationStatus::Failed, Some(&reason))
                .await;
            self.finish(&envelope.message_id).await;
            tracing::error!(
                notification_id = id,
                kind = %error.kind(),
                error = %error,
                "Permanent delivery failure, dead-lettering"
            );
            return Disposition::Reject { reason };
        }

        if retry_count >= self.settings.max_retries {
            let exhausted = AppError::RetriesExhausted {
                attempts: retry_count + 1,
                last_error: error.to_string(),
            };
            let reason = exhausted.to_string();
            self.report(id, NotificationStatus::Failed, Some(&reason))
                .await;
            self.finish(&envelope.message_id).await;
            tracing::error!(
                notification_id = id,
                retry_count,
                error = %error,
                "Retries exhausted, dead-lettering"
            );
            return Disposition::Reject { reason };
        }

        self.report(id, NotificationStatus::Failed, Some(&error.to_string()))
            .await;
        let delay = self.backoff(retry_count);
        tracing::warn!(
            notification_id = id,
            kind = %error.kind(),
            error = %error,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            "Delivery failed, scheduling retry"
        );
        Disposition::Requeue { delay }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use parking_lot::Mutex;
    use serde_json::json;

    use herald_broker::message::{Envelope, PublishProperties};
    use herald_common::config::BreakerSettings;
    use herald_common::types::{CreateNotificationRequest, NotificationRecord, RenderedMessage};
    use herald_engine::status::MemoryStatusStore;

    use super::*;
    use crate::cache::MemoryWorkerCache;
    use crate::template::StaticTemplates;

    /// Sender that replays scripted outcomes, then succeeds.
    struct ScriptedSender {
        outcomes: Mutex<VecDeque<AppError>>,
        sent: Mutex<Vec<(String, RenderedMessage)>>,
    }

    impl ScriptedSender {
        fn new(outcomes: Vec<AppError>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Sender for ScriptedSender {
        fn channel(&self) -> Channel {
            Channel::Email
        }

        async fn send(
            &self,
            recipient: &str,
            rendered: &RenderedMessage,
            _message: &DeliveryMessage,
        ) -> Result<(), AppError> {
            if let Some(err) = self.outcomes.lock().pop_front() {
                return Err(err);
            }
            self.sent
                .lock()
                .push((recipient.to_string(), rendered.clone()));
            Ok(())
        }
    }

    struct Fixture {
        worker: DeliveryWorker,
        store: Arc<MemoryStatusStore>,
        cache: Arc<MemoryWorkerCache>,
        templates: Arc<StaticTemplates>,
        sender: Arc<ScriptedSender>,
    }

    fn fixture(outcomes: Vec<AppError>) -> Fixture {
        let store = Arc::new(MemoryStatusStore::new());
        let cache = Arc::new(MemoryWorkerCache::new());
        let templates = Arc::new(
            StaticTemplates::new().with("welcome", "Hi {{name}}", "<p>Welcome {{name}}</p>"),
        );
        let sender = Arc::new(ScriptedSender::new(outcomes));
        let breakers = Arc::new(BreakerRegistry::new(BreakerSettings {
            volume_threshold: 100,
            ..Default::default()
        }));
        let worker = DeliveryWorker::new(
            store.clone(),
            cache.clone(),
            templates.clone(),
            sender.clone(),
            breakers,
            WorkerSettings {
                retry_base_delay: Duration::from_millis(1000),
                ..Default::default()
            },
        );
        Fixture {
            worker,
            store,
            cache,
            templates,
            sender,
        }
    }

    fn delivery(variables: serde_json::Value, retry_count: u32) -> Delivery {
        let request: CreateNotificationRequest = serde_json::from_value(json!({
            "notification_type": "email",
            "template_code": "welcome",
            "request_id": "r1",
            "variables": variables,
        }))
        .unwrap();
        let record = NotificationRecord::new("user-1", &request);
        let message = DeliveryMessage {
            record,
            variables: request.variables.clone(),
            metadata: None,
        };
        let mut envelope = Envelope::json(
            &message,
            PublishProperties {
                message_id: message.record.notification_id.clone(),
                correlation_id: message.record.correlation_id.clone(),
                ..Default::default()
            },
        )
        .unwrap();
        envelope.retry_count = retry_count;
        Delivery {
            queue: "email.queue".into(),
            tag: "1".into(),
            redelivered: false,
            envelope,
        }
    }

    async fn statuses(store: &MemoryStatusStore, id: &str) -> Vec<(NotificationStatus, i32)> {
        store
            .history(id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.status, e.retry_count))
            .collect()
    }

    #[test]
    fn test_backoff_doubles() {
        let f = fixture(vec![]);
        assert_eq!(f.worker.backoff(0), Duration::from_millis(1000));
        assert_eq!(f.worker.backoff(1), Duration::from_millis(2000));
        assert_eq!(f.worker.backoff(2), Duration::from_millis(4000));
        assert_eq!(f.worker.backoff(3), Duration::from_millis(8000));
    }

    #[tokio::test]
    async fn test_success_renders_and_acks() {
        let f = fixture(vec![]);
        let d = delivery(json!({"email": "a@b.com", "name": "Ana"}), 0);
        let id = d.envelope.message_id.clone();

        assert_eq!(f.worker.handle(&d).await, Disposition::Ack);

        let sent = f.sender.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "a@b.com");
        assert_eq!(sent[0].1.subject, "Hi Ana");
        assert_eq!(sent[0].1.body, "<p>Welcome Ana</p>");
        assert_eq!(
            statuses(&f.store, &id).await,
            vec![
                (NotificationStatus::Processing, 0),
                (NotificationStatus::Delivered, 0)
            ]
        );
        assert!(f.cache.is_processed(&id).await);
    }

    #[tokio::test]
    async fn test_template_is_cached() {
        let f = fixture(vec![]);
        for _ in 0..3 {
            let d = delivery(json!({"email": "a@b.com"}), 0);
            f.worker.handle(&d).await;
        }
        assert_eq!(f.templates.fetches(), 1);
    }

    #[tokio::test]
    async fn test_cache_outage_degrades() {
        let f = fixture(vec![]);
        f.cache.set_available(false);
        let d = delivery(json!({"email": "a@b.com"}), 0);

        assert_eq!(f.worker.handle(&d).await, Disposition::Ack);
        assert_eq!(f.sender.sent.lock().len(), 1);
        assert_eq!(f.templates.fetches(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_requeues_with_backoff() {
        let f = fixture(vec![AppError::DownstreamTransient("502".into())]);
        let d = delivery(json!({"email": "a@b.com"}), 2);
        let id = d.envelope.message_id.clone();

        assert_eq!(
            f.worker.handle(&d).await,
            Disposition::Requeue {
                delay: Duration::from_millis(4000)
            }
        );
        assert_eq!(
            statuses(&f.store, &id).await.last(),
            Some(&(NotificationStatus::Failed, 0))
        );
        assert!(!f.cache.is_processed(&id).await);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        let f = fixture(vec![AppError::DownstreamTimeout("slow".into())]);
        let d = delivery(json!({"email": "a@b.com"}), 3);

        match f.worker.handle(&d).await {
            Disposition::Reject { reason } => {
                assert!(reason.contains("Retries exhausted after 4 attempts"), "{}", reason)
            }
            other => panic!("expected reject, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_recipient_is_not_retried() {
        let f = fixture(vec![]);
        let d = delivery(json!({"name": "Ana"}), 0);
        let id = d.envelope.message_id.clone();

        assert!(matches!(
            f.worker.handle(&d).await,
            Disposition::Reject { .. }
        ));
        assert!(f.sender.sent.lock().is_empty());
        assert_eq!(
            statuses(&f.store, &id).await,
            vec![
                (NotificationStatus::Processing, 0),
                (NotificationStatus::Failed, 0)
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_template_is_not_retried() {
        let f = fixture(vec![]);
        let mut d = delivery(json!({"email": "a@b.com"}), 0);
        let mut message: DeliveryMessage = serde_json::from_str(&d.envelope.body).unwrap();
        message.record.template_code = "nope".into();
        d.envelope.body = serde_json::to_string(&message).unwrap();

        assert!(matches!(
            f.worker.handle(&d).await,
            Disposition::Reject { .. }
        ));
    }

    #[tokio::test]
    async fn test_processed_message_is_skipped() {
        let f = fixture(vec![]);
        let d = delivery(json!({"email": "a@b.com"}), 0);
        f.cache.mark_processed(&d.envelope.message_id, 60).await;

        assert_eq!(f.worker.handle(&d).await, Disposition::Ack);
        assert!(f.sender.sent.lock().is_empty());
        assert!(
            f.store
                .history(&d.envelope.message_id)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_undecodable_body_is_rejected() {
        let f = fixture(vec![]);
        let mut d = delivery(json!({}), 0);
        d.envelope.body = "{not json".into();

        assert!(matches!(
            f.worker.handle(&d).await,
            Disposition::Reject { .. }
        ));
        let latest = f
            .store
            .latest_status(&d.envelope.message_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.status, NotificationStatus::Failed);
    }

    #[tokio::test]
    async fn test_store_outage_does_not_block_delivery() {
        let f = fixture(vec![]);
        f.store.set_available(false);
        let d = delivery(json!({"email": "a@b.com"}), 0);

        assert_eq!(f.worker.handle(&d).await, Disposition::Ack);
        assert_eq!(f.sender.sent.lock().len(), 1);
    }
}
