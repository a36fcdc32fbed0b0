//! Per-channel downstream senders.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};

use herald_common::config::AppConfig;
use herald_common::error::AppError;
use herald_common::types::{Channel, DeliveryMessage, RenderedMessage};

use crate::downstream::{status_error, transport_error};

const RESEND_API_URL: &str = "https://api.resend.com";
const ONESIGNAL_API_URL: &str = "https://onesignal.com/api/v1";

/// Delivers a rendered message to one recipient over one channel.
#[async_trait]
pub trait Sender: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(
        &self,
        recipient: &str,
        rendered: &RenderedMessage,
        message: &DeliveryMessage,
    ) -> Result<(), AppError>;
}

/// Name of the breaker guarding sends on `channel`.
pub fn breaker_name(channel: Channel) -> &'static str {
    match channel {
        Channel::Email => "send_email",
        Channel::Push => "send_push",
    }
}

/// Resolve the recipient for `message` from its variables, then its metadata.
///
/// A missing recipient is a permanent failure; retrying cannot fix it.
pub fn resolve_recipient(message: &DeliveryMessage) -> Result<String, AppError> {
    let keys: &[&str] = match message.record.channel {
        Channel::Email => &["email"],
        Channel::Push => &["device_token", "push_token"],
    };

    keys.iter()
        .filter_map(|key| message.lookup(key))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            AppError::DownstreamPermanent(format!(
                "no {} recipient in variables or metadata (expected {})",
                message.record.channel,
                keys.join(" or ")
            ))
        })
}

/// Pick the configured sender for `channel`, or a [`LogOnlySender`] when the
/// provider credentials are absent.
pub fn build_sender(channel: Channel, config: &AppConfig) -> Arc<dyn Sender> {
    match channel {
        Channel::Email => match (&config.resend_api_key, &config.email_from) {
            (Some(key), Some(from)) => Arc::new(EmailSender::new(key.clone(), from.clone())),
            _ => {
                tracing::warn!("RESEND_API_KEY/EMAIL_FROM not set, email deliveries are log-only");
                Arc::new(LogOnlySender::new(Channel::Email))
            }
        },
        Channel::Push => match (&config.onesignal_app_id, &config.onesignal_api_key) {
            (Some(app_id), Some(key)) => Arc::new(PushSender::new(app_id.clone(), key.clone())),
            _ => {
                tracing::warn!(
                    "ONESIGNAL_APP_ID/ONESIGNAL_API_KEY not set, push deliveries are log-only"
                );
                Arc::new(LogOnlySender::new(Channel::Push))
            }
        },
    }
}

/// Email over the Resend HTTP API.
pub struct EmailSender {
    client: Client,
    api_key: String,
    from: String,
    base_url: String,
}

impl EmailSender {
    pub fn new(api_key: String, from: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            from,
            base_url: RESEND_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn payload(&self, recipient: &str, rendered: &RenderedMessage) -> Value {
        json!({
            "from": self.from,
            "to": [recipient],
            "subject": rendered.subject,
            "html": rendered.body,
        })
    }
}

#[async_trait]
impl Sender for EmailSender {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(
        &self,
        recipient: &str,
        rendered: &RenderedMessage,
        message: &DeliveryMessage,
    ) -> Result<(), AppError> {
        let response = self
            .client
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", &message.record.notification_id)
            .json(&self.payload(recipient, rendered))
            .send()
            .await
            .map_err(|e| transport_error("resend", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // An unknown resource here is a bad request, not a missing template.
            return Err(match status_error("resend", status, &body) {
                AppError::NotFound(detail) => AppError::DownstreamPermanent(detail),
                other => other,
            });
        }

        tracing::info!(
            notification_id = %message.record.notification_id,
            correlation_id = %message.record.correlation_id,
            "Email sent"
        );
        Ok(())
    }
}

/// Push over the OneSignal REST API.
pub struct PushSender {
    client: Client,
    app_id: String,
    api_key: String,
    base_url: String,
}

impl PushSender {
    pub fn new(app_id: String, api_key: String) -> Self {
        Self {
            client: Client::new(),
            app_id,
            api_key,
            base_url: ONESIGNAL_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn payload(&self, device_token: &str, rendered: &RenderedMessage, message: &DeliveryMessage) -> Value {
        let mut data = message.metadata.clone().unwrap_or_default();
        data.insert(
            "notification_id".to_string(),
            json!(message.record.notification_id),
        );

        json!({
            "app_id": self.app_id,
            "include_player_ids": [device_token],
            "headings": {"en": rendered.subject},
            "contents": {"en": rendered.body},
            "data": data,
        })
    }
}

#[async_trait]
impl Sender for PushSender {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn send(
        &self,
        recipient: &str,
        rendered: &RenderedMessage,
        message: &DeliveryMessage,
    ) -> Result<(), AppError> {
        let response = self
            .client
            .post(format!("{}/notifications", self.base_url))
            .header("Authorization", format!("Basic {}", self.api_key))
            .json(&self.payload(recipient, rendered, message))
            .send()
            .await
            .map_err(|e| transport_error("onesignal", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status_error("onesignal", status, &body) {
                AppError::NotFound(detail) => AppError::DownstreamPermanent(detail),
                other => other,
            });
        }

        // OneSignal answers 200 with an `errors` list when every recipient is invalid.
        let body: Value = response.json().await.map_err(|e| {
            AppError::DownstreamTransient(format!("onesignal returned an unreadable body: {}", e))
        })?;
        let Some(id) = body.get("id").and_then(Value::as_str).filter(|id| !id.is_empty()) else {
            return Err(AppError::DownstreamPermanent(format!(
                "onesignal rejected notification: {}",
                body.get("errors").unwrap_or(&Value::Null)
            )));
        };

        tracing::info!(
            notification_id = %message.record.notification_id,
            correlation_id = %message.record.correlation_id,
            provider_id = id,
            "Push notification sent"
        );
        Ok(())
    }
}

/// Logs deliveries instead of sending them; used when no provider is configured.
pub struct LogOnlySender {
    channel: Channel,
}

impl LogOnlySender {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl Sender for LogOnlySender {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(
        &self,
        recipient: &str,
        rendered: &RenderedMessage,
        message: &DeliveryMessage,
    ) -> Result<(), AppError> {
        tracing::info!(
            channel = %self.channel,
            notification_id = %message.record.notification_id,
            correlation_id = %message.record.correlation_id,
            recipient,
            subject = %rendered.subject,
            "Delivery logged (no provider configured)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use herald_common::types::CreateNotificationRequest;
    use herald_common::types::NotificationRecord;

    use super::*;

    fn message(channel: &str, variables: Value, metadata: Option<Value>) -> DeliveryMessage {
        let request: CreateNotificationRequest = serde_json::from_value(json!({
            "notification_type": channel,
            "template_code": "welcome",
            "request_id": "r1",
        }))
        .unwrap();
        DeliveryMessage {
            record: NotificationRecord::new("user-1", &request),
            variables: variables.as_object().cloned().unwrap_or_default(),
            metadata: metadata.and_then(|m| m.as_object().cloned()),
        }
    }

    #[test]
    fn test_email_recipient_from_variables_then_metadata() {
        let m = message("email", json!({"email": "a@b.com"}), Some(json!({"email": "m@b.com"})));
        assert_eq!(resolve_recipient(&m).unwrap(), "a@b.com");

        let m = message("email", json!({"name": "Ana"}), Some(json!({"email": "m@b.com"})));
        assert_eq!(resolve_recipient(&m).unwrap(), "m@b.com");
    }

    #[test]
    fn test_missing_recipient_is_permanent() {
        let m = message("email", json!({"name": "Ana"}), None);
        let err = resolve_recipient(&m).unwrap_err();
        assert_eq!(err.kind().as_str(), "downstream_permanent");
        assert!(!err.is_transient());

        let m = message("email", json!({"email": "  "}), None);
        assert!(resolve_recipient(&m).is_err());
    }

    #[test]
    fn test_push_recipient_keys() {
        let m = message("push", json!({"push_token": "tok-1"}), None);
        assert_eq!(resolve_recipient(&m).unwrap(), "tok-1");
        let m = message("push", json!({}), Some(json!({"device_token": "tok-2"})));
        assert_eq!(resolve_recipient(&m).unwrap(), "tok-2");
        // An email address does not satisfy a push delivery.
        let m = message("push", json!({"email": "a@b.com"}), None);
        assert!(resolve_recipient(&m).is_err());
    }

    #[test]
    fn test_push_payload_shape() {
        let sender = PushSender::new("app-1".into(), "key".into());
        let m = message("push", json!({}), Some(json!({"deep_link": "/orders/1"})));
        let rendered = RenderedMessage {
            subject: "Shipped".into(),
            body: "Your order shipped".into(),
        };
        let payload = sender.payload("tok-1", &rendered, &m);
        assert_eq!(payload["app_id"], "app-1");
        assert_eq!(payload["include_player_ids"], json!(["tok-1"]));
        assert_eq!(payload["headings"]["en"], "Shipped");
        assert_eq!(payload["data"]["deep_link"], "/orders/1");
        assert_eq!(payload["data"]["notification_id"], json!(m.record.notification_id));
    }

    #[test]
    fn test_email_payload_shape() {
        let sender = EmailSender::new("key".into(), "noreply@herald.dev".into());
        let rendered = RenderedMessage {
            subject: "Hi Ana".into(),
            body: "<p>Welcome</p>".into(),
        };
        let payload = sender.payload("a@b.com", &rendered);
        assert_eq!(payload["to"], json!(["a@b.com"]));
        assert_eq!(payload["html"], "<p>Welcome</p>");
        assert_eq!(breaker_name(Channel::Email), "send_email");
    }
}
