use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Template placeholder values carried on a notification.
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// Notification delivery medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Channel {
    Email,
    Push,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Email, Channel::Push];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Push => "push",
        }
    }

    /// Routing key used on the live exchange.
    pub fn routing_key(&self) -> &'static str {
        self.as_str()
    }

    /// Routing key used on the dead-letter exchange.
    pub fn failed_routing_key(&self) -> &'static str {
        match self {
            Channel::Email => "email_failed",
            Channel::Push => "push_failed",
        }
    }

    /// Name of the durable queue that holds this channel's live traffic.
    pub fn queue_name(&self) -> &'static str {
        match self {
            Channel::Email => "email.queue",
            Channel::Push => "push.queue",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Channel::Email),
            "push" => Ok(Channel::Push),
            other => Err(format!("unknown channel '{}'", other)),
        }
    }
}

/// Lifecycle status of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationStatus::Pending => write!(f, "pending"),
            NotificationStatus::Processing => write!(f, "processing"),
            NotificationStatus::Delivered => write!(f, "delivered"),
            NotificationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A notification accepted by the enqueue gateway. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationRecord {
    pub notification_id: String,
    pub user_id: String,
    #[serde(rename = "notification_type")]
    pub channel: Channel,
    pub template_code: String,
    /// Caller-supplied idempotency key
    pub request_id: String,
    /// System-generated trace id, carried as a broker header
    pub correlation_id: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl NotificationRecord {
    /// Build a fresh record for an incoming request, generating both identifiers.
    pub fn new(user_id: &str, request: &CreateNotificationRequest) -> Self {
        Self {
            notification_id: format!("notif_{}", Uuid::new_v4()),
            user_id: user_id.to_string(),
            channel: request.notification_type,
            template_code: request.template_code.clone(),
            request_id: request.request_id.clone(),
            correlation_id: format!("corr_{}", Uuid::new_v4()),
            priority: request.priority,
            created_at: Utc::now(),
        }
    }
}

/// One entry in a notification's append-only status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StatusEvent {
    /// Insertion sequence; "latest" is the maximum.
    pub id: i64,
    pub notification_id: String,
    pub status: NotificationStatus,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub retry_count: i32,
}

/// Wire payload published to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryMessage {
    #[serde(flatten)]
    pub record: NotificationRecord,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Variables>,
}

impl DeliveryMessage {
    /// Look a key up in `variables`, then in `metadata`.
    pub fn lookup(&self, key: &str) -> Option<&serde_json::Value> {
        self.variables
            .get(key)
            .or_else(|| self.metadata.as_ref().and_then(|m| m.get(key)))
    }
}

/// Body of an enqueue request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNotificationRequest {
    pub notification_type: Channel,
    pub template_code: String,
    #[serde(default)]
    pub variables: Variables,
    pub request_id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub metadata: Option<Variables>,
}

/// Acknowledgment returned to the enqueue caller. This is not a delivery receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueReceipt {
    pub notification_id: String,
    pub latest_status: NotificationStatus,
    /// `true` when the request replayed an earlier `request_id`
    pub idempotent: bool,
}

/// Status report posted by an out-of-process reporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub notification_id: String,
    pub status: NotificationStatus,
    #[serde(default)]
    pub error: Option<String>,
}

/// Subject and body of a stored template, using `{{placeholder}}` syntax.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub subject: String,
    pub body: String,
}

/// A template after placeholder substitution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CreateNotificationRequest {
        serde_json::from_value(serde_json::json!({
            "notification_type": "email",
            "template_code": "welcome",
            "variables": {"email": "a@b.com", "name": "Ana"},
            "request_id": "r1",
            "priority": 2
        }))
        .unwrap()
    }

    #[test]
    fn test_channel_routing() {
        assert_eq!(Channel::Email.routing_key(), "email");
        assert_eq!(Channel::Push.failed_routing_key(), "push_failed");
        assert_eq!(Channel::Push.queue_name(), "push.queue");
        assert_eq!("push".parse::<Channel>().unwrap(), Channel::Push);
        assert!("sms".parse::<Channel>().is_err());
    }

    #[test]
    fn test_record_generates_prefixed_ids() {
        let record = NotificationRecord::new("user-1", &request());
        assert!(record.notification_id.starts_with("notif_"));
        assert!(record.correlation_id.starts_with("corr_"));
        assert_eq!(record.channel, Channel::Email);
        assert_eq!(record.priority, 2);

        let other = NotificationRecord::new("user-1", &request());
        assert_ne!(record.notification_id, other.notification_id);
    }

    #[test]
    fn test_delivery_message_wire_shape() {
        let req = request();
        let message = DeliveryMessage {
            record: NotificationRecord::new("user-1", &req),
            variables: req.variables.clone(),
            metadata: None,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["notification_type"], "email");
        assert_eq!(json["request_id"], "r1");
        assert_eq!(json["variables"]["name"], "Ana");
        assert!(json.get("metadata").is_none());

        let back: DeliveryMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_lookup_prefers_variables_over_metadata() {
        let req = request();
        let mut metadata = Variables::new();
        metadata.insert("email".into(), "meta@b.com".into());
        metadata.insert("device_token".into(), "tok".into());
        let message = DeliveryMessage {
            record: NotificationRecord::new("user-1", &req),
            variables: req.variables,
            metadata: Some(metadata),
        };
        assert_eq!(message.lookup("email").unwrap(), "a@b.com");
        assert_eq!(message.lookup("device_token").unwrap(), "tok");
        assert!(message.lookup("missing").is_none());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(NotificationStatus::Processing.to_string(), "processing");
        assert_eq!(
            serde_json::to_value(NotificationStatus::Delivered).unwrap(),
            "delivered"
        );
    }
}
