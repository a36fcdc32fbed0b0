//! Transport envelope and delivery handle.

use std::collections::BTreeMap;

use serde::Serialize;

use herald_common::error::AppError;

/// Header carrying the number of redeliveries a message has been through.
pub const HEADER_RETRY_COUNT: &str = "x-retry-count";
/// Header naming the queue a dead-lettered message was rejected from.
pub const HEADER_DEATH_QUEUE: &str = "x-death-queue";
/// Header carrying the reason a message was dead-lettered.
pub const HEADER_DEATH_REASON: &str = "x-death-reason";

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Transport metadata supplied by a publisher.
#[derive(Debug, Clone, Default)]
pub struct PublishProperties {
    /// Stable message identifier; the notification id for delivery messages
    pub message_id: String,
    pub correlation_id: String,
    pub headers: BTreeMap<String, String>,
}

/// A message as it travels through the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message_id: String,
    pub correlation_id: String,
    /// Redeliveries so far; carried on the envelope rather than a shared counter
    pub retry_count: u32,
    /// Must survive a broker restart
    pub persistent: bool,
    pub content_type: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl Envelope {
    /// Serialize `payload` into a persistent JSON envelope.
    pub fn json<T: Serialize>(payload: &T, properties: PublishProperties) -> Result<Self, AppError> {
        let body = serde_json::to_string(payload)
            .map_err(|e| AppError::Internal(format!("Failed to serialize payload: {}", e)))?;

        Ok(Self {
            message_id: properties.message_id,
            correlation_id: properties.correlation_id,
            retry_count: 0,
            persistent: true,
            content_type: CONTENT_TYPE_JSON.to_string(),
            headers: properties.headers,
            body,
        })
    }

    /// Copy of this envelope for the next redelivery attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            ..self.clone()
        }
    }

    /// Copy of this envelope annotated for the dead-letter queue.
    pub fn dead_lettered(&self, queue: &str, reason: &str) -> Self {
        let mut envelope = self.clone();
        envelope
            .headers
            .insert(HEADER_DEATH_QUEUE.to_string(), queue.to_string());
        envelope
            .headers
            .insert(HEADER_DEATH_REASON.to_string(), reason.to_string());
        envelope
    }

    /// Transport fields written alongside the body, in a fixed order.
    pub fn fields(&self) -> Result<Vec<(&'static str, String)>, AppError> {
        let headers = serde_json::to_string(&self.headers)
            .map_err(|e| AppError::Internal(format!("Failed to serialize headers: {}", e)))?;

        Ok(vec![
            ("message_id", self.message_id.clone()),
            ("correlation_id", self.correlation_id.clone()),
            (HEADER_RETRY_COUNT, self.retry_count.to_string()),
            ("persistent", if self.persistent { "1" } else { "0" }.to_string()),
            ("content_type", self.content_type.clone()),
            ("headers", headers),
            ("body", self.body.clone()),
        ])
    }

    /// Rebuild an envelope from transport fields. `get` returns a field by name.
    pub fn from_fields<F>(get: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let body = get("body")
            .ok_or_else(|| AppError::Internal("Message is missing its body".to_string()))?;
        let headers = match get("headers") {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| AppError::Internal(format!("Malformed message headers: {}", e)))?,
            None => BTreeMap::new(),
        };

        Ok(Self {
            message_id: get("message_id").unwrap_or_default(),
            correlation_id: get("correlation_id").unwrap_or_default(),
            retry_count: get(HEADER_RETRY_COUNT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            persistent: get("persistent").as_deref() != Some("0"),
            content_type: get("content_type").unwrap_or_else(|| CONTENT_TYPE_JSON.to_string()),
            headers,
            body,
        })
    }
}

/// A message handed to a consumer, pending acknowledgment.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    /// Backend-specific delivery tag used to acknowledge or reject
    pub tag: String,
    /// `true` when the message was reclaimed from a consumer that never acknowledged it
    pub redelivered: bool,
    pub envelope: Envelope,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        let mut headers = BTreeMap::new();
        headers.insert("x-trace-id".to_string(), "corr_1".to_string());
        Envelope::json(
            &serde_json::json!({"hello": "world"}),
            PublishProperties {
                message_id: "notif_1".into(),
                correlation_id: "corr_1".into(),
                headers,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_json_envelope_is_persistent() {
        let envelope = envelope();
        assert!(envelope.persistent);
        assert_eq!(envelope.retry_count, 0);
        assert_eq!(envelope.content_type, CONTENT_TYPE_JSON);
        assert_eq!(envelope.body, r#"{"hello":"world"}"#);
    }

    #[test]
    fn test_fields_carry_transport_metadata() {
        let envelope = envelope().next_attempt();
        let fields = envelope.fields().unwrap();
        let get = |name: &str| {
            fields
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get("message_id").unwrap(), "notif_1");
        assert_eq!(get("correlation_id").unwrap(), "corr_1");
        assert_eq!(get(HEADER_RETRY_COUNT).unwrap(), "1");
        assert_eq!(get("persistent").unwrap(), "1");

        let rebuilt = Envelope::from_fields(get).unwrap();
        assert_eq!(rebuilt, envelope);
    }

    #[test]
    fn test_from_fields_requires_body() {
        assert!(Envelope::from_fields(|_| None).is_err());
    }

    #[test]
    fn test_dead_lettered_headers() {
        let dead = envelope().dead_lettered("email.queue", "retries exhausted");
        assert_eq!(dead.headers[HEADER_DEATH_QUEUE], "email.queue");
        assert_eq!(dead.headers[HEADER_DEATH_REASON], "retries exhausted");
        assert_eq!(dead.headers["x-trace-id"], "corr_1");
    }
}
