use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a delivered message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The only thing the consumer needs from a broker message: an id for
/// correlation and the field naming its tenant.
pub trait TenantEnvelope: Send + Sync {
    fn message_id(&self) -> &MessageId;

    /// Raw tenant identifier as carried by the message. `None` or blank
    /// values are rejected as ambiguous.
    fn tenant_field(&self) -> Option<&str>;
}

/// Generic envelope for brokers without their own message type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    pub payload: T,
    #[serde(default)]
    pub attempt: u32,
    pub published_at: DateTime<Utc>,
}

impl<T> Envelope<T> {
    pub fn new(tenant: impl Into<String>, payload: T) -> Self {
        Self {
            id: MessageId::new(),
            tenant: Some(tenant.into()),
            payload,
            attempt: 0,
            published_at: Utc::now(),
        }
    }

    /// Envelope carrying no tenant field at all.
    pub fn untagged(payload: T) -> Self {
        Self {
            id: MessageId::new(),
            tenant: None,
            payload,
            attempt: 0,
            published_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = id.into();
        self
    }
}

impl<T: Send + Sync> TenantEnvelope for Envelope<T> {
    fn message_id(&self) -> &MessageId {
        &self.id
    }

    fn tenant_field(&self) -> Option<&str> {
        self.tenant.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_field_is_read_from_wire_format() {
        let envelope: Envelope<serde_json::Value> = serde_json::from_str(
            r#"{"id": "m-1", "tenant": "acme", "payload": {"order": 7}, "published_at": "2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(envelope.message_id().as_str(), "m-1");
        assert_eq!(envelope.tenant_field(), Some("acme"));
        assert_eq!(envelope.attempt, 0);
    }

    #[test]
    fn untagged_envelope_has_no_tenant() {
        assert_eq!(Envelope::untagged(()).tenant_field(), None);
    }
}
