//! Outbound webhooks
//!
//! Clients register webhook endpoints with an event filter. When the engine
//! emits an event, the [`Dispatcher`] delivers a signed JSON envelope to every
//! enabled webhook subscribed to that event kind, retrying with exponential
//! backoff.

pub mod dispatcher;
pub mod registry;
pub mod signature;
pub mod transport;

pub use dispatcher::{DeliveryRecord, DeliveryState, Dispatcher, RetryPolicy};
pub use registry::WebhookRegistry;
pub use signature::{compute_signature, verify_signature};
pub use transport::{HttpTransport, OutgoingDelivery, TransportError, WebhookTransport};

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kinds of events a webhook can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A sync run processed its whole batch
    #[serde(rename = "sync.completed")]
    SyncCompleted,
    /// A sync run was cancelled part-way
    #[serde(rename = "sync.partial")]
    SyncPartial,
    /// A mapping plan was saved or replaced
    #[serde(rename = "mapping.saved")]
    MappingSaved,
    /// A connection was disabled
    #[serde(rename = "connection.disabled")]
    ConnectionDisabled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SyncCompleted => "sync.completed",
            EventKind::SyncPartial => "sync.partial",
            EventKind::MappingSaved => "mapping.saved",
            EventKind::ConnectionDisabled => "connection.disabled",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The envelope delivered to webhook endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    pub data: Value,
}

impl WebhookEvent {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            occurred_at: Utc::now(),
            data,
        }
    }
}

/// Request body for registering a webhook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSpec {
    pub url: String,
    pub events: BTreeSet<EventKind>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub connection_id: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl WebhookSpec {
    pub fn new(url: impl Into<String>, events: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            url: url.into(),
            events: events.into_iter().collect(),
            secret: None,
            connection_id: None,
            enabled: true,
        }
    }
}

/// A registered webhook endpoint
#[derive(Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: u64,
    pub url: String,
    pub events: BTreeSet<EventKind>,
    pub secret: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl Webhook {
    pub fn subscribes_to(&self, kind: EventKind) -> bool {
        self.enabled && self.events.contains(&kind)
    }

    /// The view of this webhook without its secret.
    pub fn redacted(&self) -> WebhookView {
        WebhookView {
            id: self.id,
            url: self.url.clone(),
            events: self.events.clone(),
            enabled: self.enabled,
            connection_id: self.connection_id,
            created_at: self.created_at,
        }
    }
}

/// Client-facing webhook without the signing secret
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookView {
    pub id: u64,
    pub url: String,
    pub events: BTreeSet<EventKind>,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for Webhook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Webhook")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("events", &self.events)
            .field("secret", &"<redacted>")
            .field("enabled", &self.enabled)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_serde() {
        let json = serde_json::to_string(&EventKind::SyncCompleted).unwrap();
        assert_eq!(json, "\"sync.completed\"");

        let kind: EventKind = serde_json::from_str("\"connection.disabled\"").unwrap();
        assert_eq!(kind, EventKind::ConnectionDisabled);
        assert_eq!(kind.to_string(), "connection.disabled");
    }

    #[test]
    fn test_spec_defaults_enabled() {
        let spec: WebhookSpec =
            serde_json::from_str(r#"{"url": "https://x.test/hook", "events": ["sync.completed"]}"#)
                .unwrap();
        assert!(spec.enabled);
        assert!(spec.secret.is_none());
        assert!(spec.events.contains(&EventKind::SyncCompleted));
    }

    #[test]
    fn test_event_envelope() {
        let event = WebhookEvent::new(EventKind::MappingSaved, serde_json::json!({"plan_id": 1}));
        assert_eq!(event.id.len(), 36);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "mapping.saved");
        assert_eq!(json["data"]["plan_id"], 1);
    }

    #[test]
    fn test_disabled_webhook_does_not_subscribe() {
        let mut hook = Webhook {
            id: 1,
            url: "https://x.test".to_string(),
            events: [EventKind::SyncCompleted].into_iter().collect(),
            secret: "s".to_string(),
            enabled: true,
            connection_id: None,
            created_at: Utc::now(),
        };
        assert!(hook.subscribes_to(EventKind::SyncCompleted));
        assert!(!hook.subscribes_to(EventKind::SyncPartial));

        hook.enabled = false;
        assert!(!hook.subscribes_to(EventKind::SyncCompleted));
        assert!(!format!("{:?}", hook).contains("\"s\""));

        let view = serde_json::to_value(hook.redacted()).unwrap();
        assert!(view.get("secret").is_none());
        assert_eq!(view["enabled"], false);
    }
}
