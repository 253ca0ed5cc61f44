//! Webhook registry

use std::collections::BTreeMap;

use chrono::Utc;
use reqwest::Url;
use tokio::sync::RwLock;

use super::{EventKind, Webhook, WebhookSpec};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Default)]
struct Inner {
    webhooks: BTreeMap<u64, Webhook>,
    next_id: u64,
}

/// Registered webhook endpoints, keyed by id
#[derive(Debug, Default)]
pub struct WebhookRegistry {
    inner: RwLock<Inner>,
}

impl WebhookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a webhook. A secret is generated when none is supplied.
    pub async fn create(&self, spec: WebhookSpec) -> SyncResult<Webhook> {
        validate_url(&spec.url)?;
        if spec.events.is_empty() {
            return Err(SyncError::Validation(
                "webhook must subscribe to at least one event".to_string(),
            ));
        }
        let secret = match spec.secret {
            Some(secret) if secret.trim().is_empty() => {
                return Err(SyncError::Validation(
                    "webhook secret, when present, cannot be empty".to_string(),
                ))
            }
            Some(secret) => secret,
            None => uuid::Uuid::new_v4().simple().to_string(),
        };

        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        let webhook = Webhook {
            id: inner.next_id,
            url: spec.url.trim().to_string(),
            events: spec.events,
            secret,
            enabled: spec.enabled,
            connection_id: spec.connection_id,
            created_at: Utc::now(),
        };
        inner.webhooks.insert(webhook.id, webhook.clone());

        tracing::info!(webhook_id = webhook.id, url = %webhook.url, "Webhook registered");
        Ok(webhook)
    }

    pub async fn get(&self, id: u64) -> SyncResult<Webhook> {
        self.inner
            .read()
            .await
            .webhooks
            .get(&id)
            .cloned()
            .ok_or_else(|| SyncError::not_found("webhook", id))
    }

    pub async fn list(&self) -> Vec<Webhook> {
        self.inner.read().await.webhooks.values().cloned().collect()
    }

    pub async fn list_active(&self) -> Vec<Webhook> {
        self.inner
            .read()
            .await
            .webhooks
            .values()
            .filter(|w| w.enabled)
            .cloned()
            .collect()
    }

    /// Enabled webhooks whose filter includes `kind`.
    pub async fn subscribers(&self, kind: EventKind) -> Vec<Webhook> {
        self.inner
            .read()
            .await
            .webhooks
            .values()
            .filter(|w| w.subscribes_to(kind))
            .cloned()
            .collect()
    }

    pub async fn set_enabled(&self, id: u64, enabled: bool) -> SyncResult<Webhook> {
        let mut inner = self.inner.write().await;
        let webhook = inner
            .webhooks
            .get_mut(&id)
            .ok_or_else(|| SyncError::not_found("webhook", id))?;
        webhook.enabled = enabled;
        Ok(webhook.clone())
    }

    pub async fn delete(&self, id: u64) -> SyncResult<Webhook> {
        let removed = self
            .inner
            .write()
            .await
            .webhooks
            .remove(&id)
            .ok_or_else(|| SyncError::not_found("webhook", id))?;
        tracing::info!(webhook_id = id, "Webhook deleted");
        Ok(removed)
    }
}

fn validate_url(raw: &str) -> SyncResult<()> {
    let url = Url::parse(raw.trim())
        .map_err(|e| SyncError::Validation(format!("invalid callback URL '{}': {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SyncError::Validation(format!(
            "callback URL must use http or https, got '{}'",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(SyncError::Validation(
            "callback URL must include a host".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn spec(url: &str) -> WebhookSpec {
        WebhookSpec::new(url, [EventKind::SyncCompleted])
    }

    #[tokio::test]
    async fn test_create_generates_secret() {
        let registry = WebhookRegistry::new();
        let hook = registry.create(spec("https://hooks.test/in")).await.unwrap();

        assert_eq!(hook.id, 1);
        assert_eq!(hook.secret.len(), 32);
        assert!(hook.enabled);
    }

    #[tokio::test]
    async fn test_create_keeps_supplied_secret() {
        let registry = WebhookRegistry::new();
        let mut s = spec("http://localhost:9000/in");
        s.secret = Some("mine".to_string());
        let hook = registry.create(s).await.unwrap();
        assert_eq!(hook.secret, "mine");
    }

    #[tokio::test]
    async fn test_create_validation() {
        let registry = WebhookRegistry::new();

        let err = registry.create(spec("not a url")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = registry.create(spec("ftp://files.test/in")).await.unwrap_err();
        assert!(err.to_string().contains("http or https"));

        let no_events = WebhookSpec::new("https://hooks.test/in", []);
        assert!(registry.create(no_events).await.is_err());

        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_filtering() {
        let registry = WebhookRegistry::new();
        let a = registry.create(spec("https://a.test/")).await.unwrap();
        let b = registry
            .create(WebhookSpec::new(
                "https://b.test/",
                [EventKind::SyncCompleted, EventKind::MappingSaved],
            ))
            .await
            .unwrap();
        registry.set_enabled(a.id, false).await.unwrap();

        let completed: Vec<u64> = registry
            .subscribers(EventKind::SyncCompleted)
            .await
            .iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(completed, vec![b.id]);
        assert!(registry.subscribers(EventKind::SyncPartial).await.is_empty());
        assert_eq!(registry.list_active().await.len(), 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let registry = WebhookRegistry::new();
        let hook = registry.create(spec("https://a.test/")).await.unwrap();

        registry.delete(hook.id).await.unwrap();
        assert_eq!(
            registry.get(hook.id).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
