//! Webhook dispatcher
//!
//! Each (event, webhook) pair becomes one delivery that moves through
//!
//! ```text
//! PENDING -> DELIVERING -> DELIVERED
//!                 |
//!                 v
//!              FAILED -> DELIVERING (retry, after backoff)
//!                 |
//!                 v
//!               DEAD   (after max_attempts failures)
//! ```
//!
//! `DELIVERED` and `DEAD` are terminal. Deliveries run on spawned tasks so
//! that callers of [`Dispatcher::emit`] never wait on the network.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;

use super::signature::compute_signature;
use super::transport::{OutgoingDelivery, WebhookTransport};
use super::{EventKind, Webhook, WebhookEvent, WebhookRegistry};
use crate::error::{SyncError, SyncResult};

/// Delivery records kept for inspection; oldest finished ones are dropped first.
const MAX_DELIVERY_RECORDS: usize = 1000;

/// State of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    Pending,
    Delivering,
    Delivered,
    Failed,
    Dead,
}

impl DeliveryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryState::Delivered | DeliveryState::Dead)
    }

    pub fn can_transition_to(self, next: DeliveryState) -> bool {
        use DeliveryState::*;
        matches!(
            (self, next),
            (Pending, Delivering)
                | (Delivering, Delivered)
                | (Delivering, Failed)
                | (Failed, Delivering)
                | (Failed, Dead)
        )
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliveryState::Pending => "PENDING",
            DeliveryState::Delivering => "DELIVERING",
            DeliveryState::Delivered => "DELIVERED",
            DeliveryState::Failed => "FAILED",
            DeliveryState::Dead => "DEAD",
        };
        f.write_str(s)
    }
}

/// Observable history of one delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: String,
    pub webhook_id: u64,
    pub event_id: String,
    pub event: EventKind,
    pub state: DeliveryState,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Every state the delivery has been in, in order
    pub history: Vec<DeliveryState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    fn new(webhook_id: u64, event: &WebhookEvent) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            webhook_id,
            event_id: event.id.clone(),
            event: event.kind,
            state: DeliveryState::Pending,
            attempts: 0,
            last_error: None,
            history: vec![DeliveryState::Pending],
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, refusing transitions the state machine does not allow.
    pub fn transition(&mut self, next: DeliveryState) -> Result<(), String> {
        if !self.state.can_transition_to(next) {
            return Err(format!(
                "delivery {}: illegal transition {} -> {}",
                self.id, self.state, next
            ));
        }
        self.state = next;
        self.history.push(next);
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Exponential backoff between delivery attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Attempts before the delivery is declared dead
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let millis = (self.base_delay.as_millis() as u64).saturating_mul(1u64 << exponent);
        Duration::from_millis(millis.min(self.max_delay.as_millis() as u64))
    }
}

struct Shared {
    transport: Arc<dyn WebhookTransport>,
    policy: RetryPolicy,
    records: RwLock<VecDeque<DeliveryRecord>>,
}

impl Shared {
    async fn insert(&self, record: DeliveryRecord) {
        let mut records = self.records.write().await;
        if records.len() >= MAX_DELIVERY_RECORDS {
            if let Some(pos) = records.iter().position(|r| r.state.is_terminal()) {
                records.remove(pos);
            }
        }
        records.push_back(record);
    }

    async fn update<F>(&self, id: &str, f: F) -> Option<DeliveryRecord>
    where
        F: FnOnce(&mut DeliveryRecord),
    {
        let mut records = self.records.write().await;
        let record = records.iter_mut().rev().find(|r| r.id == id)?;
        f(record);
        Some(record.clone())
    }

    async fn transition(&self, id: &str, next: DeliveryState, error: Option<String>) {
        self.update(id, |record| {
            if let Err(e) = record.transition(next) {
                tracing::error!(delivery_id = %record.id, "{}", e);
                return;
            }
            if next == DeliveryState::Delivering {
                record.attempts += 1;
            }
            if error.is_some() {
                record.last_error = error;
            }
        })
        .await;
    }

    async fn run(&self, delivery: OutgoingDelivery) -> DeliveryRecord {
        let id = delivery.delivery_id.clone();

        for attempt in 1..=self.policy.max_attempts {
            self.transition(&id, DeliveryState::Delivering, None).await;
            tracing::debug!(
                delivery_id = %id,
                webhook_id = delivery.webhook_id,
                attempt,
                "Delivering webhook"
            );

            match self.transport.send(&delivery).await {
                Ok(()) => {
                    self.transition(&id, DeliveryState::Delivered, None).await;
                    tracing::info!(
                        delivery_id = %id,
                        webhook_id = delivery.webhook_id,
                        event = %delivery.event,
                        attempt,
                        "Webhook delivered"
                    );
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        delivery_id = %id,
                        webhook_id = delivery.webhook_id,
                        attempt,
                        error = %e,
                        "Webhook delivery attempt failed"
                    );
                    self.transition(&id, DeliveryState::Failed, Some(e.to_string()))
                        .await;
                    if attempt < self.policy.max_attempts {
                        tokio::time::sleep(self.policy.delay_after(attempt)).await;
                    }
                }
            }
        }

        let record = self
            .update(&id, |record| {
                if record.state == DeliveryState::Failed {
                    let _ = record.transition(DeliveryState::Dead);
                }
            })
            .await;

        match record {
            Some(record) => {
                if record.state == DeliveryState::Dead {
                    tracing::error!(
                        delivery_id = %id,
                        webhook_id = delivery.webhook_id,
                        url = %delivery.url,
                        attempts = record.attempts,
                        error = record.last_error.as_deref().unwrap_or("unknown"),
                        "Webhook delivery is dead"
                    );
                }
                record
            }
            None => {
                // Evicted while in flight; only possible under extreme volume.
                tracing::warn!(delivery_id = %id, "Delivery record evicted before completion");
                DeliveryRecord {
                    id,
                    webhook_id: delivery.webhook_id,
                    event_id: String::new(),
                    event: delivery.event,
                    state: DeliveryState::Dead,
                    attempts: self.policy.max_attempts,
                    last_error: Some("record evicted".to_string()),
                    history: vec![DeliveryState::Dead],
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                }
            }
        }
    }
}

/// Fans events out to subscribed webhooks
pub struct Dispatcher {
    webhooks: Arc<WebhookRegistry>,
    shared: Arc<Shared>,
    tasks: Mutex<JoinSet<()>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("policy", &self.shared.policy)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        webhooks: Arc<WebhookRegistry>,
        transport: Arc<dyn WebhookTransport>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            webhooks,
            shared: Arc::new(Shared {
                transport,
                policy,
                records: RwLock::new(VecDeque::new()),
            }),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.shared.policy
    }

    /// Queue `event` for every subscribed webhook and return the delivery ids.
    /// Does not wait for any delivery.
    pub async fn emit(&self, event: WebhookEvent) -> Vec<String> {
        let subscribers = self.webhooks.subscribers(event.kind).await;
        if subscribers.is_empty() {
            tracing::debug!(event = %event.kind, "No webhooks subscribed");
            return Vec::new();
        }

        let body = match serde_json::to_vec(&event) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(event = %event.kind, error = %e, "Failed to serialize event");
                return Vec::new();
            }
        };

        let mut ids = Vec::with_capacity(subscribers.len());
        let mut tasks = self.tasks.lock().await;
        while tasks.try_join_next().is_some() {}

        for webhook in subscribers {
            let delivery = self.prepare(&webhook, &event, body.clone()).await;
            ids.push(delivery.delivery_id.clone());
            let shared = Arc::clone(&self.shared);
            tasks.spawn(async move {
                shared.run(delivery).await;
            });
        }
        ids
    }

    /// Deliver `event` to one webhook and wait for the outcome, retries
    /// included.
    ///
    /// # Errors
    /// `Delivery` if the event cannot be serialized; nothing is sent then.
    pub async fn deliver(&self, webhook: &Webhook, event: &WebhookEvent) -> SyncResult<DeliveryRecord> {
        let body = serde_json::to_vec(event).map_err(|e| {
            tracing::error!(event = %event.kind, webhook_id = webhook.id, error = %e, "Failed to serialize event");
            SyncError::Delivery(format!("cannot serialize {} event: {}", event.kind, e))
        })?;
        let delivery = self.prepare(webhook, event, body).await;
        Ok(self.shared.run(delivery).await)
    }

    async fn prepare(&self, webhook: &Webhook, event: &WebhookEvent, body: Vec<u8>) -> OutgoingDelivery {
        let record = DeliveryRecord::new(webhook.id, event);
        let delivery = OutgoingDelivery {
            delivery_id: record.id.clone(),
            webhook_id: webhook.id,
            url: webhook.url.clone(),
            event: event.kind,
            signature: compute_signature(&webhook.secret, &body),
            body,
        };
        self.shared.insert(record).await;
        delivery
    }

    pub async fn delivery(&self, id: &str) -> Option<DeliveryRecord> {
        self.shared
            .records
            .read()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Known deliveries, oldest first.
    pub async fn deliveries(&self) -> Vec<DeliveryRecord> {
        self.shared.records.read().await.iter().cloned().collect()
    }

    /// Wait for every spawned delivery to finish.
    pub async fn drain(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        let pending = tasks.len();
        if pending > 0 {
            tracing::info!(pending, "Waiting for in-flight webhook deliveries");
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Webhook delivery task panicked");
            }
        }
    }
}
