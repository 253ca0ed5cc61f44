//! Delivery transport
//!
//! The dispatcher hands fully signed requests to a [`WebhookTransport`]. The
//! production implementation posts them with `reqwest`; tests substitute a
//! scripted transport.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;

use super::signature::{DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER};
use super::EventKind;

/// A signed request ready to send
#[derive(Debug, Clone)]
pub struct OutgoingDelivery {
    pub delivery_id: String,
    pub webhook_id: u64,
    pub url: String,
    pub event: EventKind,
    pub signature: String,
    pub body: Vec<u8>,
}

/// Why a single attempt failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The endpoint answered with a non-success status
    #[error("endpoint returned HTTP {0}")]
    Status(u16),

    /// The request never produced a response
    #[error("request failed: {0}")]
    Request(String),
}

/// Sends one delivery attempt
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// Send the delivery. `Ok` means the endpoint acknowledged it with a 2xx.
    async fn send(&self, delivery: &OutgoingDelivery) -> Result<(), TransportError>;
}

/// HTTP transport backed by a shared `reqwest` client
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Build a transport whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("syncbridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Request(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn send(&self, delivery: &OutgoingDelivery) -> Result<(), TransportError> {
        let response = self
            .client
            .post(&delivery.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, &delivery.signature)
            .header(EVENT_HEADER, delivery.event.as_str())
            .header(DELIVERY_HEADER, &delivery.delivery_id)
            .body(delivery.body.clone())
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status(status.as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        assert_eq!(
            TransportError::Status(503).to_string(),
            "endpoint returned HTTP 503"
        );
        assert_eq!(
            TransportError::Request("connection refused".to_string()).to_string(),
            "request failed: connection refused"
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_request_error() {
        let transport = HttpTransport::new(Duration::from_millis(500)).unwrap();
        let delivery = OutgoingDelivery {
            delivery_id: "d-1".to_string(),
            webhook_id: 1,
            // Port 9 (discard) on localhost is closed in test environments.
            url: "http://127.0.0.1:9/hook".to_string(),
            event: EventKind::SyncCompleted,
            signature: "sha256=00".to_string(),
            body: b"{}".to_vec(),
        };

        let err = transport.send(&delivery).await.unwrap_err();
        assert!(matches!(err, TransportError::Request(_)));
    }
}
