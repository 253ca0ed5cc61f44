//! Connection registry
//!
//! Stores connections by id and validates credentials on every write.
//! Cross-component effects of disabling or deleting a connection (suspending
//! plans, refusing deletion while referenced) live in the engine, which is the
//! only caller that can see both connections and plans.

use std::collections::BTreeMap;

use chrono::Utc;
use tokio::sync::RwLock;

use super::{Connection, ConnectionSpec, ConnectionStatus};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Default)]
struct Inner {
    connections: BTreeMap<u64, Connection>,
    next_id: u64,
}

/// Registry of external-system connections
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection.
    ///
    /// # Errors
    /// `Validation` when the name is empty or the credentials are malformed.
    pub async fn create(&self, spec: ConnectionSpec) -> SyncResult<Connection> {
        validate_spec(&spec)?;

        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        let now = Utc::now();
        let connection = Connection {
            id: inner.next_id,
            name: spec.name.trim().to_string(),
            kind: spec.kind,
            credentials: spec.credentials,
            status: ConnectionStatus::Active,
            created_at: now,
            updated_at: now,
        };
        inner.connections.insert(connection.id, connection.clone());

        tracing::info!(connection_id = connection.id, kind = %connection.kind, "Connection created");
        Ok(connection)
    }

    pub async fn get(&self, id: u64) -> SyncResult<Connection> {
        self.inner
            .read()
            .await
            .connections
            .get(&id)
            .cloned()
            .ok_or_else(|| SyncError::not_found("connection", id))
    }

    /// All connections, ordered by id.
    pub async fn list(&self) -> Vec<Connection> {
        self.inner.read().await.connections.values().cloned().collect()
    }

    /// Replace name, kind and credentials. Status is left untouched.
    pub async fn update(&self, id: u64, spec: ConnectionSpec) -> SyncResult<Connection> {
        validate_spec(&spec)?;

        let mut inner = self.inner.write().await;
        let connection = inner
            .connections
            .get_mut(&id)
            .ok_or_else(|| SyncError::not_found("connection", id))?;
        connection.name = spec.name.trim().to_string();
        connection.kind = spec.kind;
        connection.credentials = spec.credentials;
        connection.updated_at = Utc::now();

        tracing::info!(connection_id = id, "Connection updated");
        Ok(connection.clone())
    }

    pub async fn disable(&self, id: u64) -> SyncResult<Connection> {
        self.set_status(id, ConnectionStatus::Disabled).await
    }

    pub async fn enable(&self, id: u64) -> SyncResult<Connection> {
        self.set_status(id, ConnectionStatus::Active).await
    }

    /// Remove a connection. Callers must check plan references first.
    pub async fn remove(&self, id: u64) -> SyncResult<Connection> {
        let removed = self
            .inner
            .write()
            .await
            .connections
            .remove(&id)
            .ok_or_else(|| SyncError::not_found("connection", id))?;
        tracing::info!(connection_id = id, "Connection deleted");
        Ok(removed)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.connections.is_empty()
    }

    async fn set_status(&self, id: u64, status: ConnectionStatus) -> SyncResult<Connection> {
        let mut inner = self.inner.write().await;
        let connection = inner
            .connections
            .get_mut(&id)
            .ok_or_else(|| SyncError::not_found("connection", id))?;
        if connection.status != status {
            connection.status = status;
            connection.updated_at = Utc::now();
            tracing::info!(connection_id = id, status = ?status, "Connection status changed");
        }
        Ok(connection.clone())
    }
}

fn validate_spec(spec: &ConnectionSpec) -> SyncResult<()> {
    if spec.name.trim().is_empty() {
        return Err(SyncError::Validation(
            "connection name cannot be empty".to_string(),
        ));
    }

    let creds = &spec.credentials;
    if creds.access_token.trim().is_empty() {
        return Err(SyncError::Validation(
            "access token cannot be empty".to_string(),
        ));
    }
    if creds.access_token.chars().any(char::is_whitespace) {
        return Err(SyncError::Validation(
            "access token must not contain whitespace".to_string(),
        ));
    }
    if let Some(refresh) = &creds.refresh_token {
        if refresh.trim().is_empty() {
            return Err(SyncError::Validation(
                "refresh token, when present, cannot be empty".to_string(),
            ));
        }
    }
    if let Some(expires_at) = creds.expires_at {
        if expires_at <= Utc::now() {
            return Err(SyncError::Validation(format!(
                "credentials expired at {}",
                expires_at.to_rfc3339()
            )));
        }
    }

    Ok(())
}
