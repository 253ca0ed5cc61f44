//! Connections to external systems
//!
//! A connection holds the credentials the engine needs to talk to one
//! external system (a CRM, an ads platform, a generic HTTP service). The
//! [`ConnectionRegistry`] is the sole owner of connection state; everything
//! else refers to connections by id.

pub mod registry;

pub use registry::ConnectionRegistry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of external system a connection points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    /// Bitrix24 CRM
    Bitrix24,
    /// Facebook lead ads
    Facebook,
    /// HubSpot CRM
    Hubspot,
    /// Any JSON-over-HTTP service
    GenericHttp,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::Bitrix24 => write!(f, "bitrix24"),
            ConnectionKind::Facebook => write!(f, "facebook"),
            ConnectionKind::Hubspot => write!(f, "hubspot"),
            ConnectionKind::GenericHttp => write!(f, "generic_http"),
        }
    }
}

/// Whether a connection may be used by mapping plans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Active,
    Disabled,
}

/// Opaque secret material for an external system.
///
/// `Debug` never prints the tokens.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Request body for creating or updating a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub name: String,
    pub kind: ConnectionKind,
    pub credentials: Credentials,
}

impl ConnectionSpec {
    /// Convenience constructor with only an access token.
    pub fn new(name: impl Into<String>, kind: ConnectionKind, access_token: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            credentials: Credentials {
                access_token: access_token.into(),
                refresh_token: None,
                expires_at: None,
            },
        }
    }
}

/// A registered connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: u64,
    pub name: String,
    pub kind: ConnectionKind,
    pub credentials: Credentials,
    pub status: ConnectionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    pub fn is_active(&self) -> bool {
        self.status == ConnectionStatus::Active
    }

    /// The view of this connection that is safe to hand to clients.
    pub fn redacted(&self) -> ConnectionView {
        ConnectionView {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            status: self.status,
            has_refresh_token: self.credentials.refresh_token.is_some(),
            expires_at: self.credentials.expires_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Client-facing connection without secret material
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionView {
    pub id: u64,
    pub name: String,
    pub kind: ConnectionKind,
    pub status: ConnectionStatus,
    pub has_refresh_token: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
