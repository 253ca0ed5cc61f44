//! Error taxonomy for the integration engine.
//!
//! Every failure that crosses a component boundary is a [`SyncError`]. The
//! variants map one-to-one onto the [`ErrorKind`] values that the HTTP API
//! reports to clients. Per-record transform failures never become a
//! `SyncError`; they are counted by the executor and summarized in the log
//! entry instead.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mapping::MappingRuleSpec;

/// Coarse classification of an error, stable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input, user-correctable
    Validation,
    /// A referenced id does not exist
    NotFound,
    /// A mapping plan failed to compile
    Compilation,
    /// A webhook could not be delivered
    Delivery,
    /// The log store could not persist an entry
    Storage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Compilation => write!(f, "compilation"),
            ErrorKind::Delivery => write!(f, "delivery"),
            ErrorKind::Storage => write!(f, "storage"),
        }
    }
}

/// The rule that caused a compilation failure, with its position in the
/// submitted rule list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffendingRule {
    /// Zero-based index into the submitted rules
    pub index: usize,
    /// The rule as submitted
    pub rule: MappingRuleSpec,
}

/// Errors surfaced by the engine's components.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Input failed validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// The referenced entity does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u64 },

    /// A mapping plan could not be compiled. Nothing was stored.
    #[error("compilation error: {reason}")]
    Compilation {
        reason: String,
        offending_rule: Option<OffendingRule>,
    },

    /// A webhook delivery was abandoned.
    #[error("delivery error: {0}")]
    Delivery(String),

    /// The log store failed to persist an entry. Not retried.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl SyncError {
    /// Shorthand for a [`SyncError::NotFound`].
    pub fn not_found(entity: &'static str, id: u64) -> Self {
        SyncError::NotFound { entity, id }
    }

    /// A compilation failure that is not tied to a single rule.
    pub fn compilation(reason: impl Into<String>) -> Self {
        SyncError::Compilation {
            reason: reason.into(),
            offending_rule: None,
        }
    }

    /// A compilation failure caused by the rule at `index`.
    pub fn compilation_at(reason: impl Into<String>, index: usize, rule: &MappingRuleSpec) -> Self {
        SyncError::Compilation {
            reason: reason.into(),
            offending_rule: Some(OffendingRule {
                index,
                rule: rule.clone(),
            }),
        }
    }

    /// The wire classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::NotFound { .. } => ErrorKind::NotFound,
            SyncError::Compilation { .. } => ErrorKind::Compilation,
            SyncError::Delivery(_) => ErrorKind::Delivery,
            SyncError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// The offending rule, for compilation errors that have one.
    pub fn offending_rule(&self) -> Option<&OffendingRule> {
        match self {
            SyncError::Compilation { offending_rule, .. } => offending_rule.as_ref(),
            _ => None,
        }
    }
}

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;
