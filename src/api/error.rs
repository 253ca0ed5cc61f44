//! HTTP error responses
//!
//! Every failure is returned as
//! `{"error": {"kind": "...", "message": "...", "offending_rule": ...}}`.

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, OffendingRule, SyncError};

/// Errors returned by API handlers
#[derive(Debug)]
pub enum ApiError {
    /// An engine operation failed
    Engine(SyncError),
    /// The request could not be decoded
    BadRequest(String),
    /// Missing or wrong bearer token
    Unauthorized,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Engine(e) => write!(f, "{}", e),
            ApiError::BadRequest(msg) => write!(f, "invalid request: {}", msg),
            ApiError::Unauthorized => write!(f, "missing or invalid bearer token"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        ApiError::Engine(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// Body of an error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offending_rule: Option<OffendingRule>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Engine(e) => match e.kind() {
                ErrorKind::Validation | ErrorKind::Compilation => StatusCode::BAD_REQUEST,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Delivery => StatusCode::BAD_GATEWAY,
                ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }

    fn detail(&self) -> ErrorDetail {
        let (kind, offending_rule) = match self {
            ApiError::Engine(e) => (e.kind().to_string(), e.offending_rule().cloned()),
            ApiError::BadRequest(_) => (ErrorKind::Validation.to_string(), None),
            ApiError::Unauthorized => ("unauthorized".to_string(), None),
        };
        ErrorDetail {
            kind,
            message: self.to_string(),
            offending_rule,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }
        (status, Json(ErrorBody { error: self.detail() })).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappingRuleSpec;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(SyncError::Validation("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(SyncError::not_found("connection", 1)).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(SyncError::Delivery("x".into())).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from(SyncError::Storage(std::io::Error::other("disk"))).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_compilation_detail_carries_rule() {
        let rule = MappingRuleSpec::new("b", "name");
        let err = ApiError::from(SyncError::compilation_at("duplicate target field 'name'", 1, &rule));
        let body = serde_json::to_value(ErrorBody { error: err.detail() }).unwrap();

        assert_eq!(body["error"]["kind"], "compilation");
        assert_eq!(body["error"]["offending_rule"]["index"], 1);
        assert_eq!(body["error"]["offending_rule"]["rule"]["target_field"], "name");
    }

    #[test]
    fn test_unauthorized_detail() {
        let detail = ApiError::Unauthorized.detail();
        assert_eq!(detail.kind, "unauthorized");
        assert!(detail.offending_rule.is_none());
    }
}
