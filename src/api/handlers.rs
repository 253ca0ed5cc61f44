//! Route handlers
//!
//! Handlers translate between JSON and engine calls. List responses are
//! `{"data": [...], "count": n}`; creates answer `201` with
//! `{"status": "created", "data": {...}}`.

use axum::{
    extract::{FromRequest, FromRequestParts, Request, State},
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::{ApiError, ApiResult};
use super::server::AppState;
use crate::connections::{ConnectionSpec, ConnectionView};
use crate::mapping::MappingRequest;
use crate::sync::LogFilter;
use crate::webhooks::WebhookSpec;

/// JSON body extractor that reports failures in the API error format.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(ApiJson(value))
    }
}

/// Path extractor that reports failures in the API error format.
pub struct ApiPath<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let axum::extract::Path(value) =
            axum::extract::Path::<T>::from_request_parts(parts, state).await?;
        Ok(ApiPath(value))
    }
}

/// Query-string extractor that reports failures in the API error format.
pub struct ApiQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let axum::extract::Query(value) =
            axum::extract::Query::<T>::from_request_parts(parts, state).await?;
        Ok(ApiQuery(value))
    }
}

fn list<T: Serialize>(items: Vec<T>) -> Json<Value> {
    Json(json!({ "count": items.len(), "data": items }))
}

fn created<T: Serialize>(item: T) -> impl IntoResponse {
    (
        StatusCode::CREATED,
        Json(json!({ "status": "created", "data": item })),
    )
}

fn with_status<T: Serialize>(status: &str, item: T) -> Json<Value> {
    Json(json!({ "status": status, "data": item }))
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: chrono::DateTime<Utc>,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let healthy = state.is_healthy().await;
    let body = Json(HealthResponse {
        status: if healthy { "ok" } else { "unhealthy" }.to_string(),
        service: "syncbridge".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    });
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, body)
}

// --- connections ---

/// GET /api/connections
pub async fn list_connections(State(state): State<AppState>) -> Json<Value> {
    let views: Vec<ConnectionView> = state
        .engine
        .list_connections()
        .await
        .iter()
        .map(|c| c.redacted())
        .collect();
    list(views)
}

/// POST /api/connections
pub async fn create_connection(
    State(state): State<AppState>,
    ApiJson(spec): ApiJson<ConnectionSpec>,
) -> ApiResult<impl IntoResponse> {
    let connection = state.engine.create_connection(spec).await?;
    Ok(created(connection.redacted()))
}

/// GET /api/connections/{id}
pub async fn get_connection(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<u64>,
) -> ApiResult<Json<Value>> {
    let connection = state.engine.get_connection(id).await?;
    Ok(Json(json!({ "data": connection.redacted() })))
}

/// PUT /api/connections/{id}
pub async fn update_connection(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<u64>,
    ApiJson(spec): ApiJson<ConnectionSpec>,
) -> ApiResult<Json<Value>> {
    let connection = state.engine.update_connection(id, spec).await?;
    Ok(with_status("updated", connection.redacted()))
}

/// DELETE /api/connections/{id}
pub async fn delete_connection(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<u64>,
) -> ApiResult<Json<Value>> {
    state.engine.delete_connection(id).await?;
    Ok(Json(json!({ "status": "deleted" })))
}

/// POST /api/connections/{id}/disable
pub async fn disable_connection(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<u64>,
) -> ApiResult<Json<Value>> {
    let outcome = state.engine.disable_connection(id).await?;
    Ok(Json(json!({
        "status": "disabled",
        "data": outcome.connection.redacted(),
        "suspended_plans": outcome.suspended_plans,
    })))
}

/// POST /api/connections/{id}/enable
pub async fn enable_connection(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<u64>,
) -> ApiResult<Json<Value>> {
    let connection = state.engine.enable_connection(id).await?;
    Ok(with_status("enabled", connection.redacted()))
}

// --- mappings ---

/// GET /api/mappings
pub async fn list_mappings(State(state): State<AppState>) -> Json<Value> {
    list(state.engine.list_plans().await)
}

/// POST /api/mappings
pub async fn save_mappings(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<MappingRequest>,
) -> ApiResult<impl IntoResponse> {
    let plan = state.engine.save_mapping(request).await?;
    Ok(created(plan))
}

/// GET /api/mappings/{id}
pub async fn get_mapping(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<u64>,
) -> ApiResult<Json<Value>> {
    Ok(Json(json!({ "data": state.engine.get_plan(id).await? })))
}

// --- webhooks ---

/// GET /api/webhooks
pub async fn list_webhooks(State(state): State<AppState>) -> Json<Value> {
    let views: Vec<_> = state.engine.list_webhooks().await.iter().map(|w| w.redacted()).collect();
    list(views)
}

/// GET /api/webhooks/active
pub async fn list_active_webhooks(State(state): State<AppState>) -> Json<Value> {
    let views: Vec<_> = state
        .engine
        .list_active_webhooks()
        .await
        .iter()
        .map(|w| w.redacted())
        .collect();
    list(views)
}

/// POST /api/webhooks
///
/// The response includes the signing secret; it is not shown again by the
/// list endpoints.
pub async fn create_webhook(
    State(state): State<AppState>,
    ApiJson(spec): ApiJson<WebhookSpec>,
) -> ApiResult<impl IntoResponse> {
    let webhook = state.engine.create_webhook(spec).await?;
    Ok(created(webhook))
}

/// DELETE /api/webhooks/{id}
pub async fn delete_webhook(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<u64>,
) -> ApiResult<Json<Value>> {
    state.engine.delete_webhook(id).await?;
    Ok(Json(json!({ "status": "deleted" })))
}

/// GET /api/webhooks/deliveries
pub async fn list_deliveries(State(state): State<AppState>) -> Json<Value> {
    list(state.engine.deliveries().await)
}

// --- sync ---

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub records: Vec<Value>,
}

/// POST /api/sync/{plan_id}/run
pub async fn run_sync(
    State(state): State<AppState>,
    ApiPath(plan_id): ApiPath<u64>,
    ApiJson(request): ApiJson<RunRequest>,
) -> ApiResult<Json<Value>> {
    let report = state
        .engine
        .run_sync(plan_id, request.records, Some(state.shutdown_signal()))
        .await?;
    Ok(Json(json!({
        "status": report.entry.status(),
        "data": report,
    })))
}

/// GET /api/sync/logs
pub async fn query_logs(
    State(state): State<AppState>,
    ApiQuery(filter): ApiQuery<LogFilter>,
) -> Json<Value> {
    let entries: Vec<_> = state.engine.query_logs(filter).await.collect();
    list(entries)
}
