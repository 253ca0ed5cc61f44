//! HTTP server
//!
//! Builds the router over a shared [`AppState`], applies bearer-token auth to
//! `/api`, and runs until ctrl-c or SIGTERM.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, Method},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Router,
};
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::error::ApiError;
use super::handlers;
use crate::engine::Engine;

/// Shared state handed to every handler
#[derive(Debug, Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    /// Flips to false once shutdown starts
    pub healthy: Arc<RwLock<bool>>,
    auth_token: Option<Arc<str>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        let auth_token = engine
            .config()
            .server
            .auth_token
            .as_deref()
            .map(Arc::from);
        let (shutdown, _) = watch::channel(false);
        Self {
            engine,
            healthy: Arc::new(RwLock::new(true)),
            auth_token,
            shutdown: Arc::new(shutdown),
        }
    }

    pub async fn set_healthy(&self, healthy: bool) {
        let mut guard = self.healthy.write().await;
        *guard = healthy;
    }

    pub async fn is_healthy(&self) -> bool {
        *self.healthy.read().await
    }

    /// Receiver that reads `true` once shutdown begins. Sync runs check it
    /// between records.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Mark the service unhealthy and cancel in-progress sync runs.
    pub async fn begin_shutdown(&self) {
        self.set_healthy(false).await;
        self.shutdown.send_replace(true);
    }
}

/// Create the router with all routes.
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.engine.config().server.cors_origins);

    let api = Router::new()
        .route(
            "/connections",
            get(handlers::list_connections).post(handlers::create_connection),
        )
        .route(
            "/connections/{id}",
            get(handlers::get_connection)
                .put(handlers::update_connection)
                .delete(handlers::delete_connection),
        )
        .route("/connections/{id}/disable", post(handlers::disable_connection))
        .route("/connections/{id}/enable", post(handlers::enable_connection))
        .route(
            "/mappings",
            get(handlers::list_mappings).post(handlers::save_mappings),
        )
        .route("/mappings/{id}", get(handlers::get_mapping))
        .route(
            "/webhooks",
            get(handlers::list_webhooks).post(handlers::create_webhook),
        )
        .route("/webhooks/active", get(handlers::list_active_webhooks))
        .route("/webhooks/deliveries", get(handlers::list_deliveries))
        .route("/webhooks/{id}", delete(handlers::delete_webhook))
        .route("/sync/{plan_id}/run", post(handlers::run_sync))
        .route("/sync/logs", get(handlers::query_logs))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
}

/// Reject `/api` requests without the configured bearer token. Open when no
/// token is configured.
async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.auth_token.as_deref() else {
        return Ok(next.run(request).await);
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if tokens_match(token.trim().as_bytes(), expected.as_bytes()) => {
            Ok(next.run(request).await)
        }
        _ => {
            tracing::warn!(path = %request.uri().path(), "Rejected request without valid token");
            Err(ApiError::Unauthorized)
        }
    }
}

/// Constant-time token comparison.
fn tokens_match(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Bind and serve until a shutdown signal arrives, then drain webhook
/// deliveries.
pub async fn serve(state: AppState) -> std::io::Result<()> {
    let addr = state.engine.config().listen_address();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "syncbridge listening");

    let router = create_router(state.clone());
    let on_signal = {
        let state = state.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received");
            state.begin_shutdown().await;
        }
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(on_signal)
        .await?;

    state.engine.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
