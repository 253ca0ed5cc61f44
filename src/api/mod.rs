//! HTTP API
//!
//! JSON over HTTP on top of the [`Engine`](crate::engine::Engine). `/health`
//! is always open; `/api` routes require a bearer token when one is
//! configured.

pub mod error;
pub mod handlers;
pub mod server;

pub use error::{ApiError, ApiResult};
pub use server::{create_router, serve, AppState};
