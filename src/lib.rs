//! syncbridge - field mapping and webhook delivery engine
//!
//! Connections to external systems are stored in a registry, field mappings
//! between two connections are compiled into immutable plans, plans are run
//! over record batches, every run is logged, and webhook subscribers are
//! notified with signed deliveries.
//!
//! The [`Engine`] owns every component. The [`api`] module exposes it over
//! HTTP.

pub mod api;
pub mod config;
pub mod connections;
pub mod engine;
pub mod error;
pub mod logging;
pub mod mapping;
pub mod sync;
pub mod webhooks;

pub use config::AppConfig;
pub use engine::{DisableOutcome, Engine};
pub use error::{ErrorKind, SyncError, SyncResult};
