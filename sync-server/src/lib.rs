//! # Sync Engine Service
//!
//! Runs the connection-sync, repo-index and permission-sync workers and
//! their schedulers, watches the declarative config file, and serves a small
//! HTTP surface for operators.
//!
//! ## Endpoints
//!
//! - `GET /metrics` - Prometheus job gauges and counters
//! - `GET /health` - database reachability
//! - `POST /api/sync-connection` - `{connectionId}` to `{jobId}`
//! - `POST /api/index-repo` - `{repoId}` to `{jobId}`
//! - `POST /api/rebuild-permissions` - `{accountId?}` to `{accounts, granted?}`

pub mod error;
pub mod handlers;
pub mod routes;
pub mod server;
pub mod state;

pub use error::ApiError;
pub use server::SyncServer;
pub use state::{AppState, DatabaseHealth};
