//! # Configuration System
//!
//! Configuration for the repository synchronization engine.
//!
//! This crate provides:
//! - The declarative config schema (connections, search contexts, apps, settings)
//! - JSONC loading with per-connection validation
//! - Environment variable loading (12-factor app principles)
//! - Debounced hot reload of the config file
//!
//! # Best Practices
//!
//! - Uses `validator` crate for input validation
//! - Plaintext tokens are rejected at parse time
//! - One malformed connection never blocks the others

pub mod env;
pub mod hot_reload;
pub mod loader;
pub mod schema;

pub use env::{EngineConfig, EngineConfigBuilder};
pub use hot_reload::{ConfigWatchError, ConfigWatcher};
pub use loader::{load_config, parse_config, strip_json_comments};
pub use schema::{
    AppConfig, ConnectionConfig, GenericGitHostConnectionConfig, GitRevisions, GiteaConnectionConfig,
    GiteaExclude, GithubAppConfig, GithubConnectionConfig, GithubExclude, GitlabConnectionConfig,
    GitlabExclude, SearchContextConfig, Settings, SizeBounds, SyncConfig, TokenSpec,
};
pub use validator::Validate;
