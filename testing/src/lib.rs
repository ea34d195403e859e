//! Shared test fixtures for the sync workspace.
//!
//! Provides single, shared instances of testcontainers across all test files:
//! - PostgreSQL (port 5432)
//! - Redis (port 6379)
//!
//! Each fixture is lazily initialized once per test process and automatically
//! cleaned up when the process exits. Tests that get `None` back should skip,
//! since Docker is not available everywhere.
//!
//! [`GitRepoFixture`] builds small local repositories with branches and tags
//! for mirror and index tests.

mod fixtures;
mod git;

pub use fixtures::*;
pub use git::GitRepoFixture;
