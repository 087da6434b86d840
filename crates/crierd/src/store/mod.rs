//! Whitelist and event-history persistence.
//!
//! The engine only talks to the two traits here; the SQLite implementation
//! lives in [`sqlite`]. Lookup operations never error on "not found" —
//! they return false or empty — and mutations are idempotent.

use async_trait::async_trait;
use thiserror::Error;

use crier_common::protocol::{EventRecord, EventType, HourlyBucket, UserSummary};

pub mod sqlite;

pub use sqlite::SqliteStore;

/// Store operation failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database error.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The blocking store task failed to complete.
    #[error("store task failed: {0}")]
    Task(String),
}

/// One whitelist row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    /// The whitelisted username.
    pub username: String,
    /// Soft-deactivated users keep their row with `active = false`.
    pub active: bool,
    /// Whether the user may publish notices.
    pub is_broadcaster: bool,
    /// Whether the user may issue admin commands.
    pub is_admin: bool,
}

/// The set of usernames permitted to authenticate, with role bits.
#[async_trait]
pub trait WhitelistStore: Send + Sync {
    /// Whether the username exists and is active.
    async fn is_whitelisted(&self, username: &str) -> Result<bool, StoreError>;
    /// Whether the username is active and may publish notices.
    async fn is_broadcaster(&self, username: &str) -> Result<bool, StoreError>;
    /// Whether the username is active and may issue admin commands.
    async fn is_admin(&self, username: &str) -> Result<bool, StoreError>;
    /// Whitelist a username as a receiver. Reactivates a deactivated row.
    async fn add_user(&self, username: &str) -> Result<(), StoreError>;
    /// Soft-deactivate a username. Unknown usernames are a no-op.
    async fn remove_user(&self, username: &str) -> Result<(), StoreError>;
    /// Grant the broadcaster role, whitelisting the username if new.
    async fn add_broadcaster(&self, username: &str) -> Result<(), StoreError>;
    /// Revoke the broadcaster role. Unknown usernames are a no-op.
    async fn remove_broadcaster(&self, username: &str) -> Result<(), StoreError>;
    /// Every whitelist row, active or not.
    async fn list_users(&self) -> Result<Vec<UserRecord>, StoreError>;
    /// Active usernames holding the broadcaster role.
    async fn list_broadcasters(&self) -> Result<Vec<String>, StoreError>;
}

/// Best-effort session lifecycle history.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Record one event.
    async fn log_event(
        &self,
        username: &str,
        ip: &str,
        event: EventType,
        reason: Option<&str>,
    ) -> Result<(), StoreError>;
    /// Most recent events for one username, newest first.
    async fn history(&self, username: &str, limit: u32) -> Result<Vec<EventRecord>, StoreError>;
    /// Aggregate connection summary for one username.
    async fn summary(&self, username: &str) -> Result<UserSummary, StoreError>;
    /// Most recent events across all users, newest first.
    async fn recent_events(&self, limit: u32) -> Result<Vec<EventRecord>, StoreError>;
    /// Hourly event counts over the trailing `hours_back` hours, newest
    /// bucket first. Empty hours are omitted.
    async fn hourly_stats(&self, hours_back: u32) -> Result<Vec<HourlyBucket>, StoreError>;
    /// Delete events older than `max_age`, returning how many were removed.
    async fn purge_older_than(&self, max_age: chrono::Duration) -> Result<u64, StoreError>;
}
