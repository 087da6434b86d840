//! SQLite-backed whitelist and event store.
//!
//! One connection shared behind a mutex; callers go through
//! `spawn_blocking` so the engine task never blocks on disk I/O.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crier_common::protocol::{EventRecord, EventType, HourlyBucket, UserSummary};

use super::{EventStore, StoreError, UserRecord, WhitelistStore};

/// Username seeded by `--seed` so a fresh store is administrable.
pub const SEED_ADMIN: &str = "admin";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    username       TEXT PRIMARY KEY,
    active         INTEGER NOT NULL DEFAULT 1,
    is_broadcaster INTEGER NOT NULL DEFAULT 0,
    is_admin       INTEGER NOT NULL DEFAULT 0,
    added_at       INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    username   TEXT NOT NULL,
    ip         TEXT NOT NULL,
    event_type TEXT NOT NULL,
    reason     TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_user_time ON events(username, created_at);
CREATE INDEX IF NOT EXISTS idx_events_time ON events(created_at);
";

/// Whitelist and event history on a single SQLite database.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

fn unix_to_datetime(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    /// `:memory:` gives an ephemeral store.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `op` against the connection on the blocking pool.
    async fn call<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            op(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Ensure the [`SEED_ADMIN`] whitelist entry exists with admin and
    /// broadcaster roles. Existing rows are left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn seed_default_admin(&self) -> Result<(), StoreError> {
        self.call(|conn| {
            conn.execute(
                "INSERT INTO users (username, active, is_broadcaster, is_admin, added_at)
                 VALUES (?1, 1, 1, 1, ?2)
                 ON CONFLICT(username) DO NOTHING",
                params![SEED_ADMIN, Utc::now().timestamp()],
            )?;
            Ok(())
        })
        .await
    }
}

fn query_events(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::types::ToSql],
) -> Result<Vec<EventRecord>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, i64>(4)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (username, ip, event_type, reason, created_at) = row?;
        // Rows with an unrecognized type (from a newer schema) are skipped.
        if let Some(event) = EventType::from_key(&event_type) {
            out.push(EventRecord {
                username,
                ip,
                event,
                reason,
                timestamp: unix_to_datetime(created_at),
            });
        }
    }
    Ok(out)
}

#[async_trait]
impl WhitelistStore for SqliteStore {
    async fn is_whitelisted(&self, username: &str) -> Result<bool, StoreError> {
        let username = username.to_string();
        self.call(move |conn| {
            let active: Option<i64> = conn
                .query_row(
                    "SELECT active FROM users WHERE username = ?1",
                    params![username],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(active == Some(1))
        })
        .await
    }

    async fn is_broadcaster(&self, username: &str) -> Result<bool, StoreError> {
        let username = username.to_string();
        self.call(move |conn| {
            let flag: Option<i64> = conn
                .query_row(
                    "SELECT is_broadcaster FROM users WHERE username = ?1 AND active = 1",
                    params![username],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(flag == Some(1))
        })
        .await
    }

    async fn is_admin(&self, username: &str) -> Result<bool, StoreError> {
        let username = username.to_string();
        self.call(move |conn| {
            let flag: Option<i64> = conn
                .query_row(
                    "SELECT is_admin FROM users WHERE username = ?1 AND active = 1",
                    params![username],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(flag == Some(1))
        })
        .await
    }

    async fn add_user(&self, username: &str) -> Result<(), StoreError> {
        let username = username.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO users (username, active, added_at) VALUES (?1, 1, ?2)
                 ON CONFLICT(username) DO UPDATE SET active = 1",
                params![username, Utc::now().timestamp()],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove_user(&self, username: &str) -> Result<(), StoreError> {
        let username = username.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE users SET active = 0 WHERE username = ?1",
                params![username],
            )?;
            Ok(())
        })
        .await
    }

    async fn add_broadcaster(&self, username: &str) -> Result<(), StoreError> {
        let username = username.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO users (username, active, is_broadcaster, added_at)
                 VALUES (?1, 1, 1, ?2)
                 ON CONFLICT(username) DO UPDATE SET is_broadcaster = 1",
                params![username, Utc::now().timestamp()],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove_broadcaster(&self, username: &str) -> Result<(), StoreError> {
        let username = username.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE users SET is_broadcaster = 0 WHERE username = ?1",
                params![username],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT username, active, is_broadcaster, is_admin FROM users ORDER BY username",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(UserRecord {
                    username: row.get(0)?,
                    active: row.get::<_, i64>(1)? == 1,
                    is_broadcaster: row.get::<_, i64>(2)? == 1,
                    is_admin: row.get::<_, i64>(3)? == 1,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn list_broadcasters(&self) -> Result<Vec<String>, StoreError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT username FROM users
                 WHERE is_broadcaster = 1 AND active = 1 ORDER BY username",
            )?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn log_event(
        &self,
        username: &str,
        ip: &str,
        event: EventType,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let username = username.to_string();
        let ip = ip.to_string();
        let reason = reason.map(str::to_string);
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO events (username, ip, event_type, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![username, ip, event.as_str(), reason, Utc::now().timestamp()],
            )?;
            Ok(())
        })
        .await
    }

    async fn history(&self, username: &str, limit: u32) -> Result<Vec<EventRecord>, StoreError> {
        let username = username.to_string();
        self.call(move |conn| {
            query_events(
                conn,
                "SELECT username, ip, event_type, reason, created_at FROM events
                 WHERE username = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
                &[&username, &limit],
            )
        })
        .await
    }

    async fn summary(&self, username: &str) -> Result<UserSummary, StoreError> {
        let username = username.to_string();
        self.call(move |conn| {
            let row = conn.query_row(
                "SELECT
                     COUNT(CASE WHEN event_type = 'connect' THEN 1 END),
                     COUNT(CASE WHEN event_type = 'disconnect' THEN 1 END),
                     COUNT(CASE WHEN event_type = 'auth_fail' THEN 1 END),
                     COUNT(CASE WHEN event_type IN ('kicked', 'banned') THEN 1 END),
                     MIN(created_at),
                     MAX(created_at)
                 FROM events WHERE username = ?1",
                params![username],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                    ))
                },
            )?;
            let (connects, disconnects, failures, kicked, first, last) = row;
            Ok(UserSummary {
                total_connections: connects.max(0) as u64,
                total_disconnections: disconnects.max(0) as u64,
                auth_failures: failures.max(0) as u64,
                times_kicked: kicked.max(0) as u64,
                first_seen: first.map(unix_to_datetime),
                last_seen: last.map(unix_to_datetime),
            })
        })
        .await
    }

    async fn recent_events(&self, limit: u32) -> Result<Vec<EventRecord>, StoreError> {
        self.call(move |conn| {
            query_events(
                conn,
                "SELECT username, ip, event_type, reason, created_at FROM events
                 ORDER BY created_at DESC, id DESC LIMIT ?1",
                &[&limit],
            )
        })
        .await
    }

    async fn hourly_stats(&self, hours_back: u32) -> Result<Vec<HourlyBucket>, StoreError> {
        self.call(move |conn| {
            let cutoff = Utc::now().timestamp() - i64::from(hours_back) * 3600;
            let mut stmt = conn.prepare(
                "SELECT (created_at / 3600) * 3600 AS hour, COUNT(*) FROM events
                 WHERE created_at >= ?1 GROUP BY hour ORDER BY hour DESC",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (hour, events) = row?;
                out.push(HourlyBucket {
                    hour: unix_to_datetime(hour),
                    events: events.max(0) as u64,
                });
            }
            Ok(out)
        })
        .await
    }

    async fn purge_older_than(&self, max_age: chrono::Duration) -> Result<u64, StoreError> {
        self.call(move |conn| {
            let cutoff = (Utc::now() - max_age).timestamp();
            let deleted = conn.execute(
                "DELETE FROM events WHERE created_at < ?1",
                params![cutoff],
            )?;
            Ok(deleted as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> SqliteStore {
        SqliteStore::open(":memory:").unwrap()
    }

    /// Insert an event with an explicit timestamp, bypassing `log_event`.
    fn insert_event_at(store: &SqliteStore, username: &str, event: EventType, created_at: i64) {
        let conn = store.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO events (username, ip, event_type, reason, created_at)
             VALUES (?1, '127.0.0.1', ?2, NULL, ?3)",
            params![username, event.as_str(), created_at],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn add_user_whitelists() {
        let store = memory_store();
        assert!(!store.is_whitelisted("alice").await.unwrap());
        store.add_user("alice").await.unwrap();
        assert!(store.is_whitelisted("alice").await.unwrap());
    }

    #[tokio::test]
    async fn add_user_is_idempotent() {
        let store = memory_store();
        store.add_user("bob").await.unwrap();
        store.add_user("bob").await.unwrap();
        let users = store.list_users().await.unwrap();
        assert_eq!(users.len(), 1);
        assert!(users[0].active);
    }

    #[tokio::test]
    async fn remove_user_soft_deactivates() {
        let store = memory_store();
        store.add_user("alice").await.unwrap();
        store.remove_user("alice").await.unwrap();
        assert!(!store.is_whitelisted("alice").await.unwrap());
        // The row is kept, only deactivated.
        let users = store.list_users().await.unwrap();
        assert_eq!(users.len(), 1);
        assert!(!users[0].active);
    }

    #[tokio::test]
    async fn re_add_reactivates() {
        let store = memory_store();
        store.add_user("alice").await.unwrap();
        store.remove_user("alice").await.unwrap();
        store.add_user("alice").await.unwrap();
        assert!(store.is_whitelisted("alice").await.unwrap());
    }

    #[tokio::test]
    async fn remove_unknown_user_is_a_noop() {
        let store = memory_store();
        store.remove_user("ghost").await.unwrap();
        store.remove_broadcaster("ghost").await.unwrap();
        assert!(store.list_users().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn broadcaster_role_lifecycle() {
        let store = memory_store();
        // Granting to an unknown user whitelists them too.
        store.add_broadcaster("carol").await.unwrap();
        assert!(store.is_whitelisted("carol").await.unwrap());
        assert!(store.is_broadcaster("carol").await.unwrap());
        assert!(!store.is_admin("carol").await.unwrap());

        store.remove_broadcaster("carol").await.unwrap();
        assert!(!store.is_broadcaster("carol").await.unwrap());
        assert!(store.is_whitelisted("carol").await.unwrap());
    }

    #[tokio::test]
    async fn deactivated_user_loses_role_lookups() {
        let store = memory_store();
        store.add_broadcaster("carol").await.unwrap();
        store.remove_user("carol").await.unwrap();
        assert!(!store.is_broadcaster("carol").await.unwrap());
        assert!(!store.is_admin("carol").await.unwrap());
    }

    #[tokio::test]
    async fn list_broadcasters_skips_inactive() {
        let store = memory_store();
        store.add_broadcaster("a").await.unwrap();
        store.add_broadcaster("b").await.unwrap();
        store.remove_user("b").await.unwrap();
        assert_eq!(store.list_broadcasters().await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn history_is_newest_first_and_limited() {
        let store = memory_store();
        let base = Utc::now().timestamp();
        insert_event_at(&store, "alice", EventType::Connect, base - 30);
        insert_event_at(&store, "alice", EventType::Disconnect, base - 20);
        insert_event_at(&store, "alice", EventType::Connect, base - 10);
        insert_event_at(&store, "bob", EventType::Connect, base - 5);

        let history = store.history("alice", 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event, EventType::Connect);
        assert_eq!(history[1].event, EventType::Disconnect);
        assert!(history.iter().all(|e| e.username == "alice"));
    }

    #[tokio::test]
    async fn summary_aggregates_by_event_type() {
        let store = memory_store();
        store
            .log_event("alice", "127.0.0.1", EventType::Connect, None)
            .await
            .unwrap();
        store
            .log_event("alice", "127.0.0.1", EventType::Disconnect, None)
            .await
            .unwrap();
        store
            .log_event("alice", "127.0.0.1", EventType::AuthFail, Some("not whitelisted"))
            .await
            .unwrap();
        store
            .log_event("alice", "127.0.0.1", EventType::Kicked, None)
            .await
            .unwrap();
        store
            .log_event("alice", "127.0.0.1", EventType::Banned, None)
            .await
            .unwrap();

        let summary = store.summary("alice").await.unwrap();
        assert_eq!(summary.total_connections, 1);
        assert_eq!(summary.total_disconnections, 1);
        assert_eq!(summary.auth_failures, 1);
        assert_eq!(summary.times_kicked, 2);
        assert!(summary.first_seen.is_some());
        assert!(summary.last_seen.is_some());
    }

    #[tokio::test]
    async fn summary_of_unknown_user_is_empty() {
        let store = memory_store();
        let summary = store.summary("ghost").await.unwrap();
        assert_eq!(summary.total_connections, 0);
        assert!(summary.first_seen.is_none());
    }

    #[tokio::test]
    async fn recent_events_spans_users() {
        let store = memory_store();
        let base = Utc::now().timestamp();
        insert_event_at(&store, "alice", EventType::Connect, base - 10);
        insert_event_at(&store, "bob", EventType::Connect, base - 5);

        let recent = store.recent_events(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].username, "bob");
    }

    #[tokio::test]
    async fn hourly_stats_counts_recent_events_only() {
        let store = memory_store();
        let now = Utc::now().timestamp();
        insert_event_at(&store, "alice", EventType::Connect, now - 60);
        insert_event_at(&store, "alice", EventType::Connect, now - 120);
        // Outside a 1-hour window.
        insert_event_at(&store, "alice", EventType::Connect, now - 2 * 3600);

        let buckets = store.hourly_stats(1).await.unwrap();
        let total: u64 = buckets.iter().map(|b| b.events).sum();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn purge_removes_only_old_events() {
        let store = memory_store();
        let now = Utc::now().timestamp();
        insert_event_at(&store, "alice", EventType::Connect, now - 8 * 86_400);
        insert_event_at(&store, "alice", EventType::Connect, now - 60);

        let deleted = store
            .purge_older_than(chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.recent_events(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn seed_default_admin_is_idempotent() {
        let store = memory_store();
        store.seed_default_admin().await.unwrap();
        store.seed_default_admin().await.unwrap();
        assert!(store.is_whitelisted(SEED_ADMIN).await.unwrap());
        assert!(store.is_admin(SEED_ADMIN).await.unwrap());
        assert!(store.is_broadcaster(SEED_ADMIN).await.unwrap());
        assert_eq!(store.list_users().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crier.db");
        let path = path.to_str().unwrap();

        {
            let store = SqliteStore::open(path).unwrap();
            store.add_user("alice").await.unwrap();
        }
        let store = SqliteStore::open(path).unwrap();
        assert!(store.is_whitelisted("alice").await.unwrap());
    }
}
