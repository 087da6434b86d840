use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::time::Instant;

use chrono::{DateTime, Utc};
use crier_common::protocol::{BroadcastRecord, SessionDetail, StatsSnapshot};

use crate::registry::Registry;

/// Capacity of the recent-broadcast ring.
pub const RECENT_BROADCASTS: usize = 20;

/// Lifetime process counters. All monotonic except `peak_authenticated`,
/// which is a running maximum.
#[derive(Debug)]
pub struct Counters {
    /// Successful authentications.
    pub total_connections: u64,
    /// Disconnects of authenticated sessions.
    pub total_disconnections: u64,
    /// Dispatched broadcasts.
    pub total_broadcasts: u64,
    /// Delivered broadcast envelopes.
    pub messages_delivered: u64,
    /// Rejected login attempts.
    pub auth_failures: u64,
    /// Running maximum of concurrently authenticated sessions.
    pub peak_authenticated: usize,
    /// Process start, wall clock.
    pub started_at: DateTime<Utc>,
    /// Process start, monotonic clock.
    pub started_instant: Instant,
}

impl Counters {
    /// Zeroed counters stamped with the current time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            total_connections: 0,
            total_disconnections: 0,
            total_broadcasts: 0,
            messages_delivered: 0,
            auth_failures: 0,
            peak_authenticated: 0,
            started_at: Utc::now(),
            started_instant: Instant::now(),
        }
    }

    /// Raise the peak if `current` exceeds it.
    pub fn observe_authenticated(&mut self, current: usize) {
        if current > self.peak_authenticated {
            self.peak_authenticated = current;
        }
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-capacity, newest-first ring of recent broadcasts.
#[derive(Debug, Default)]
pub struct RecentBroadcasts {
    ring: VecDeque<BroadcastRecord>,
}

impl RecentBroadcasts {
    /// Create an empty ring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a record, evicting the oldest past [`RECENT_BROADCASTS`].
    pub fn push(&mut self, record: BroadcastRecord) {
        self.ring.push_front(record);
        self.ring.truncate(RECENT_BROADCASTS);
    }

    /// The ring contents, newest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<BroadcastRecord> {
        self.ring.iter().cloned().collect()
    }

    /// Number of retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns `true` when no broadcasts have been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

/// Build a read-only snapshot of the registry and counters. No side
/// effects.
#[must_use]
pub fn snapshot(
    registry: &Registry,
    counters: &Counters,
    recent: &RecentBroadcasts,
) -> StatsSnapshot {
    let mut connections_by_user: BTreeMap<String, usize> = BTreeMap::new();
    let mut session_details = Vec::new();
    let mut broadcasters = 0;
    let mut admins = 0;

    for session in registry.authenticated() {
        let Some(username) = session.username.as_deref() else {
            continue;
        };
        *connections_by_user.entry(username.to_string()).or_default() += 1;
        if session.is_broadcaster {
            broadcasters += 1;
        }
        if session.is_admin {
            admins += 1;
        }
        session_details.push(SessionDetail {
            id: session.id,
            username: username.to_string(),
            is_broadcaster: session.is_broadcaster,
            is_admin: session.is_admin,
            filters: session.filters.clone(),
            remote_ip: session.handle.remote_ip.to_string(),
            connected_secs: session.connected_at.elapsed().as_secs(),
            messages_received: session.messages_received,
        });
    }

    StatsSnapshot {
        sessions: registry.len(),
        authenticated: registry.count_authenticated(),
        broadcasters,
        admins,
        total_connections: counters.total_connections,
        total_disconnections: counters.total_disconnections,
        total_broadcasts: counters.total_broadcasts,
        messages_delivered: counters.messages_delivered,
        auth_failures: counters.auth_failures,
        peak_authenticated: counters.peak_authenticated,
        started_at: counters.started_at,
        uptime_secs: counters.started_instant.elapsed().as_secs(),
        connections_by_user,
        recent_broadcasts: recent.to_vec(),
        session_details,
    }
}
