use std::net::IpAddr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use crier_common::protocol::{ServerMsg, SourceFilter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::metrics::counters;

/// Process-local session identifier, assigned at accept time and never
/// reused while the process runs.
pub type SessionId = u64;

/// Capacity of each connection's outbound queue. Dispatch never blocks on a
/// slow receiver; sends past this bound are dropped and counted.
pub const OUTBOUND_QUEUE: usize = 256;

/// Instruction delivered to a connection's transport task.
#[derive(Debug)]
pub enum Outbound {
    /// A JSON envelope to serialize onto the wire.
    Envelope(ServerMsg),
    /// A WebSocket liveness ping.
    Ping,
    /// Close the transport with the given code, then stop the task.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Handle held in the registry — used to send frames to a connection.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    /// Channel sender for delivering instructions to this connection's task.
    pub tx: mpsc::Sender<Outbound>,
    /// Resolved remote address (first forwarding hop or peer address).
    pub remote_ip: IpAddr,
}

impl ConnHandle {
    /// Fire-and-forget send. Returns `true` when the instruction was
    /// enqueued; a full or closed queue drops it.
    pub fn send(&self, out: Outbound) -> bool {
        match self.tx.try_send(out) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                counters::messages_dropped_total("queue_full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// One live transport connection and its authentication state.
///
/// A session is either fully unauthenticated (no username, role flags and
/// filters meaningless) or fully authenticated; `authenticate` is the only
/// transition and it happens at most once.
#[derive(Debug)]
pub struct Session {
    /// Process-local unique id.
    pub id: SessionId,
    /// Outbound handle for this connection.
    pub handle: ConnHandle,
    /// Monotonic false→true, never reverts.
    pub authenticated: bool,
    /// Set exactly once, at authentication.
    pub username: Option<String>,
    /// May be updated live by the admin control plane.
    pub is_broadcaster: bool,
    /// May be updated live by the admin control plane.
    pub is_admin: bool,
    /// Chosen at login, immutable afterwards.
    pub filters: SourceFilter,
    /// Monotonic clock reading at accept time.
    pub connected_at: Instant,
    /// Wall-clock accept time, for stats display.
    pub connected_wall: DateTime<Utc>,
    /// Broadcast envelopes delivered to this session.
    pub messages_received: u64,
    auth_deadline: Option<JoinHandle<()>>,
}

impl Session {
    /// Create an unauthenticated session for a freshly accepted transport.
    #[must_use]
    pub fn new(id: SessionId, handle: ConnHandle) -> Self {
        Self {
            id,
            handle,
            authenticated: false,
            username: None,
            is_broadcaster: false,
            is_admin: false,
            filters: SourceFilter::Tags(Default::default()),
            connected_at: Instant::now(),
            connected_wall: Utc::now(),
            messages_received: 0,
            auth_deadline: None,
        }
    }

    /// Attach the single-shot auth deadline task. Any previously armed
    /// deadline is aborted first.
    pub fn arm_auth_deadline(&mut self, task: JoinHandle<()>) {
        if let Some(old) = self.auth_deadline.replace(task) {
            old.abort();
        }
    }

    /// Abort the armed deadline, if any. Safe to call more than once.
    pub fn cancel_auth_deadline(&mut self) {
        if let Some(task) = self.auth_deadline.take() {
            task.abort();
        }
    }

    /// Transition to the authenticated state. The deadline timer is
    /// canceled and the identity fields become immutable (only the role
    /// flags may change afterwards, via the admin control plane).
    pub fn authenticate(
        &mut self,
        username: String,
        is_broadcaster: bool,
        is_admin: bool,
        filters: SourceFilter,
    ) {
        self.cancel_auth_deadline();
        self.authenticated = true;
        self.username = Some(username);
        self.is_broadcaster = is_broadcaster;
        self.is_admin = is_admin;
        self.filters = filters;
    }

    /// Whether this authenticated session belongs to `username`.
    #[must_use]
    pub fn is_user(&self, username: &str) -> bool {
        self.authenticated && self.username.as_deref() == Some(username)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel_auth_deadline();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn make_session(id: SessionId) -> (Session, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(4);
        let handle = ConnHandle {
            tx,
            remote_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        };
        (Session::new(id, handle), rx)
    }

    #[test]
    fn new_session_is_fully_unauthenticated() {
        let (session, _rx) = make_session(1);
        assert!(!session.authenticated);
        assert!(session.username.is_none());
        assert!(!session.is_broadcaster);
        assert!(!session.is_admin);
        assert!(session.filters.is_receive_nothing());
    }

    #[test]
    fn authenticate_sets_identity_and_roles() {
        let (mut session, _rx) = make_session(1);
        session.authenticate("alice".to_string(), true, false, SourceFilter::All);
        assert!(session.authenticated);
        assert_eq!(session.username.as_deref(), Some("alice"));
        assert!(session.is_broadcaster);
        assert!(session.is_user("alice"));
        assert!(!session.is_user("bob"));
    }

    #[test]
    fn unauthenticated_session_matches_no_user() {
        let (session, _rx) = make_session(1);
        assert!(!session.is_user("alice"));
    }

    #[tokio::test]
    async fn send_enqueues_until_full() {
        let (session, mut rx) = make_session(1);
        for _ in 0..4 {
            assert!(session.handle.send(Outbound::Ping));
        }
        // Queue of 4 is full now.
        assert!(!session.handle.send(Outbound::Ping));
        assert!(matches!(rx.recv().await, Some(Outbound::Ping)));
    }

    #[tokio::test]
    async fn send_to_closed_queue_reports_failure() {
        let (session, rx) = make_session(1);
        drop(rx);
        assert!(!session.handle.send(Outbound::Ping));
    }

    #[tokio::test]
    async fn cancel_auth_deadline_aborts_task() {
        let (mut session, _rx) = make_session(1);
        let task = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        session.arm_auth_deadline(task);
        session.cancel_auth_deadline();
        // A second cancel is a no-op.
        session.cancel_auth_deadline();
    }
}
