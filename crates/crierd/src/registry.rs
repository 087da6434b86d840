use std::collections::HashMap;

use crate::session::{Session, SessionId};

/// The authoritative in-memory set of live sessions.
///
/// Owned exclusively by the engine task; every mutation happens from that
/// single context. The registry is a pure data structure — counters are
/// updated by the engine's handlers, never here.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: HashMap<SessionId, Session>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session under its id.
    pub fn register(&mut self, session: Session) {
        self.sessions.insert(session.id, session);
    }

    /// Remove and return a session. Idempotent: absent ids are a no-op.
    /// Any armed deadline timer is aborted before the session is returned,
    /// so a timeout can never fire against a removed session.
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let mut session = self.sessions.remove(&id)?;
        session.cancel_auth_deadline();
        Some(session)
    }

    /// Look up a session by id.
    #[must_use]
    pub fn find(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Look up a session by id, mutably.
    pub fn find_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Iterate over every live session.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Iterate over every live session, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    /// Iterate over authenticated sessions only.
    pub fn authenticated(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values().filter(|s| s.authenticated)
    }

    /// Number of authenticated sessions for one username.
    #[must_use]
    pub fn count_by_username(&self, username: &str) -> usize {
        self.sessions.values().filter(|s| s.is_user(username)).count()
    }

    /// Number of authenticated sessions.
    #[must_use]
    pub fn count_authenticated(&self) -> usize {
        self.sessions.values().filter(|s| s.authenticated).count()
    }

    /// Number of live sessions, authenticated or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` if no sessions are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove every session, aborting armed timers.
    pub fn clear(&mut self) {
        for session in self.sessions.values_mut() {
            session.cancel_auth_deadline();
        }
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ConnHandle, Outbound};
    use crier_common::protocol::SourceFilter;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;

    fn make_session(id: SessionId) -> (Session, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(4);
        let handle = ConnHandle {
            tx,
            remote_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        };
        (Session::new(id, handle), rx)
    }

    fn make_authenticated(id: SessionId, username: &str) -> (Session, mpsc::Receiver<Outbound>) {
        let (mut session, rx) = make_session(id);
        session.authenticate(username.to_string(), false, false, SourceFilter::All);
        (session, rx)
    }

    #[test]
    fn register_and_find() {
        let mut registry = Registry::new();
        let (session, _rx) = make_session(1);
        registry.register(session);
        assert!(registry.find(1).is_some());
        assert!(registry.find(2).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut registry = Registry::new();
        let (session, _rx) = make_session(1);
        registry.register(session);
        assert!(registry.remove(1).is_some());
        assert!(registry.remove(1).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn count_by_username_ignores_unauthenticated() {
        let mut registry = Registry::new();
        let (alice1, _rx1) = make_authenticated(1, "alice");
        let (alice2, _rx2) = make_authenticated(2, "alice");
        let (bob, _rx3) = make_authenticated(3, "bob");
        let (pending, _rx4) = make_session(4);
        registry.register(alice1);
        registry.register(alice2);
        registry.register(bob);
        registry.register(pending);

        assert_eq!(registry.count_by_username("alice"), 2);
        assert_eq!(registry.count_by_username("bob"), 1);
        assert_eq!(registry.count_by_username("carol"), 0);
        assert_eq!(registry.count_authenticated(), 3);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn authenticated_iterator_skips_pending_sessions() {
        let mut registry = Registry::new();
        let (auth, _rx1) = make_authenticated(1, "alice");
        let (pending, _rx2) = make_session(2);
        registry.register(auth);
        registry.register(pending);

        let ids: Vec<SessionId> = registry.authenticated().map(|s| s.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[tokio::test]
    async fn remove_aborts_armed_deadline() {
        let mut registry = Registry::new();
        let (mut session, _rx) = make_session(1);
        let task = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        session.arm_auth_deadline(task);
        registry.register(session);

        let removed = registry.remove(1).unwrap();
        drop(removed);
    }

    #[test]
    fn clear_empties_the_registry() {
        let mut registry = Registry::new();
        let (a, _rx1) = make_session(1);
        let (b, _rx2) = make_session(2);
        registry.register(a);
        registry.register(b);
        registry.clear();
        assert!(registry.is_empty());
    }
}
