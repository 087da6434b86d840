use std::sync::Arc;
use std::time::Duration;

use crier_common::protocol::{close_code, ClientCommand, ErrorKind, EventType, ServerMsg};
use crier_common::validate;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::metrics::{counters, gauges};
use crate::ratelimit::RateLimiter;
use crate::registry::Registry;
use crate::session::{ConnHandle, Outbound, SessionId};
use crate::stats::{self, Counters, RecentBroadcasts};
use crate::store::{EventStore, WhitelistStore};

/// Capacity of the engine command queue.
pub const ENGINE_QUEUE: usize = 1024;

/// Events older than this are purged by the retention sweep.
const EVENT_RETENTION_DAYS: i64 = 7;
/// Retention sweep period.
const RETENTION_SWEEP_SECS: u64 = 86_400;
/// Rate-limiter sweep period.
const RATE_SWEEP_SECS: u64 = 60;

/// Command sent to the engine task. Connection tasks never touch core
/// state directly; everything goes through this channel.
#[derive(Debug)]
pub enum EngineCommand {
    /// A transport finished its handshake and is ready for frames.
    Attach {
        /// The id assigned at accept time.
        id: SessionId,
        /// Outbound handle for the connection.
        handle: ConnHandle,
    },
    /// A decoded text frame arrived.
    Frame {
        /// Originating session.
        id: SessionId,
        /// Raw frame text.
        text: String,
    },
    /// The transport closed; remove the session.
    Detach {
        /// The closed session.
        id: SessionId,
    },
    /// The single-shot auth deadline fired.
    AuthTimeout {
        /// The session whose deadline elapsed.
        id: SessionId,
    },
    /// Close every session and stop the engine.
    Shutdown,
}

/// The single owner of all mutable core state: registry, rate limiter,
/// counters, and the recent-broadcast ring. Commands are processed one at
/// a time to completion — store calls are awaited inline, so a login's
/// cap check and registry update form one atomic step with respect to
/// every other login.
pub struct Engine {
    pub(crate) rx: mpsc::Receiver<EngineCommand>,
    pub(crate) tx: mpsc::Sender<EngineCommand>,
    pub(crate) registry: Registry,
    pub(crate) limiter: RateLimiter,
    pub(crate) counters: Counters,
    pub(crate) recent: RecentBroadcasts,
    pub(crate) whitelist: Arc<dyn WhitelistStore>,
    pub(crate) events: Arc<dyn EventStore>,
    pub(crate) config: ServerConfig,
}

impl Engine {
    /// Build an engine and the command sender connection tasks use.
    #[must_use]
    pub fn new(
        config: ServerConfig,
        whitelist: Arc<dyn WhitelistStore>,
        events: Arc<dyn EventStore>,
    ) -> (Self, mpsc::Sender<EngineCommand>) {
        let (tx, rx) = mpsc::channel(ENGINE_QUEUE);
        let limiter = RateLimiter::new(
            config.rate_capacity,
            Duration::from_secs(config.rate_window),
        );
        let engine = Self {
            rx,
            tx: tx.clone(),
            registry: Registry::new(),
            limiter,
            counters: Counters::new(),
            recent: RecentBroadcasts::new(),
            whitelist,
            events,
            config,
        };
        (engine, tx)
    }

    /// Drive the engine until shutdown. Owns the heartbeat, rate-sweep,
    /// and event-retention timers.
    pub async fn run(mut self) {
        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval));
        let mut rate_sweep = tokio::time::interval(Duration::from_secs(RATE_SWEEP_SECS));
        let mut retention = tokio::time::interval(Duration::from_secs(RETENTION_SWEEP_SECS));

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle(cmd).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = heartbeat.tick() => self.heartbeat(),
                _ = rate_sweep.tick() => self.limiter.sweep(),
                _ = retention.tick() => self.purge_events().await,
            }
        }
        info!("engine stopped");
    }

    /// Process one command. Returns `false` when the engine should stop.
    pub(crate) async fn handle(&mut self, cmd: EngineCommand) -> bool {
        match cmd {
            EngineCommand::Attach { id, handle } => self.attach(id, handle),
            EngineCommand::Frame { id, text } => self.frame(id, text).await,
            EngineCommand::Detach { id } => self.detach(id).await,
            EngineCommand::AuthTimeout { id } => self.auth_timeout(id),
            EngineCommand::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    fn attach(&mut self, id: SessionId, handle: ConnHandle) {
        let mut session = crate::session::Session::new(id, handle);
        let deadline = Duration::from_secs(self.config.auth_timeout);
        let tx = self.tx.clone();
        session.arm_auth_deadline(tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = tx.send(EngineCommand::AuthTimeout { id }).await;
        }));
        session.handle.send(Outbound::Envelope(ServerMsg::Info {
            message: format!(
                "connected to crier relay; log in within {}s",
                self.config.auth_timeout
            ),
        }));
        self.registry.register(session);
        gauges::inc_connections_active();
        debug!(session = id, "session attached");
    }

    async fn frame(&mut self, id: SessionId, text: String) {
        // A frame from a session that was already removed is stale.
        if self.registry.find(id).is_none() {
            return;
        }
        if text.len() > self.config.max_frame {
            counters::messages_dropped_total("oversize");
            self.send_error(
                id,
                ErrorKind::Protocol,
                format!("frame exceeds {} bytes", self.config.max_frame),
            );
            return;
        }
        if !self.limiter.try_acquire(id) {
            counters::messages_dropped_total("rate_limit");
            self.send_error(id, ErrorKind::RateLimit, "rate limit exceeded, message dropped");
            return;
        }
        match ClientCommand::parse(&text) {
            Err(e) => self.send_error(id, ErrorKind::Protocol, e.to_string()),
            Ok(ClientCommand::Login { username, filters }) => {
                self.login(id, username, filters).await;
            }
            Ok(ClientCommand::Stats) => self.handle_stats(id),
            Ok(ClientCommand::Admin {
                verb,
                password,
                target,
            }) => self.handle_admin(id, verb, password, target).await,
            Ok(ClientCommand::Broadcast(payload)) => self.handle_broadcast(id, &payload),
        }
    }

    async fn login(
        &mut self,
        id: SessionId,
        username: String,
        filters: crier_common::protocol::SourceFilter,
    ) {
        let Some(session) = self.registry.find(id) else {
            return;
        };
        if session.authenticated {
            self.send_error(id, ErrorKind::Auth, "already authenticated");
            return;
        }
        let ip = session.handle.remote_ip.to_string();

        // A malformed username is reported but does not close the
        // connection; the client may retry.
        if !validate::valid_username(&username) {
            self.send_error(id, ErrorKind::Auth, "invalid username format");
            return;
        }

        let whitelisted = match self.whitelist.is_whitelisted(&username).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "whitelist lookup failed");
                self.reject_login(id, &username, &ip, "authorization check failed")
                    .await;
                return;
            }
        };
        if !whitelisted {
            self.reject_login(id, &username, &ip, "not whitelisted").await;
            return;
        }

        if self.registry.count_by_username(&username) >= self.config.max_user_conns {
            self.reject_login(id, &username, &ip, "max connections reached for user")
                .await;
            return;
        }

        let (is_broadcaster, is_admin) = match self.role_flags(&username).await {
            Ok(flags) => flags,
            Err(e) => {
                warn!(error = %e, "role lookup failed");
                self.reject_login(id, &username, &ip, "authorization check failed")
                    .await;
                return;
            }
        };

        let Some(session) = self.registry.find_mut(id) else {
            return;
        };
        session.authenticate(username.clone(), is_broadcaster, is_admin, filters.clone());
        self.send_to(
            id,
            ServerMsg::AuthSuccess {
                username: username.clone(),
                is_broadcaster,
                is_admin,
                filters,
            },
        );

        self.counters.total_connections += 1;
        let authed = self.registry.count_authenticated();
        self.counters.observe_authenticated(authed);
        gauges::set_sessions_authenticated(authed);
        counters::logins_total("success");
        self.record_event(&username, &ip, EventType::Connect, None).await;
        info!(username = %username, session = id, ip = %ip, "session authenticated");
    }

    async fn role_flags(
        &self,
        username: &str,
    ) -> Result<(bool, bool), crate::store::StoreError> {
        let is_broadcaster = self.whitelist.is_broadcaster(username).await?;
        let is_admin = self.whitelist.is_admin(username).await?;
        Ok((is_broadcaster, is_admin))
    }

    async fn reject_login(&mut self, id: SessionId, username: &str, ip: &str, reason: &str) {
        self.counters.auth_failures += 1;
        counters::auth_failures_total();
        counters::logins_total("rejected");
        self.record_event(username, ip, EventType::AuthFail, Some(reason)).await;
        self.send_error(id, ErrorKind::Auth, reason);
        self.close(id, close_code::POLICY_VIOLATION, reason);
        info!(username = %username, session = id, reason = reason, "login rejected");
    }

    fn handle_stats(&mut self, id: SessionId) {
        let Some(session) = self.registry.find(id) else {
            return;
        };
        if !session.authenticated {
            self.send_error(id, ErrorKind::Auth, "not authenticated");
            return;
        }
        let snapshot = stats::snapshot(&self.registry, &self.counters, &self.recent);
        self.send_to(id, ServerMsg::Stats(snapshot));
    }

    fn auth_timeout(&mut self, id: SessionId) {
        let Some(session) = self.registry.find(id) else {
            return;
        };
        if session.authenticated {
            return;
        }
        self.counters.auth_failures += 1;
        counters::auth_failures_total();
        self.send_error(id, ErrorKind::Auth, "authentication timeout");
        self.close(id, close_code::POLICY_VIOLATION, "authentication timeout");
        debug!(session = id, "auth deadline elapsed");
    }

    async fn detach(&mut self, id: SessionId) {
        let Some(session) = self.registry.remove(id) else {
            return;
        };
        self.limiter.reset(id);
        gauges::dec_connections_active();
        if session.authenticated {
            self.counters.total_disconnections += 1;
            gauges::set_sessions_authenticated(self.registry.count_authenticated());
            if let Some(username) = session.username.as_deref() {
                let ip = session.handle.remote_ip.to_string();
                self.record_event(username, &ip, EventType::Disconnect, None).await;
            }
        }
        debug!(session = id, "session detached");
    }

    fn heartbeat(&self) {
        for session in self.registry.iter() {
            session.handle.send(Outbound::Ping);
        }
    }

    async fn purge_events(&self) {
        match self
            .events
            .purge_older_than(chrono::Duration::days(EVENT_RETENTION_DAYS))
            .await
        {
            Ok(0) => {}
            Ok(n) => info!(purged = n, "event retention sweep"),
            Err(e) => warn!(error = %e, "event retention sweep failed"),
        }
    }

    fn shutdown(&mut self) {
        info!(sessions = self.registry.len(), "closing all sessions");
        for session in self.registry.iter() {
            session.handle.send(Outbound::Close {
                code: close_code::GOING_AWAY,
                reason: "server shutting down".to_string(),
            });
        }
        self.registry.clear();
    }

    /// Fire-and-forget an envelope to one session.
    pub(crate) fn send_to(&self, id: SessionId, msg: ServerMsg) {
        if let Some(session) = self.registry.find(id) {
            session.handle.send(Outbound::Envelope(msg));
        }
    }

    /// Fire-and-forget an `error` envelope to one session.
    pub(crate) fn send_error(&self, id: SessionId, kind: ErrorKind, message: impl Into<String>) {
        self.send_to(id, ServerMsg::error(kind, message));
    }

    /// Instruct one session's transport to close.
    pub(crate) fn close(&self, id: SessionId, code: u16, reason: &str) {
        if let Some(session) = self.registry.find(id) {
            session.handle.send(Outbound::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }

    /// Best-effort event logging: failures are logged and swallowed.
    pub(crate) async fn record_event(
        &self,
        username: &str,
        ip: &str,
        event: EventType,
        reason: Option<&str>,
    ) {
        if let Err(e) = self.events.log_event(username, ip, event, reason).await {
            warn!(error = %e, event = event.as_str(), "failed to record event");
        }
    }
}
