use crier_common::protocol::{close_code, AdminVerb, ErrorKind, EventType, ServerMsg};
use tracing::info;

use crate::engine::Engine;
use crate::session::{Outbound, SessionId};
use crate::store::StoreError;

/// Events returned by `user_detail`.
const HISTORY_LIMIT: u32 = 10;
/// Events returned by `connection_stats`.
const RECENT_EVENTS_LIMIT: u32 = 20;
/// Bounds for the `connection_stats` hours-back window.
const HOURS_MIN: u32 = 1;
const HOURS_MAX: u32 = 168;
const HOURS_DEFAULT: u32 = 24;

impl Engine {
    /// Execute one admin verb. Requires an authenticated admin session
    /// and, when an admin secret is configured, a matching password token.
    /// Store failures surface as `admin_response` errors, never as a
    /// process failure.
    pub(crate) async fn handle_admin(
        &mut self,
        id: SessionId,
        verb: AdminVerb,
        password: Option<String>,
        target: Option<String>,
    ) {
        let Some(session) = self.registry.find(id) else {
            return;
        };
        if !session.authenticated {
            self.send_error(id, ErrorKind::Auth, "not authenticated");
            return;
        }
        if !session.is_admin {
            self.send_error(id, ErrorKind::Permission, "admin privileges required");
            return;
        }
        if let Some(secret) = &self.config.admin_secret {
            if password.as_deref() != Some(secret.as_str()) {
                self.send_error(id, ErrorKind::Permission, "invalid admin password");
                return;
            }
        }
        let admin = session.username.clone().unwrap_or_default();

        let outcome = match verb {
            AdminVerb::AddUser => self.add_user(target.as_deref()).await,
            AdminVerb::RemoveUser => self.remove_user(target.as_deref()).await,
            AdminVerb::AddBroadcaster => self.set_broadcaster(target.as_deref(), true).await,
            AdminVerb::RemoveBroadcaster => self.set_broadcaster(target.as_deref(), false).await,
            AdminVerb::Kick => self.kick(target.as_deref(), EventType::Kicked).await,
            AdminVerb::Ban => self.ban(target.as_deref()).await,
            AdminVerb::UserDetail => self.user_detail(id, target.as_deref()).await,
            AdminVerb::ConnectionStats => self.connection_stats(id, target.as_deref()).await,
        };

        match outcome {
            Ok(Some(message)) => {
                info!(admin = %admin, verb = verb.as_str(), "admin command executed");
                self.send_to(
                    id,
                    ServerMsg::AdminResponse {
                        command: verb.as_str().to_string(),
                        success: true,
                        message,
                    },
                );
            }
            // The verb already sent its own reply envelope.
            Ok(None) => {
                info!(admin = %admin, verb = verb.as_str(), "admin command executed");
            }
            Err(e) => {
                self.send_to(
                    id,
                    ServerMsg::AdminResponse {
                        command: verb.as_str().to_string(),
                        success: false,
                        message: e.to_string(),
                    },
                );
            }
        }
    }

    async fn add_user(&mut self, target: Option<&str>) -> Result<Option<String>, StoreError> {
        let target = required(target)?;
        self.whitelist.add_user(target).await?;
        Ok(Some(format!("user {target} whitelisted")))
    }

    async fn remove_user(&mut self, target: Option<&str>) -> Result<Option<String>, StoreError> {
        let target = required(target)?;
        self.whitelist.remove_user(target).await?;
        Ok(Some(format!("user {target} deactivated")))
    }

    /// Grant or revoke the broadcaster role, then push the change to every
    /// live session of that username so it applies without re-login.
    async fn set_broadcaster(
        &mut self,
        target: Option<&str>,
        grant: bool,
    ) -> Result<Option<String>, StoreError> {
        let target = required(target)?;
        if grant {
            self.whitelist.add_broadcaster(target).await?;
        } else {
            self.whitelist.remove_broadcaster(target).await?;
        }

        let description = if grant {
            "broadcast rights granted"
        } else {
            "broadcast rights revoked"
        };
        let mut updated = 0;
        for session in self.registry.iter_mut() {
            if !session.is_user(target) {
                continue;
            }
            session.is_broadcaster = grant;
            let update = ServerMsg::StatusUpdate {
                is_broadcaster: session.is_broadcaster,
                is_admin: session.is_admin,
                message: description.to_string(),
            };
            session.handle.send(Outbound::Envelope(update));
            updated += 1;
        }
        Ok(Some(format!(
            "{description} for {target} ({updated} live session(s) updated)"
        )))
    }

    /// Close every live session of the target. No whitelist change.
    async fn kick(
        &mut self,
        target: Option<&str>,
        event: EventType,
    ) -> Result<Option<String>, StoreError> {
        let target = required(target)?;
        let victims: Vec<SessionId> = self
            .registry
            .iter()
            .filter(|s| s.is_user(target))
            .map(|s| s.id)
            .collect();
        if victims.is_empty() {
            return Ok(Some(format!("no live session for {target}")));
        }

        let cause = match event {
            EventType::Banned => "banned",
            _ => "kicked",
        };
        for victim in victims.iter().copied() {
            let Some(session) = self.registry.find(victim) else {
                continue;
            };
            let ip = session.handle.remote_ip.to_string();
            session.handle.send(Outbound::Envelope(ServerMsg::Info {
                message: format!("you have been {cause} by an administrator"),
            }));
            session.handle.send(Outbound::Close {
                code: close_code::POLICY_VIOLATION,
                reason: cause.to_string(),
            });
            self.record_event(target, &ip, event, None).await;
        }
        Ok(Some(format!("{cause} {} session(s) of {target}", victims.len())))
    }

    /// Deactivate the target in the whitelist, then kick every live
    /// session.
    async fn ban(&mut self, target: Option<&str>) -> Result<Option<String>, StoreError> {
        let name = required(target)?;
        self.whitelist.remove_user(name).await?;
        let kicked = self.kick(target, EventType::Banned).await?;
        Ok(Some(format!(
            "user {name} banned; {}",
            kicked.unwrap_or_default()
        )))
    }

    async fn user_detail(
        &mut self,
        id: SessionId,
        target: Option<&str>,
    ) -> Result<Option<String>, StoreError> {
        let target = required(target)?;
        let summary = self.events.summary(target).await?;
        let history = self.events.history(target, HISTORY_LIMIT).await?;
        self.send_to(
            id,
            ServerMsg::UserDetail {
                username: target.to_string(),
                active_sessions: self.registry.count_by_username(target),
                summary,
                history,
            },
        );
        Ok(None)
    }

    async fn connection_stats(
        &mut self,
        id: SessionId,
        target: Option<&str>,
    ) -> Result<Option<String>, StoreError> {
        let hours = target
            .and_then(|t| t.parse::<u32>().ok())
            .unwrap_or(HOURS_DEFAULT)
            .clamp(HOURS_MIN, HOURS_MAX);
        let hourly = self.events.hourly_stats(hours).await?;
        let recent = self.events.recent_events(RECENT_EVENTS_LIMIT).await?;
        self.send_to(
            id,
            ServerMsg::ConnectionStats {
                hours,
                hourly,
                recent,
            },
        );
        Ok(None)
    }
}

fn required(target: Option<&str>) -> Result<&str, StoreError> {
    // The parser enforces this for every verb that needs a target; this
    // guards direct callers.
    target.ok_or_else(|| StoreError::Task("missing target".to_string()))
}
