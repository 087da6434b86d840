//! JSON wire protocol for the crier relay.
//!
//! Frames are UTF-8 text carrying either a line command (`login`, `stats`,
//! `admin`, `broadcast`) or a bare JSON object (implicit broadcast). Server
//! replies are JSON envelopes tagged by a `type` field.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Maximum accepted text frame size in bytes. Oversized frames are answered
/// with an `error` envelope and otherwise ignored.
pub const MAX_FRAME_BYTES: usize = 100_000;

/// WebSocket close codes used by the relay.
pub mod close_code {
    /// The peer violated a server rule: auth timeout, not whitelisted,
    /// connection cap exceeded, kicked, or banned.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Sent to every peer when the server shuts down.
    pub const GOING_AWAY: u16 = 1001;
}

/// Per-session subscription predicate over a broadcast's `source` tag.
///
/// Chosen once at login. `All` receives every broadcast; an empty tag set
/// receives nothing. Tags are stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceFilter {
    /// Receive every broadcast regardless of source.
    All,
    /// Receive only broadcasts whose lowercased source is in the set.
    /// An empty set receives nothing.
    Tags(BTreeSet<String>),
}

impl SourceFilter {
    /// Parse the body of a bracketed filter list (the text between `[` and
    /// `]`). `*` means receive-all; tokens are comma-split, trimmed, and
    /// lowercased, with empty tokens dropped.
    #[must_use]
    pub fn parse_tags(body: &str) -> Self {
        if body.trim() == "*" {
            return Self::All;
        }
        let tags: BTreeSet<String> = body
            .split(',')
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        Self::Tags(tags)
    }

    /// Whether a broadcast with the given lowercased source key is admitted.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::All => true,
            Self::Tags(tags) => tags.contains(key),
        }
    }

    /// Whether this filter admits nothing at all.
    #[must_use]
    pub fn is_receive_nothing(&self) -> bool {
        matches!(self, Self::Tags(tags) if tags.is_empty())
    }
}

impl Serialize for SourceFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::All => serializer.serialize_str("*"),
            Self::Tags(tags) => {
                let mut seq = serializer.serialize_seq(Some(tags.len()))?;
                for tag in tags {
                    seq.serialize_element(tag)?;
                }
                seq.end()
            }
        }
    }
}

impl fmt::Display for SourceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "*"),
            Self::Tags(tags) => {
                let list: Vec<&str> = tags.iter().map(String::as_str).collect();
                write!(f, "[{}]", list.join(", "))
            }
        }
    }
}

/// Session lifecycle events recorded in the event-history store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Successful authentication.
    Connect,
    /// An authenticated session's transport closed.
    Disconnect,
    /// A login attempt was rejected.
    AuthFail,
    /// An admin forcibly closed the session.
    Kicked,
    /// An admin banned the user and closed the session.
    Banned,
}

impl EventType {
    /// Stable string form used as the storage key.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::AuthFail => "auth_fail",
            Self::Kicked => "kicked",
            Self::Banned => "banned",
        }
    }

    /// Parse the storage key back into an event type.
    #[must_use]
    pub fn from_key(value: &str) -> Option<Self> {
        match value {
            "connect" => Some(Self::Connect),
            "disconnect" => Some(Self::Disconnect),
            "auth_fail" => Some(Self::AuthFail),
            "kicked" => Some(Self::Kicked),
            "banned" => Some(Self::Banned),
            _ => None,
        }
    }
}

/// One row of a user's connection history.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    /// Username the event belongs to.
    pub username: String,
    /// Remote address the session connected from.
    pub ip: String,
    /// What happened.
    pub event: EventType,
    /// Optional free-form reason (rejection cause, admin note).
    pub reason: Option<String>,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Aggregate connection summary for one username.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserSummary {
    /// Lifetime successful connects.
    pub total_connections: u64,
    /// Lifetime disconnects.
    pub total_disconnections: u64,
    /// Lifetime rejected login attempts.
    pub auth_failures: u64,
    /// Lifetime forced closes (kicks and bans).
    pub times_kicked: u64,
    /// Earliest recorded event, if any.
    pub first_seen: Option<DateTime<Utc>>,
    /// Latest recorded event, if any.
    pub last_seen: Option<DateTime<Utc>>,
}

/// Event count for one hour bucket, newest first in responses.
#[derive(Debug, Clone, Serialize)]
pub struct HourlyBucket {
    /// Start of the hour, UTC.
    pub hour: DateTime<Utc>,
    /// Events recorded within that hour.
    pub events: u64,
}

/// Entry in the bounded recent-broadcast ring.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastRecord {
    /// Broadcast id.
    pub id: String,
    /// Sanitized notice title.
    pub title: String,
    /// Sanitized notice source tag (original casing).
    pub source: String,
    /// Username that published the notice.
    pub sender: String,
    /// Number of sessions the notice was delivered to.
    pub recipients: usize,
    /// When the broadcast was dispatched.
    pub timestamp: DateTime<Utc>,
}

/// Per-session detail included in a stats snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDetail {
    /// Process-local session id.
    pub id: u64,
    /// Authenticated username.
    pub username: String,
    /// Whether the session may publish notices.
    pub is_broadcaster: bool,
    /// Whether the session may issue admin commands.
    pub is_admin: bool,
    /// The session's source filter.
    pub filters: SourceFilter,
    /// Remote address.
    pub remote_ip: String,
    /// Seconds since the transport was accepted.
    pub connected_secs: u64,
    /// Broadcast envelopes delivered to this session.
    pub messages_received: u64,
}

/// Read-only snapshot of registry state and lifetime counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Live sessions, authenticated or not.
    pub sessions: usize,
    /// Authenticated sessions.
    pub authenticated: usize,
    /// Authenticated sessions with broadcaster rights.
    pub broadcasters: usize,
    /// Authenticated sessions with admin rights.
    pub admins: usize,
    /// Lifetime successful authentications.
    pub total_connections: u64,
    /// Lifetime disconnects of authenticated sessions.
    pub total_disconnections: u64,
    /// Lifetime dispatched broadcasts.
    pub total_broadcasts: u64,
    /// Lifetime delivered broadcast envelopes.
    pub messages_delivered: u64,
    /// Lifetime rejected login attempts.
    pub auth_failures: u64,
    /// Running maximum of concurrently authenticated sessions.
    pub peak_authenticated: usize,
    /// Process start time.
    pub started_at: DateTime<Utc>,
    /// Seconds since process start.
    pub uptime_secs: u64,
    /// Active authenticated session count per username.
    pub connections_by_user: BTreeMap<String, usize>,
    /// The bounded recent-broadcast ring, newest first.
    pub recent_broadcasts: Vec<BroadcastRecord>,
    /// Detail rows for every authenticated session.
    pub session_details: Vec<SessionDetail>,
}

/// Client-visible error classification carried on `error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Oversized frame, unparseable JSON, unknown command.
    Protocol,
    /// Login rejected or required before this command.
    Auth,
    /// Caller lacks the broadcaster or admin role, or gave a bad password.
    Permission,
    /// A notice field is missing, empty, or malformed.
    Validation,
    /// The sliding-window admission limit was exceeded.
    RateLimit,
    /// An admin command failed against the whitelist or event store.
    Admin,
}

/// Server-to-client envelope, tagged by `type`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Informational notice (greeting, kick warning).
    Info {
        /// Human-readable text.
        message: String,
    },
    /// Login accepted.
    AuthSuccess {
        /// The resolved username.
        username: String,
        /// Whether the session may publish notices.
        is_broadcaster: bool,
        /// Whether the session may issue admin commands.
        is_admin: bool,
        /// The filter set chosen at login.
        filters: SourceFilter,
    },
    /// A published notice fanned out to this session.
    Broadcast {
        /// Broadcast id, shared by every recipient's copy.
        id: String,
        /// Sanitized notice title.
        title: String,
        /// Sanitized notice link.
        url: String,
        /// Sanitized icon link.
        icon: String,
        /// Sanitized source tag (original casing).
        source: String,
        /// Sanitized image link.
        image: String,
        /// Username that published the notice.
        sender: String,
        /// Dispatch time.
        timestamp: DateTime<Utc>,
    },
    /// Acknowledgment to the publishing broadcaster.
    BroadcastSent {
        /// Broadcast id.
        id: String,
        /// Sessions the notice was delivered to.
        recipients: usize,
    },
    /// Outcome of an admin verb.
    AdminResponse {
        /// The verb that was executed.
        command: String,
        /// Whether the verb succeeded.
        success: bool,
        /// Outcome description or failure reason.
        message: String,
    },
    /// Live role change pushed to an affected session.
    StatusUpdate {
        /// Updated broadcaster flag.
        is_broadcaster: bool,
        /// Updated admin flag.
        is_admin: bool,
        /// Human-readable description of the change.
        message: String,
    },
    /// Reply to `admin user_detail`.
    UserDetail {
        /// The inspected username.
        username: String,
        /// Live authenticated sessions for that username.
        active_sessions: usize,
        /// Aggregate connection summary from the event store.
        summary: UserSummary,
        /// Most recent events for that username, newest first.
        history: Vec<EventRecord>,
    },
    /// Reply to `admin connection_stats`.
    ConnectionStats {
        /// The clamped hours-back window.
        hours: u32,
        /// Hourly event counts over the window, newest first.
        hourly: Vec<HourlyBucket>,
        /// Most recent events across all users, newest first.
        recent: Vec<EventRecord>,
    },
    /// Reply to `stats`.
    Stats(StatsSnapshot),
    /// A per-request failure; the connection stays open unless the kind's
    /// policy says otherwise.
    Error {
        /// Error classification.
        kind: ErrorKind,
        /// Human-readable description.
        message: String,
    },
}

impl ServerMsg {
    /// Shorthand for an `error` envelope.
    #[must_use]
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    /// Serialize to the JSON text sent on the wire.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            // Serialization of these envelopes cannot fail; keep a valid
            // frame on the wire if it ever does.
            r#"{"type":"error","kind":"protocol","message":"internal serialization failure"}"#
                .to_string()
        })
    }
}

/// Admin control-plane verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminVerb {
    /// Whitelist the target as a receiver.
    AddUser,
    /// Soft-deactivate the target in the whitelist.
    RemoveUser,
    /// Grant the broadcaster role.
    AddBroadcaster,
    /// Revoke the broadcaster role.
    RemoveBroadcaster,
    /// Forcibly close the target's live sessions.
    Kick,
    /// Deactivate the target and close its live sessions.
    Ban,
    /// Inspect one user's sessions and history.
    UserDetail,
    /// Hourly event counts and recent events across all users.
    ConnectionStats,
}

impl AdminVerb {
    /// Parse the wire token for a verb.
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "add_user" => Some(Self::AddUser),
            "remove_user" => Some(Self::RemoveUser),
            "add_broadcaster" => Some(Self::AddBroadcaster),
            "remove_broadcaster" => Some(Self::RemoveBroadcaster),
            "kick" => Some(Self::Kick),
            "ban" => Some(Self::Ban),
            "user_detail" => Some(Self::UserDetail),
            "connection_stats" => Some(Self::ConnectionStats),
            _ => None,
        }
    }

    /// The wire token for this verb.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddUser => "add_user",
            Self::RemoveUser => "remove_user",
            Self::AddBroadcaster => "add_broadcaster",
            Self::RemoveBroadcaster => "remove_broadcaster",
            Self::Kick => "kick",
            Self::Ban => "ban",
            Self::UserDetail => "user_detail",
            Self::ConnectionStats => "connection_stats",
        }
    }
}

/// A decoded client frame. Produced by a single parse step and dispatched
/// by exhaustive match, so new verbs are a compile-checked addition.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    /// `login <username> [a, b]`
    Login {
        /// Requested username, not yet validated.
        username: String,
        /// Filter set parsed from the optional bracket list.
        filters: SourceFilter,
    },
    /// `stats`
    Stats,
    /// `admin <verb> [<password>] <target>`
    Admin {
        /// The requested verb.
        verb: AdminVerb,
        /// Password token, when present.
        password: Option<String>,
        /// Target username, or hours for `connection_stats`.
        target: Option<String>,
    },
    /// `broadcast <json>` or a bare top-level JSON object.
    Broadcast(serde_json::Value),
}

/// Frame decoding failures. These keep the connection open; the client
/// receives a `protocol` error envelope.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The frame was empty or whitespace.
    #[error("empty frame")]
    Empty,
    /// A broadcast payload was not valid JSON.
    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),
    /// The leading word is not a known command.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    /// The admin verb token is not recognized.
    #[error("unknown admin verb: {0}")]
    UnknownVerb(String),
    /// A required argument was missing.
    #[error("missing {0}")]
    MissingArgument(&'static str),
}

impl ClientCommand {
    /// Decode one text frame into a command.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] for empty frames, malformed JSON, unknown
    /// commands or verbs, and missing required arguments.
    pub fn parse(frame: &str) -> Result<Self, ParseError> {
        let text = frame.trim();
        if text.is_empty() {
            return Err(ParseError::Empty);
        }
        // A bare JSON object is an implicit broadcast.
        if text.starts_with('{') {
            return parse_json_payload(text).map(Self::Broadcast);
        }
        let (word, rest) = match text.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (text, ""),
        };
        match word {
            "login" => parse_login(rest),
            "stats" if rest.is_empty() => Ok(Self::Stats),
            "admin" => parse_admin(rest),
            "broadcast" => {
                if rest.is_empty() {
                    return Err(ParseError::MissingArgument("broadcast payload"));
                }
                parse_json_payload(rest).map(Self::Broadcast)
            }
            other => Err(ParseError::UnknownCommand(other.to_string())),
        }
    }
}

fn parse_json_payload(text: &str) -> Result<serde_json::Value, ParseError> {
    serde_json::from_str(text).map_err(|e| ParseError::InvalidJson(e.to_string()))
}

/// `<username>` optionally followed by a bracketed filter list. No brackets
/// means receive-all; `[]` means receive-nothing; `[*]` means receive-all.
fn parse_login(rest: &str) -> Result<ClientCommand, ParseError> {
    if rest.is_empty() {
        return Err(ParseError::MissingArgument("username"));
    }
    let (username, filters) = match rest.find('[') {
        None => (rest.trim(), SourceFilter::All),
        Some(idx) => {
            let body = rest[idx + 1..].trim_end();
            let body = body.strip_suffix(']').unwrap_or(body);
            (rest[..idx].trim(), SourceFilter::parse_tags(body))
        }
    };
    if username.is_empty() {
        return Err(ParseError::MissingArgument("username"));
    }
    Ok(ClientCommand::Login {
        username: username.to_string(),
        filters,
    })
}

/// `<verb> [<password>] [<target>]`. With two trailing tokens the first is
/// the password; with one it is the target, except that a non-numeric lone
/// token for `connection_stats` is taken as a password.
fn parse_admin(rest: &str) -> Result<ClientCommand, ParseError> {
    let mut tokens = rest.split_whitespace();
    let verb_token = tokens.next().ok_or(ParseError::MissingArgument("admin verb"))?;
    let verb = AdminVerb::from_token(verb_token)
        .ok_or_else(|| ParseError::UnknownVerb(verb_token.to_string()))?;
    let args: Vec<&str> = tokens.collect();
    let (password, target) = match args.as_slice() {
        [] => (None, None),
        [one] => match verb {
            AdminVerb::ConnectionStats if one.parse::<u32>().is_err() => {
                (Some((*one).to_string()), None)
            }
            _ => (None, Some((*one).to_string())),
        },
        [password, target, ..] => (Some((*password).to_string()), Some((*target).to_string())),
    };
    if target.is_none() && verb != AdminVerb::ConnectionStats {
        return Err(ParseError::MissingArgument("target"));
    }
    Ok(ClientCommand::Admin {
        verb,
        password,
        target,
    })
}
