//! Field-level validators for login and broadcast payloads.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Maximum length of any sanitized notice field, in characters.
pub const MAX_FIELD_CHARS: usize = 1000;

/// Usernames are 1-50 characters of letters, digits, underscore, or hyphen.
fn username_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^[A-Za-z0-9_-]{1,50}$").expect("static pattern"))
}

/// Whether a requested username passes format validation.
#[must_use]
pub fn valid_username(name: &str) -> bool {
    username_pattern().is_match(name)
}

/// A validated, sanitized notice ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    /// Notice title.
    pub title: String,
    /// Link target; guaranteed to parse as an absolute URL.
    pub url: String,
    /// Icon link.
    pub icon: String,
    /// Source tag, original casing.
    pub source: String,
    /// Image link.
    pub image: String,
}

impl Notice {
    /// The lowercased source tag used for filter matching.
    #[must_use]
    pub fn source_key(&self) -> String {
        self.source.to_lowercase()
    }
}

/// The first violation found in a broadcast payload. Nothing is delivered
/// when validation fails.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NoticeError {
    /// The payload was not a JSON object.
    #[error("broadcast payload must be a JSON object")]
    NotAnObject,
    /// A required field was absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),
    /// A required field was not a non-empty string.
    #[error("field {0} must be a non-empty string")]
    EmptyField(&'static str),
    /// The `url` field did not parse as an absolute URL.
    #[error("field url must be a well-formed absolute URL")]
    InvalidUrl,
}

/// Trim and cap a field at [`MAX_FIELD_CHARS`] characters.
#[must_use]
pub fn sanitize(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.chars().count() <= MAX_FIELD_CHARS {
        trimmed.to_string()
    } else {
        trimmed.chars().take(MAX_FIELD_CHARS).collect()
    }
}

/// Validate a broadcast payload: `title`, `url`, `icon`, `source`, and
/// `image` must all be non-empty strings, and `url` must parse as an
/// absolute URL. Fields are checked in that order and the first offender is
/// reported. The returned notice carries sanitized values.
///
/// # Errors
///
/// Returns the first [`NoticeError`] encountered.
pub fn validate_notice(payload: &Value) -> Result<Notice, NoticeError> {
    let object = payload.as_object().ok_or(NoticeError::NotAnObject)?;

    let field = |name: &'static str| -> Result<String, NoticeError> {
        let value = object.get(name).ok_or(NoticeError::MissingField(name))?;
        let text = value.as_str().ok_or(NoticeError::EmptyField(name))?;
        let clean = sanitize(text);
        if clean.is_empty() {
            return Err(NoticeError::EmptyField(name));
        }
        Ok(clean)
    };

    let title = field("title")?;
    let url = field("url")?;
    let icon = field("icon")?;
    let source = field("source")?;
    let image = field("image")?;

    // Validate the sanitized value, since that is what gets delivered.
    if url::Url::parse(&url).is_err() {
        return Err(NoticeError::InvalidUrl);
    }

    Ok(Notice {
        title,
        url,
        icon,
        source,
        image,
    })
}
