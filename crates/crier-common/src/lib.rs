//! Common types shared across the crier relay stack.
//!
//! This crate provides:
//! - JSON wire envelopes and client command parsing ([`protocol`])
//! - Field-level validators and sanitization ([`validate`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod protocol;
pub mod validate;

pub use protocol::{AdminVerb, ClientCommand, ErrorKind, ServerMsg, SourceFilter};
