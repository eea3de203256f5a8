//! Shared data model for the dispatch engine.
//!
//! Wire formats (OpenAI-shape, native-shape) are translated at the edges in
//! [`crate::translate`]; everything inside the pipeline operates on these
//! tagged types instead of loosely-typed JSON blobs.

use serde::{Deserialize, Serialize};

/// The proxy's own bearer token presented by a client. Scopes all per-caller
/// state (context records, cache handles, sticky-session affinity).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credential(pub String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Turn role. No `System` variant exists here — the translator flattens a
/// wire-level system message into the first user turn before it ever
/// reaches internal types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// A single content part of a message. Image/audio parts are preserved
/// verbatim end to end — the mime type travels with the bytes and is never
/// dropped or guessed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Part {
    Text(String),
    InlineData { mime_type: String, data: String },
}

impl Part {
    pub fn text(s: impl Into<String>) -> Self {
        Part::Text(s.into())
    }

    /// Rough serialized length used by the token estimator
    /// (`len(utf8_serialized_json) / 4`).
    pub fn estimate_len(&self) -> usize {
        match self {
            Part::Text(s) => s.len(),
            Part::InlineData { mime_type, data } => mime_type.len() + data.len(),
        }
    }
}

/// A single conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::text(text)],
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![Part::text(text)],
        }
    }

    /// Estimated serialized length in bytes, used for token estimation.
    pub fn estimate_len(&self) -> usize {
        self.parts.iter().map(Part::estimate_len).sum::<usize>() + 16
    }
}

/// Mime types the translator accepts for inline image data.
pub const ALLOWED_INLINE_MIME_TYPES: &[&str] =
    &["image/jpeg", "image/png", "image/webp", "image/heic", "image/heif"];

pub fn is_allowed_inline_mime(mime_type: &str) -> bool {
    ALLOWED_INLINE_MIME_TYPES.contains(&mime_type)
}
