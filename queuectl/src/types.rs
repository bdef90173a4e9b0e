//! Identifier and tag types shared across the queue, worker and API layers.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for an admitted generation request.
///
/// Allocated at admission time and stable for the lifetime of the process. Serialized as the
/// hyphenated UUID string so that it round-trips through URL paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Create a new random request ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque label for the surface that submitted a request.
///
/// Informational only: it never influences ordering or processing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientTag(String);

impl ClientTag {
    /// Tag used for every request admitted through the chat-completion facade.
    pub const OPENAI_COMPAT: &'static str = "openai_compat";

    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn openai_compat() -> Self {
        Self::new(Self::OPENAI_COMPAT)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
