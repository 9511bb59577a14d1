//! Items flowing between pipeline stages.
//!
//! raw identifier (`String`) → [`User`] → [`MessageId`] → [`ClassifiedMessage`]
//! → output line (`String`).

use std::fmt;

use serde::{Deserialize, Serialize};

/// A resolved user. Unique by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub email: String,
}

impl User {
    pub fn new(id: u64, email: impl Into<String>) -> Self {
        Self {
            id,
            email: email.into(),
        }
    }
}

/// Opaque message identifier returned by the message store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Spam verdict for a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedMessage {
    pub id: MessageId,
    pub is_spam: bool,
}

impl ClassifiedMessage {
    /// Output line: `"<is_spam> <id>"`.
    pub fn to_line(&self) -> String {
        format!("{} {}", self.is_spam, self.id)
    }
}
