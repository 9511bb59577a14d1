//! External collaborators consumed by the pipeline.
//!
//! Each trait is one remote lookup. Implementations are invoked from many
//! tasks at once and must be safe for concurrent use.

pub mod simulated;

use async_trait::async_trait;

use crate::error::ServiceError;
use crate::pipeline::types::{MessageId, User};

pub use simulated::{SimulatedConfig, SimulatedServices};

/// Resolves a raw identifier (login, email, handle) to a [`User`].
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn resolve_user(&self, identifier: &str) -> Result<User, ServiceError>;
}

/// Returns message ids owned by a batch of users.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Called with between 1 and `max_batch_size` users. A failure covers
    /// the whole batch.
    async fn fetch_messages(&self, users: &[User]) -> Result<Vec<MessageId>, ServiceError>;
}

/// Decides whether a single message is spam.
#[async_trait]
pub trait SpamClassifier: Send + Sync {
    async fn has_spam(&self, id: MessageId) -> Result<bool, ServiceError>;
}
