//! Deterministic in-process stand-ins for the remote services.
//!
//! Used by the binary and by tests. Identifiers are normalized (trimmed,
//! lowercased) and hashed onto a fixed user space, so different spellings of
//! the same login resolve to the same user. Each user owns
//! `messages_per_user` consecutive message ids; a message is spam when its id
//! is divisible by `spam_modulus`.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::debug;

use super::{MessageStore, SpamClassifier, UserDirectory};
use crate::error::{ConfigError, ServiceError};
use crate::pipeline::types::{MessageId, User};

/// Gap between the first message ids of consecutive users.
const MESSAGE_ID_STRIDE: u64 = 1_000;

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedConfig {
    /// Number of distinct users identifiers are hashed onto.
    pub user_space: u64,
    /// At most `MESSAGE_ID_STRIDE`; larger values are clamped so users never
    /// share message ids.
    pub messages_per_user: u64,
    pub spam_modulus: u64,
    /// Each call sleeps a random duration in `[0, max_latency]`.
    pub max_latency: Duration,
    /// Probability in `[0, 1]` that a call fails.
    pub failure_rate: f64,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            user_space: 10_000,
            messages_per_user: 3,
            spam_modulus: 7,
            max_latency: Duration::ZERO,
            failure_rate: 0.0,
        }
    }
}

impl SimulatedConfig {
    /// Build config from `SIMULATED_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            user_space: env_or("SIMULATED_USER_SPACE", defaults.user_space)?,
            messages_per_user: env_or("SIMULATED_MESSAGES_PER_USER", defaults.messages_per_user)?,
            spam_modulus: env_or("SIMULATED_SPAM_MODULUS", defaults.spam_modulus)?,
            max_latency: Duration::from_millis(env_or("SIMULATED_MAX_LATENCY_MS", 0u64)?),
            failure_rate: env_or("SIMULATED_FAILURE_RATE", defaults.failure_rate)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_space == 0 || self.spam_modulus == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SIMULATED_USER_SPACE / SIMULATED_SPAM_MODULUS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        // The highest user id is `user_space`; its messages must fit in u64.
        if self
            .user_space
            .checked_add(1)
            .and_then(|n| n.checked_mul(MESSAGE_ID_STRIDE))
            .is_none()
        {
            return Err(ConfigError::InvalidValue {
                key: "SIMULATED_USER_SPACE".to_string(),
                message: format!("{} overflows the message id range", self.user_space),
            });
        }
        if self.messages_per_user > MESSAGE_ID_STRIDE {
            return Err(ConfigError::InvalidValue {
                key: "SIMULATED_MESSAGES_PER_USER".to_string(),
                message: format!(
                    "{} exceeds the {MESSAGE_ID_STRIDE} ids reserved per user",
                    self.messages_per_user
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(ConfigError::InvalidValue {
                key: "SIMULATED_FAILURE_RATE".to_string(),
                message: format!("{} is outside [0, 1]", self.failure_rate),
            });
        }
        Ok(())
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(default),
    }
}

/// Implements all three service traits.
#[derive(Debug, Clone, Default)]
pub struct SimulatedServices {
    config: SimulatedConfig,
}

impl SimulatedServices {
    pub fn new(config: SimulatedConfig) -> Self {
        Self { config }
    }

    /// The user id `identifier` resolves to.
    pub fn user_id_for(&self, identifier: &str) -> u64 {
        let hash = fnv1a(identifier.trim().to_lowercase().as_bytes());
        (hash % self.config.user_space.max(1)).saturating_add(1)
    }

    /// Message ids owned by `user_id`, in store order. Empty when the ids
    /// would not fit in u64.
    pub fn messages_for(&self, user_id: u64) -> impl Iterator<Item = MessageId> + use<> {
        let count = self.config.messages_per_user.min(MESSAGE_ID_STRIDE);
        user_id
            .checked_mul(MESSAGE_ID_STRIDE)
            .and_then(|base| Some(base..base.checked_add(count)?))
            .into_iter()
            .flatten()
            .map(MessageId)
    }

    pub fn is_spam(&self, id: MessageId) -> bool {
        id.0 % self.config.spam_modulus.max(1) == 0
    }

    async fn simulate_call(&self, service: &str) -> Result<(), ServiceError> {
        let (delay, fail) = {
            let mut rng = rand::thread_rng();
            let delay = if self.config.max_latency.is_zero() {
                Duration::ZERO
            } else {
                rng.gen_range(Duration::ZERO..=self.config.max_latency)
            };
            (delay, rng.gen_bool(self.config.failure_rate.clamp(0.0, 1.0)))
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if fail {
            return Err(ServiceError::Unavailable {
                service: service.to_string(),
                reason: "simulated failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for SimulatedServices {
    async fn resolve_user(&self, identifier: &str) -> Result<User, ServiceError> {
        if identifier.trim().is_empty() {
            return Err(ServiceError::NotFound {
                entity: "user".to_string(),
                id: identifier.to_string(),
            });
        }
        self.simulate_call("user-directory").await?;

        let id = self.user_id_for(identifier);
        debug!(identifier, user_id = id, "Resolved user");
        Ok(User::new(id, format!("user{id}@example.com")))
    }
}

#[async_trait]
impl MessageStore for SimulatedServices {
    async fn fetch_messages(&self, users: &[User]) -> Result<Vec<MessageId>, ServiceError> {
        self.simulate_call("message-store").await?;
        Ok(users
            .iter()
            .flat_map(|user| self.messages_for(user.id))
            .collect())
    }
}

#[async_trait]
impl SpamClassifier for SimulatedServices {
    async fn has_spam(&self, id: MessageId) -> Result<bool, ServiceError> {
        self.simulate_call("spam-classifier").await?;
        Ok(self.is_spam(id))
    }
}

/// 64-bit FNV-1a. Stable across runs and toolchains.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, &b| (hash ^ u64::from(b)).wrapping_mul(PRIME))
}
