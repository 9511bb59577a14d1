//! Error types for the spam pipeline.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Failures reported by the external collaborators (user directory,
/// message store, spam classifier).
///
/// Every variant is item- or batch-scoped: the stage that sees one logs it,
/// drops the affected item(s) and keeps going.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("Service {service} unavailable: {reason}")]
    Unavailable { service: String, reason: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Service {service} timed out after {timeout:?}")]
    Timeout { service: String, timeout: Duration },
}

/// Why a stage stopped before draining its input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error("stage cancelled")]
    Cancelled,

    #[error("downstream queue disconnected")]
    Disconnected,
}

/// Structural failures of a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Stage {stage} panicked: {reason}")]
    StagePanicked { stage: String, reason: String },

    #[error("Stage {stage} failed: {source}")]
    StageFailed {
        stage: String,
        #[source]
        source: StageError,
    },

    #[error("Pipeline run cancelled")]
    Cancelled,

    #[error("Pipeline input closed before all items were sent")]
    InputClosed,
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
