//! Error taxonomy for pipeline definitions, configuration and result storage.
//!
//! Stage failures are not errors: they are recorded as
//! [`FailureReason`](crate::result::FailureReason) values inside a
//! [`PipelineResult`](crate::result::PipelineResult).

/// Errors raised while loading, validating or persisting pipelines.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    #[error("invalid poll target: {0}")]
    InvalidPollTarget(String),

    #[error("unknown pipeline: {0}")]
    UnknownPipeline(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse pipeline file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
