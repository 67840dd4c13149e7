use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;
pub type PaymentResult<T> = std::result::Result<T, PaymentError>;

/// Stages of the per-message pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Decode,
    Validate,
    Process,
    Notify,
    Archive,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Decode => "decode",
            Stage::Validate => "validate",
            Stage::Process => "process",
            Stage::Notify => "notify",
            Stage::Archive => "archive",
        };
        f.write_str(name)
    }
}

/// Failures reported by the payment use-case.
#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Repository error: {0}")]
    RepositoryError(String),
    #[error("Payment rejected: {0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Channel error: {0}")]
    Channel(String),
    #[error("Declaration error for queue '{queue}': {reason}")]
    Declaration { queue: String, reason: String },
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Processing error: {0}")]
    Processing(#[from] PaymentError),
    #[error("Publish error on queue '{queue}': {reason}")]
    Publish { queue: String, reason: String },
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Acknowledgement error: {0}")]
    Acknowledgement(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    /// Broker-layer failures end the running service and are retried by the
    /// supervisor; everything else is contained within a single message.
    pub fn is_broker_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Connection(_)
                | PipelineError::Channel(_)
                | PipelineError::Declaration { .. }
        )
    }

    pub fn publish(queue: &str, reason: impl fmt::Display) -> Self {
        PipelineError::Publish {
            queue: queue.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn declaration(queue: &str, reason: impl fmt::Display) -> Self {
        PipelineError::Declaration {
            queue: queue.to_string(),
            reason: reason.to_string(),
        }
    }
}
