use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntegrationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Validation failed for {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("SMB transport error: {0}")]
    Transport(String),

    #[error("Reconnect exhausted for device {device} after {attempts} attempts")]
    ReconnectExhausted { device: String, attempts: u32 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No adapter registered for device type: {0}")]
    NoAdapter(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntegrationError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Transient errors are retried through the queue backoff or the pool's
    /// reconnect loop; everything else surfaces immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IntegrationError::Transport(_)
                | IntegrationError::Redis(_)
                | IntegrationError::Http(_)
                | IntegrationError::Timeout(_)
        )
    }
}

impl From<oculink_model::ModelError> for IntegrationError {
    fn from(err: oculink_model::ModelError) -> Self {
        IntegrationError::Validation {
            field: "model".to_string(),
            reason: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IntegrationError>;
