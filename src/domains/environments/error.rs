use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvironmentError {
    /// The backing daemon or remote endpoint cannot be reached.
    #[error("environment '{environment}' unavailable: {reason}")]
    Unavailable { environment: String, reason: String },

    #[error("invalid environment configuration '{field}': {message}")]
    InvalidConfig { field: String, message: String },

    #[error("{step} timed out after {after:?}")]
    Timeout { step: String, after: Duration },

    #[error("failed to start in '{environment}': {message}")]
    StartFailed { environment: String, message: String },

    #[error("environment command failed: {message}")]
    CommandFailed { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EnvironmentError {
    pub fn unavailable(environment: &str, reason: impl ToString) -> Self {
        EnvironmentError::Unavailable {
            environment: environment.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_config(field: &str, message: impl ToString) -> Self {
        EnvironmentError::InvalidConfig {
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    pub fn start_failed(environment: &str, message: impl ToString) -> Self {
        EnvironmentError::StartFailed {
            environment: environment.to_string(),
            message: message.to_string(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, EnvironmentError::Unavailable { .. })
    }
}
