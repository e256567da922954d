use serde::Serialize;
use thiserror::Error;

use crate::domains::environments::EnvironmentError;
use crate::domains::git::runner::{GitCommandError, GitFailureKind};

/// Error surfaced by every public service operation.
///
/// The variants follow the taxonomy callers react to: validation problems are
/// rejected before any side effect, missing records are never confused with
/// general failures, conflicts carry the offending paths, and an unreachable
/// sandbox is distinguishable from everything else so a caller can retry.
#[derive(Debug, Error, Serialize, Clone, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum CoreError {
    #[error("Invalid input for '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: String, id: String },

    #[error("{message}")]
    Conflict { message: String, paths: Vec<String> },

    #[error("Environment '{environment}' is unavailable: {reason}")]
    EnvironmentUnavailable { environment: String, reason: String },

    #[error("{step} timed out after {after_secs} seconds")]
    Timeout { step: String, after_secs: u64 },

    #[error("Git {kind} failure: {message}")]
    Git { kind: GitFailureKind, message: String },

    #[error("Session '{session_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        session_id: String,
        from: String,
        to: String,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CoreError {
    pub fn validation(field: &str, message: impl ToString) -> Self {
        CoreError::Validation {
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    pub fn not_found(kind: &str, id: impl ToString) -> Self {
        CoreError::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    pub fn conflict(message: impl ToString, paths: Vec<String>) -> Self {
        CoreError::Conflict {
            message: message.to_string(),
            paths,
        }
    }

    pub fn timeout(step: &str, after: std::time::Duration) -> Self {
        CoreError::Timeout {
            step: step.to_string(),
            after_secs: after.as_secs(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound { .. })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, CoreError::EnvironmentUnavailable { .. })
    }

    /// Status code the HTTP layer is expected to answer with.
    pub fn http_status_hint(&self) -> u16 {
        match self {
            CoreError::Validation { .. } | CoreError::InvalidTransition { .. } => 400,
            CoreError::NotFound { .. } => 404,
            CoreError::Conflict { .. } => 409,
            CoreError::EnvironmentUnavailable { .. } => 503,
            CoreError::Timeout { .. } => 504,
            CoreError::Git { kind, .. } => match kind {
                GitFailureKind::NotARepository => 400,
                GitFailureKind::AccessDenied => 403,
                GitFailureKind::Conflict => 409,
                GitFailureKind::Generic => 500,
            },
            CoreError::Internal { .. } => 500,
        }
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(core) = err.downcast_ref::<CoreError>() {
            return core.clone();
        }
        if let Some(git) = err.downcast_ref::<GitCommandError>() {
            return CoreError::from(git.clone());
        }
        log::error!("Internal error: {err:#}");
        CoreError::Internal {
            message: format!("{err:#}"),
        }
    }
}

impl From<GitCommandError> for CoreError {
    fn from(err: GitCommandError) -> Self {
        match err {
            GitCommandError::TimedOut { step, after } => CoreError::timeout(&step, after),
            GitCommandError::Failed { kind, message, .. } => CoreError::Git { kind, message },
            GitCommandError::Spawn { message } => CoreError::Internal { message },
        }
    }
}

impl From<EnvironmentError> for CoreError {
    fn from(err: EnvironmentError) -> Self {
        match err {
            EnvironmentError::Unavailable {
                environment,
                reason,
            } => CoreError::EnvironmentUnavailable {
                environment,
                reason,
            },
            EnvironmentError::InvalidConfig { field, message } => {
                CoreError::Validation { field, message }
            }
            EnvironmentError::Timeout { step, after } => CoreError::timeout(&step, after),
            other => CoreError::Internal {
                message: other.to_string(),
            },
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn serializes_with_type_tag() {
        let err = CoreError::conflict("Rebase conflict", vec!["a.txt".into()]);
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["type"], "Conflict");
        assert_eq!(value["data"]["paths"][0], "a.txt");
    }

    #[test]
    fn timeout_message_names_the_step() {
        let err = CoreError::timeout("git clone", Duration::from_secs(300));
        assert_eq!(err.to_string(), "git clone timed out after 300 seconds");
        assert_eq!(err.http_status_hint(), 504);
    }

    #[test]
    fn anyhow_roundtrip_preserves_typed_error() {
        let original = CoreError::not_found("Session", "abc");
        let wrapped = anyhow::Error::new(original.clone());
        let restored = CoreError::from(wrapped);
        assert_eq!(restored, original);
        assert!(restored.is_not_found());
    }

    #[test]
    fn environment_unavailable_maps_to_503() {
        let err = CoreError::from(EnvironmentError::Unavailable {
            environment: "docker".into(),
            reason: "daemon not running".into(),
        });
        assert!(err.is_unavailable());
        assert_eq!(err.http_status_hint(), 503);
    }

    #[test]
    fn git_failures_keep_their_classification() {
        let err = CoreError::from(GitCommandError::Failed {
            kind: GitFailureKind::NotARepository,
            message: "fatal: not a git repository".into(),
            exit_code: Some(128),
        });
        assert_eq!(err.http_status_hint(), 400);
        assert!(matches!(
            err,
            CoreError::Git {
                kind: GitFailureKind::NotARepository,
                ..
            }
        ));
    }
}
