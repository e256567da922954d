use serde::{Deserialize, Serialize};

/// Outcome of a rebase or merge. Conflicts are data, not errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitOperationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

impl GitOperationResult {
    pub fn succeeded(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn committed(message: impl Into<String>, commit: String) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            commit: Some(commit),
            ..Self::default()
        }
    }

    pub fn conflicted(conflicts: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            conflicts: Some(conflicts),
            message: Some(message.into()),
            commit: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn conflict_paths(&self) -> &[String] {
        self.conflicts.as_deref().unwrap_or_default()
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflict_paths().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeState {
    pub has_conflicts: bool,
    pub conflicting_paths: Vec<String>,
    pub is_up_to_date: bool,
}
