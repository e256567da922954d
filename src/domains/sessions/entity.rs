use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::domains::environments::{CloneLocation, EnvironmentHandle, EnvironmentKind};
use crate::domains::git::WorktreeTarget;
use crate::errors::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Running,
    WaitingInput,
    Completed,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Running => "running",
            SessionStatus::WaitingInput => "waiting_input",
            SessionStatus::Completed => "completed",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        }
    }

    /// No agent is expected to be alive in these states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Stopped | SessionStatus::Error
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Running | SessionStatus::WaitingInput)
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (_, Error) => true,
            (Initializing, Running | Completed | Stopped) => true,
            (Running, WaitingInput | Completed | Stopped) => true,
            (WaitingInput, Running | Completed | Stopped) => true,
            (Completed | Stopped | Error, Initializing) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(SessionStatus::Initializing),
            "running" => Ok(SessionStatus::Running),
            "waiting_input" => Ok(SessionStatus::WaitingInput),
            "completed" => Ok(SessionStatus::Completed),
            "stopped" => Ok(SessionStatus::Stopped),
            "error" => Ok(SessionStatus::Error),
            _ => Err(format!("Invalid session status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub remote_url: Option<String>,
    /// Explicit sandbox; when unset `clone_location` decides per session.
    #[serde(default)]
    pub environment_id: Option<String>,
    #[serde(default)]
    pub clone_location: CloneLocation,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub branch_name: String,
    // Branch the session was cut from; rebase and merge target it
    pub base_branch: String,
    pub worktree_path: PathBuf,
    pub status: SessionStatus,
    #[serde(default)]
    pub environment_id: Option<String>,
    #[serde(default)]
    pub environment_kind: Option<EnvironmentKind>,
    #[serde(default)]
    pub handle: Option<EnvironmentHandle>,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub process_id: Option<u32>,
    #[serde(default)]
    pub model: Option<String>,
    /// Agent argv; empty means the configured agent command.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub rebase_in_progress: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
}

impl Session {
    pub fn target(&self, project: &Project) -> WorktreeTarget {
        WorktreeTarget {
            repo_path: project.path.clone(),
            worktree_path: self.worktree_path.clone(),
            branch_name: self.branch_name.clone(),
            base_branch: self.base_branch.clone(),
        }
    }

    /// Moves to `next`, clearing the recorded error unless entering `Error`.
    pub fn transition(&mut self, next: SessionStatus) -> CoreResult<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                session_id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next != SessionStatus::Error {
            self.error = None;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn fail(&mut self, cause: impl ToString) {
        self.status = SessionStatus::Error;
        self.error = Some(cause.to_string());
        self.updated_at = Utc::now();
    }

    pub fn attach(&mut self, handle: &EnvironmentHandle) {
        self.environment_kind = Some(handle.kind());
        self.container_id = handle.container_id().map(str::to_string);
        self.process_id = handle.process_id();
        self.handle = Some(handle.clone());
    }

    pub fn detach(&mut self) {
        self.handle = None;
        self.container_id = None;
        self.process_id = None;
    }

    pub fn touch(&mut self) {
        let now = Utc::now();
        self.last_activity = Some(now);
        self.updated_at = now;
    }
}

/// Input for [`SessionOrchestrator::create`](super::SessionOrchestrator::create).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub project_id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Branch to start from; the project's default branch when unset.
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Agent command line overriding the configured one.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(status: SessionStatus) -> Session {
        let now = Utc::now();
        Session {
            id: "s1".into(),
            project_id: "p1".into(),
            name: "brave-otter".into(),
            branch_name: "session/brave-otter".into(),
            base_branch: "main".into(),
            worktree_path: PathBuf::from("/tmp/wt"),
            status,
            environment_id: None,
            environment_kind: None,
            handle: None,
            container_id: None,
            process_id: None,
            model: None,
            command: vec![],
            env: vec![],
            error: None,
            rebase_in_progress: false,
            created_at: now,
            updated_at: now,
            last_activity: None,
        }
    }

    #[test]
    fn running_and_waiting_input_loop() {
        let mut s = session(SessionStatus::Initializing);
        s.transition(SessionStatus::Running).unwrap();
        s.transition(SessionStatus::WaitingInput).unwrap();
        s.transition(SessionStatus::Running).unwrap();
        s.transition(SessionStatus::Completed).unwrap();
        assert!(s.status.is_terminal());
    }

    #[test]
    fn terminal_states_only_restart_through_initializing() {
        let mut s = session(SessionStatus::Completed);
        let err = s.transition(SessionStatus::Running).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        s.transition(SessionStatus::Initializing).unwrap();
    }

    #[test]
    fn error_reachable_from_anywhere_and_cleared_on_restart() {
        for status in [
            SessionStatus::Initializing,
            SessionStatus::Running,
            SessionStatus::WaitingInput,
            SessionStatus::Completed,
        ] {
            assert!(status.can_transition_to(SessionStatus::Error));
        }
        let mut s = session(SessionStatus::Running);
        s.fail("docker daemon unreachable");
        assert_eq!(s.error.as_deref(), Some("docker daemon unreachable"));
        s.transition(SessionStatus::Initializing).unwrap();
        assert!(s.error.is_none());
    }

    #[test]
    fn status_uses_snake_case() {
        assert_eq!(
            serde_json::to_value(SessionStatus::WaitingInput).unwrap(),
            "waiting_input"
        );
        assert_eq!(
            "waiting_input".parse::<SessionStatus>().unwrap(),
            SessionStatus::WaitingInput
        );
    }

    #[test]
    fn attach_records_handle_identity() {
        let mut s = session(SessionStatus::Initializing);
        s.attach(&EnvironmentHandle::Docker {
            container_id: "c1".into(),
            container_name: "claude-env-x-1".into(),
            home_volume: "v".into(),
            workdir: "/workspace".into(),
        });
        assert_eq!(s.container_id.as_deref(), Some("c1"));
        assert_eq!(s.environment_kind, Some(EnvironmentKind::Docker));
        s.detach();
        assert!(s.handle.is_none());
    }
}
