use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EnvironmentKind {
    Host,
    Docker,
    Ssh,
}

impl EnvironmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentKind::Host => "HOST",
            EnvironmentKind::Docker => "DOCKER",
            EnvironmentKind::Ssh => "SSH",
        }
    }
}

impl fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvironmentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HOST" => Ok(EnvironmentKind::Host),
            "DOCKER" => Ok(EnvironmentKind::Docker),
            "SSH" => Ok(EnvironmentKind::Ssh),
            other => Err(format!("Unknown environment type: {other}")),
        }
    }
}

/// Where sessions of a project without an explicit environment run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloneLocation {
    #[default]
    Host,
    Docker,
}

impl FromStr for CloneLocation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "host" => Ok(CloneLocation::Host),
            "docker" => Ok(CloneLocation::Docker),
            other => Err(format!("Unknown clone location: {other}")),
        }
    }
}

/// Stored description of a sandbox. The kind is fixed at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EnvironmentKind,
    #[serde(default)]
    pub description: Option<String>,
    /// Free-form, kind-specific settings (image for Docker, host for SSH).
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub auth_dir_path: Option<PathBuf>,
    #[serde(default)]
    pub is_default: bool,
}

/// What a started sandbox hands back; enough to stop or query it later,
/// including from another process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvironmentHandle {
    Host {
        pid: u32,
        workdir: PathBuf,
    },
    Docker {
        container_id: String,
        container_name: String,
        home_volume: String,
        workdir: String,
    },
    Ssh {
        destination: String,
        remote_pid: u32,
        workdir: String,
    },
}

impl EnvironmentHandle {
    pub fn kind(&self) -> EnvironmentKind {
        match self {
            EnvironmentHandle::Host { .. } => EnvironmentKind::Host,
            EnvironmentHandle::Docker { .. } => EnvironmentKind::Docker,
            EnvironmentHandle::Ssh { .. } => EnvironmentKind::Ssh,
        }
    }

    pub fn process_id(&self) -> Option<u32> {
        match self {
            EnvironmentHandle::Host { pid, .. } => Some(*pid),
            EnvironmentHandle::Ssh { remote_pid, .. } => Some(*remote_pid),
            EnvironmentHandle::Docker { .. } => None,
        }
    }

    pub fn container_id(&self) -> Option<&str> {
        match self {
            EnvironmentHandle::Docker { container_id, .. } => Some(container_id),
            _ => None,
        }
    }
}

impl fmt::Display for EnvironmentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentHandle::Host { pid, .. } => write!(f, "host pid {pid}"),
            EnvironmentHandle::Docker { container_name, .. } => {
                write!(f, "container {container_name}")
            }
            EnvironmentHandle::Ssh {
                destination,
                remote_pid,
                ..
            } => write!(f, "{destination} pid {remote_pid}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    Running,
    Stopped,
    Unknown,
}

/// Everything a backend needs to start the long-lived agent of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: String,
    pub session_name: String,
    pub worktree_path: PathBuf,
    pub branch_name: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// A command started next to the agent by `ExecutionEnvironment::spawn`.
#[derive(Debug)]
pub struct SpawnedCommand {
    pub child: tokio::process::Child,
    /// File inside the sandbox holding the pid of the command's process
    /// tree. Set when the command outlives a kill of the local client.
    pub remote_pid_file: Option<String>,
}

/// Result of a one-shot command inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecOutcome {
    Completed { exit_code: i32, output: String },
    Unavailable { reason: String },
    TimedOut { after_secs: u64 },
}

impl ExecOutcome {
    pub fn timed_out(after: Duration) -> Self {
        ExecOutcome::TimedOut {
            after_secs: after.as_secs(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecOutcome::Completed { exit_code: 0, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_uses_type_field() {
        let record: EnvironmentRecord = serde_json::from_value(serde_json::json!({
            "id": "env-1",
            "name": "sandbox",
            "type": "DOCKER",
            "config": {"image": "custom:latest"}
        }))
        .unwrap();
        assert_eq!(record.kind, EnvironmentKind::Docker);
        assert!(!record.is_default);
        assert!(record.auth_dir_path.is_none());
    }

    #[test]
    fn handle_roundtrips_through_json() {
        let handle = EnvironmentHandle::Docker {
            container_id: "abc".into(),
            container_name: "claude-env-1234-1".into(),
            home_volume: "claudework-abcd-home".into(),
            workdir: "/workspace".into(),
        };
        let value = serde_json::to_value(&handle).unwrap();
        assert_eq!(value["kind"], "docker");
        let back: EnvironmentHandle = serde_json::from_value(value).unwrap();
        assert_eq!(back, handle);
        assert_eq!(back.container_id(), Some("abc"));
        assert_eq!(back.process_id(), None);
    }

    #[test]
    fn parses_kinds_case_insensitively() {
        assert_eq!("ssh".parse::<EnvironmentKind>().unwrap(), EnvironmentKind::Ssh);
        assert!("k8s".parse::<EnvironmentKind>().is_err());
        assert_eq!("Docker".parse::<CloneLocation>().unwrap(), CloneLocation::Docker);
    }
}
