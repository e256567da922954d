use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::domains::git::GitTimeouts;

fn default_git_timeout_secs() -> u64 {
    30
}

fn default_git_clone_timeout_minutes() -> u64 {
    5
}

fn default_exec_timeout_secs() -> u64 {
    30
}

fn default_status_timeout_secs() -> u64 {
    5
}

fn default_stop_grace_period_ms() -> u64 {
    1500
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_name_generation_attempts() -> u32 {
    10
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DockerSettings {
    #[serde(default = "DockerSettings::default_binary")]
    pub binary: String,
    #[serde(default = "DockerSettings::default_image")]
    pub image: String,
    #[serde(default = "DockerSettings::default_readiness_attempts")]
    pub readiness_attempts: u32,
    #[serde(default = "DockerSettings::default_readiness_interval_ms")]
    pub readiness_interval_ms: u64,
    #[serde(default = "DockerSettings::default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

impl DockerSettings {
    fn default_binary() -> String {
        "docker".to_string()
    }

    fn default_image() -> String {
        "claude-code-sandboxed:latest".to_string()
    }

    fn default_readiness_attempts() -> u32 {
        30
    }

    fn default_readiness_interval_ms() -> u64 {
        1000
    }

    fn default_stop_timeout_secs() -> u64 {
        10
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            binary: Self::default_binary(),
            image: Self::default_image(),
            readiness_attempts: Self::default_readiness_attempts(),
            readiness_interval_ms: Self::default_readiness_interval_ms(),
            stop_timeout_secs: Self::default_stop_timeout_secs(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SshSettings {
    #[serde(default = "SshSettings::default_binary")]
    pub binary: String,
    #[serde(default = "SshSettings::default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "SshSettings::default_control_persist_secs")]
    pub control_persist_secs: u64,
    /// Directory for ControlMaster sockets; the system temp dir when unset.
    #[serde(default)]
    pub control_dir: Option<PathBuf>,
}

impl SshSettings {
    fn default_binary() -> String {
        "ssh".to_string()
    }

    fn default_connect_timeout_secs() -> u64 {
        10
    }

    fn default_control_persist_secs() -> u64 {
        60
    }

    pub fn control_dir(&self) -> PathBuf {
        self.control_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("claudework-ssh"))
    }
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            binary: Self::default_binary(),
            connect_timeout_secs: Self::default_connect_timeout_secs(),
            control_persist_secs: Self::default_control_persist_secs(),
            control_dir: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub worktree_root: Option<PathBuf>,
    #[serde(default = "default_git_timeout_secs")]
    pub git_timeout_secs: u64,
    #[serde(default = "default_git_clone_timeout_minutes")]
    pub git_clone_timeout_minutes: u64,
    #[serde(default = "default_exec_timeout_secs")]
    pub exec_timeout_secs: u64,
    #[serde(default = "default_status_timeout_secs")]
    pub status_timeout_secs: u64,
    #[serde(default = "default_stop_grace_period_ms")]
    pub stop_grace_period_ms: u64,
    #[serde(default = "default_agent_command")]
    pub agent_command: String,
    #[serde(default = "default_name_generation_attempts")]
    pub name_generation_attempts: u32,
    /// Leaves per-session Docker volumes behind on delete for inspection.
    #[serde(default)]
    pub debug_mode_keep_volumes: bool,
    /// Minutes without activity before a running session is stopped; 0 disables.
    #[serde(default)]
    pub idle_timeout_minutes: u64,
    #[serde(default)]
    pub docker: DockerSettings,
    #[serde(default)]
    pub ssh: SshSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            worktree_root: None,
            git_timeout_secs: default_git_timeout_secs(),
            git_clone_timeout_minutes: default_git_clone_timeout_minutes(),
            exec_timeout_secs: default_exec_timeout_secs(),
            status_timeout_secs: default_status_timeout_secs(),
            stop_grace_period_ms: default_stop_grace_period_ms(),
            agent_command: default_agent_command(),
            name_generation_attempts: default_name_generation_attempts(),
            debug_mode_keep_volumes: false,
            idle_timeout_minutes: 0,
            docker: DockerSettings::default(),
            ssh: SshSettings::default(),
        }
    }
}

impl Settings {
    pub fn worktree_root(&self) -> PathBuf {
        self.worktree_root.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("claudework")
                .join("worktrees")
        })
    }

    pub fn git_timeouts(&self) -> GitTimeouts {
        GitTimeouts {
            command: Duration::from_secs(self.git_timeout_secs),
            network: Duration::from_secs(self.git_clone_timeout_minutes * 60),
        }
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_secs)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }

    /// The agent command line split into argv.
    pub fn agent_argv(&self) -> Vec<String> {
        shell_words::split(&self.agent_command)
            .unwrap_or_else(|_| vec![self.agent_command.clone()])
    }
}
