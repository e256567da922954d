use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::sleep;

use super::command::{
    combined_output, exit_code_of, kill_tree_script, remote_pid_file, run_with_timeout,
    stderr_text, tracked_script, SPAWNED_STOP_GRACE,
};
use super::error::EnvironmentError;
use super::types::{
    EnvironmentHandle, EnvironmentKind, EnvironmentRecord, EnvironmentStatus, ExecOutcome,
    SessionContext, SpawnedCommand,
};
use super::ExecutionEnvironment;
use crate::domains::settings::DockerSettings;

pub const CONTAINER_WORKDIR: &str = "/workspace";
const CONTAINER_HOME: &str = "/home/node";
const CONTAINER_AUTH_DIR: &str = "/home/node/.claude";

const DAEMON_UNREACHABLE_MARKERS: &[&str] = &[
    "Cannot connect to the Docker daemon",
    "Is the docker daemon running",
    "error during connect",
];

/// Kind-specific part of a DOCKER environment record.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DockerRecordConfig {
    image: Option<String>,
    binary: Option<String>,
}

/// Runs each session in its own container driven through the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerEnvironment {
    environment_id: String,
    name: String,
    binary: String,
    image: String,
    auth_dir: Option<PathBuf>,
    readiness_attempts: u32,
    readiness_interval: Duration,
    stop_timeout_secs: u64,
    command_timeout: Duration,
}

impl DockerEnvironment {
    /// Environment used when a project has no record and its clone location
    /// policy asks for docker.
    pub fn from_settings(settings: &DockerSettings, command_timeout: Duration) -> Self {
        Self {
            environment_id: "default".to_string(),
            name: "docker".to_string(),
            binary: settings.binary.clone(),
            image: settings.image.clone(),
            auth_dir: None,
            readiness_attempts: settings.readiness_attempts,
            readiness_interval: settings.readiness_interval(),
            stop_timeout_secs: settings.stop_timeout_secs,
            command_timeout,
        }
    }

    pub fn from_record(
        record: &EnvironmentRecord,
        settings: &DockerSettings,
        command_timeout: Duration,
    ) -> Result<Self, EnvironmentError> {
        if record.kind != EnvironmentKind::Docker {
            return Err(EnvironmentError::invalid_config(
                "type",
                format!("environment '{}' is {}, not DOCKER", record.name, record.kind),
            ));
        }
        let config: DockerRecordConfig = if record.config.is_null() {
            DockerRecordConfig::default()
        } else {
            serde_json::from_value(record.config.clone())
                .map_err(|e| EnvironmentError::invalid_config("config", e))?
        };
        if let Some(image) = &config.image {
            if image.trim().is_empty() {
                return Err(EnvironmentError::invalid_config("image", "image must not be empty"));
            }
        }

        let mut env = Self::from_settings(settings, command_timeout);
        env.environment_id = record.id.clone();
        env.name = record.name.clone();
        env.auth_dir = record.auth_dir_path.clone();
        if let Some(image) = config.image {
            env.image = image;
        }
        if let Some(binary) = config.binary {
            env.binary = binary;
        }
        Ok(env)
    }

    pub fn with_auth_dir(mut self, auth_dir: Option<PathBuf>) -> Self {
        self.auth_dir = auth_dir;
        self
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    fn container_name(&self) -> String {
        let timestamp = chrono::Utc::now().timestamp();
        format!("claude-env-{}-{timestamp}", short_id(&self.environment_id))
    }

    pub fn home_volume_name(session_id: &str) -> String {
        format!("claudework-{}-home", short_id(session_id))
    }

    fn docker_handle(handle: &EnvironmentHandle) -> Result<(&str, &str, &str), EnvironmentError> {
        match handle {
            EnvironmentHandle::Docker {
                container_id,
                home_volume,
                workdir,
                ..
            } => Ok((container_id, home_volume, workdir)),
            other => Err(EnvironmentError::invalid_config(
                "handle",
                format!("{other} is not a docker container"),
            )),
        }
    }

    async fn docker<I, S>(&self, args: I, step: &str, limit: Duration) -> Result<Output, EnvironmentError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = Command::new(&self.binary);
        command.args(args);
        match run_with_timeout(command, step, limit).await {
            Err(EnvironmentError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(
                EnvironmentError::unavailable(&self.name, format!("docker binary '{}' not found", self.binary)),
            ),
            other => other,
        }
    }

    fn classify_failure(&self, output: &Output) -> EnvironmentError {
        let text = stderr_text(output);
        if is_daemon_unreachable(&text) {
            EnvironmentError::unavailable(&self.name, text)
        } else {
            EnvironmentError::CommandFailed { message: text }
        }
    }

    async fn ensure_daemon(&self) -> Result<(), EnvironmentError> {
        if which::which(&self.binary).is_err() {
            return Err(EnvironmentError::unavailable(
                &self.name,
                format!("docker binary '{}' not found", self.binary),
            ));
        }
        match self
            .docker(["info", "--format", "{{.ServerVersion}}"], "docker info", self.command_timeout)
            .await
        {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => Err(EnvironmentError::unavailable(&self.name, stderr_text(&output))),
            Err(EnvironmentError::Timeout { after, .. }) => Err(EnvironmentError::unavailable(
                &self.name,
                format!("docker info did not answer within {after:?}"),
            )),
            Err(e) => Err(e),
        }
    }

    async fn wait_until_running(&self, container: &str) -> bool {
        for attempt in 1..=self.readiness_attempts.max(1) {
            match self
                .docker(
                    ["inspect", "--format", "{{.State.Running}}", container],
                    "docker inspect",
                    self.command_timeout,
                )
                .await
            {
                Ok(output) if output.status.success() => {
                    if String::from_utf8_lossy(&output.stdout).trim() == "true" {
                        debug!("Container {container} ready after {attempt} attempt(s)");
                        return true;
                    }
                }
                Ok(output) => debug!("Readiness check for {container} failed: {}", stderr_text(&output)),
                Err(e) => debug!("Readiness check for {container} errored: {e}"),
            }
            sleep(self.readiness_interval).await;
        }
        false
    }

    async fn force_remove(&self, container: &str) {
        match self
            .docker(["rm", "-f", container], "docker rm", self.command_timeout)
            .await
        {
            Ok(output) if output.status.success() => debug!("Removed container {container}"),
            Ok(output) if is_missing_container(&stderr_text(&output)) => {}
            Ok(output) => warn!("Failed to remove container {container}: {}", stderr_text(&output)),
            Err(e) => warn!("Failed to remove container {container}: {e}"),
        }
    }

    fn run_args(&self, context: &SessionContext, container_name: &str, home_volume: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "-i".into(),
            "-t".into(),
            "--name".into(),
            container_name.into(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "-v".into(),
            format!("{}:{CONTAINER_WORKDIR}", context.worktree_path.display()),
            "-w".into(),
            CONTAINER_WORKDIR.into(),
            "-v".into(),
            format!("{home_volume}:{CONTAINER_HOME}"),
        ];
        if let Some(auth_dir) = &self.auth_dir {
            args.push("-v".into());
            args.push(format!("{}:{CONTAINER_AUTH_DIR}", auth_dir.display()));
        }
        let session_env = [
            ("CLAUDEWORK_SESSION_ID".to_string(), context.session_id.clone()),
            ("CLAUDEWORK_SESSION_NAME".to_string(), context.session_name.clone()),
        ];
        for (key, value) in context.env.iter().chain(session_env.iter()) {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(self.image.clone());
        args.extend(context.command.iter().cloned());
        args
    }
}

fn short_id(id: &str) -> String {
    id.chars().filter(|c| *c != '-').take(8).collect()
}

fn is_daemon_unreachable(text: &str) -> bool {
    DAEMON_UNREACHABLE_MARKERS.iter().any(|marker| text.contains(marker))
}

fn is_missing_container(text: &str) -> bool {
    text.contains("No such container") || text.contains("is not running")
}

#[async_trait]
impl ExecutionEnvironment for DockerEnvironment {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::Docker
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn start(&self, context: &SessionContext) -> Result<EnvironmentHandle, EnvironmentError> {
        if context.command.is_empty() {
            return Err(EnvironmentError::invalid_config("command", "command must not be empty"));
        }
        self.ensure_daemon().await?;

        let container_name = self.container_name();
        let home_volume = Self::home_volume_name(&context.session_id);
        let args = self.run_args(context, &container_name, &home_volume);

        info!(
            "Starting container {container_name} from {} for session '{}'",
            self.image, context.session_name
        );
        let output = match self.docker(&args, "docker run", self.command_timeout).await {
            Ok(output) => output,
            Err(e) => {
                self.force_remove(&container_name).await;
                return Err(e);
            }
        };
        if !output.status.success() {
            self.force_remove(&container_name).await;
            return Err(match self.classify_failure(&output) {
                EnvironmentError::CommandFailed { message } => {
                    EnvironmentError::start_failed(&self.name, message)
                }
                other => other,
            });
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if container_id.is_empty() {
            self.force_remove(&container_name).await;
            return Err(EnvironmentError::start_failed(&self.name, "docker run returned no container id"));
        }

        if !self.wait_until_running(&container_id).await {
            self.force_remove(&container_id).await;
            return Err(EnvironmentError::start_failed(
                &self.name,
                format!(
                    "container {container_name} did not become ready after {} attempts",
                    self.readiness_attempts
                ),
            ));
        }

        info!("Container {container_name} running as {container_id}");
        Ok(EnvironmentHandle::Docker {
            container_id,
            container_name,
            home_volume,
            workdir: CONTAINER_WORKDIR.to_string(),
        })
    }

    async fn stop(&self, handle: &EnvironmentHandle) -> Result<(), EnvironmentError> {
        let (container, _, _) = Self::docker_handle(handle)?;
        let stop_timeout = self.stop_timeout_secs.to_string();
        let limit = self.command_timeout + Duration::from_secs(self.stop_timeout_secs);

        match self
            .docker(["stop", "-t", stop_timeout.as_str(), container], "docker stop", limit)
            .await
        {
            Ok(output) if output.status.success() => return Ok(()),
            Ok(output) => {
                let text = stderr_text(&output);
                if is_missing_container(&text) {
                    debug!("Container {container} already gone");
                    return Ok(());
                }
                if is_daemon_unreachable(&text) {
                    return Err(EnvironmentError::unavailable(&self.name, text));
                }
                warn!("docker stop {container} failed, falling back to kill: {text}");
            }
            Err(EnvironmentError::Timeout { .. }) => {
                warn!("docker stop {container} timed out, falling back to kill");
            }
            Err(e) => return Err(e),
        }

        let output = self
            .docker(["kill", container], "docker kill", self.command_timeout)
            .await?;
        if output.status.success() || is_missing_container(&stderr_text(&output)) {
            Ok(())
        } else {
            Err(self.classify_failure(&output))
        }
    }

    async fn exec<'a>(
        &self,
        handle: &EnvironmentHandle,
        argv: &[String],
        cwd: Option<&'a Path>,
    ) -> ExecOutcome {
        let (container, _, workdir) = match Self::docker_handle(handle) {
            Ok(parts) => parts,
            Err(e) => {
                return ExecOutcome::Unavailable {
                    reason: e.to_string(),
                }
            }
        };
        let workdir = cwd
            .map(|dir| dir.display().to_string())
            .unwrap_or_else(|| workdir.to_string());
        let mut args = vec![
            "exec".to_string(),
            "-w".to_string(),
            workdir,
            container.to_string(),
        ];
        args.extend(argv.iter().cloned());

        match self.docker(&args, "docker exec", self.command_timeout).await {
            Ok(output) => {
                let text = stderr_text(&output);
                if !output.status.success() && is_daemon_unreachable(&text) {
                    return ExecOutcome::Unavailable { reason: text };
                }
                if !output.status.success() && text.contains("No such container") {
                    return ExecOutcome::Unavailable {
                        reason: format!("container {container} no longer exists"),
                    };
                }
                ExecOutcome::Completed {
                    exit_code: exit_code_of(&output.status),
                    output: combined_output(&output),
                }
            }
            Err(EnvironmentError::Timeout { after, .. }) => ExecOutcome::timed_out(after),
            Err(e) => ExecOutcome::Unavailable {
                reason: e.to_string(),
            },
        }
    }

    async fn status(&self, handle: &EnvironmentHandle) -> EnvironmentStatus {
        let Ok((container, _, _)) = Self::docker_handle(handle) else {
            return EnvironmentStatus::Unknown;
        };
        match self
            .docker(
                ["inspect", "--format", "{{.State.Status}}", container],
                "docker inspect",
                self.command_timeout,
            )
            .await
        {
            Ok(output) if output.status.success() => {
                match String::from_utf8_lossy(&output.stdout).trim() {
                    "running" | "restarting" | "paused" => EnvironmentStatus::Running,
                    "created" | "exited" | "dead" | "removing" => EnvironmentStatus::Stopped,
                    _ => EnvironmentStatus::Unknown,
                }
            }
            Ok(output) => {
                let text = stderr_text(&output);
                if text.contains("No such") {
                    EnvironmentStatus::Stopped
                } else {
                    EnvironmentStatus::Unknown
                }
            }
            Err(_) => EnvironmentStatus::Unknown,
        }
    }

    async fn spawn(&self, handle: &EnvironmentHandle, argv: &[String]) -> Result<SpawnedCommand, EnvironmentError> {
        let (container, _, workdir) = Self::docker_handle(handle)?;
        if argv.is_empty() {
            return Err(EnvironmentError::invalid_config("command", "command must not be empty"));
        }
        let pid_file = remote_pid_file();
        let mut command = Command::new(&self.binary);
        command
            .args(["exec", "-w", workdir, container, "sh", "-c"])
            .arg(tracked_script(workdir, argv, &pid_file))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EnvironmentError::unavailable(&self.name, format!("docker binary '{}' not found", self.binary))
            } else {
                EnvironmentError::Io(e)
            }
        })?;
        Ok(SpawnedCommand {
            child,
            remote_pid_file: Some(pid_file),
        })
    }

    async fn kill_spawned(&self, handle: &EnvironmentHandle, pid_file: &str) -> Result<(), EnvironmentError> {
        let (container, _, _) = Self::docker_handle(handle)?;
        let script = kill_tree_script(pid_file, SPAWNED_STOP_GRACE);
        let output = self
            .docker(
                ["exec", container, "sh", "-c", script.as_str()],
                "docker exec kill",
                self.command_timeout + SPAWNED_STOP_GRACE,
            )
            .await?;
        if output.status.success() || is_missing_container(&stderr_text(&output)) {
            Ok(())
        } else {
            Err(self.classify_failure(&output))
        }
    }

    async fn teardown(&self, handle: &EnvironmentHandle, keep_volumes: bool) -> Result<(), EnvironmentError> {
        let (container, home_volume, _) = Self::docker_handle(handle)?;
        let output = self
            .docker(["rm", "-f", container], "docker rm", self.command_timeout)
            .await?;
        if !output.status.success() && !is_missing_container(&stderr_text(&output)) {
            return Err(self.classify_failure(&output));
        }

        if keep_volumes {
            info!("Keeping volume {home_volume} for inspection");
            return Ok(());
        }
        match self
            .docker(["volume", "rm", "-f", home_volume], "docker volume rm", self.command_timeout)
            .await
        {
            Ok(output) if output.status.success() => debug!("Removed volume {home_volume}"),
            Ok(output) => warn!("Failed to remove volume {home_volume}: {}", stderr_text(&output)),
            Err(e) => warn!("Failed to remove volume {home_volume}: {e}"),
        }
        Ok(())
    }
}
