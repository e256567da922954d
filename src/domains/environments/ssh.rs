use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::process::Command;

use super::command::{
    combined_output, exit_code_of, kill_tree_script, remote_pid_file, run_with_timeout,
    stderr_text, tracked_script,
};
use super::error::EnvironmentError;
use super::types::{
    EnvironmentHandle, EnvironmentKind, EnvironmentRecord, EnvironmentStatus, ExecOutcome,
    SessionContext, SpawnedCommand,
};
use super::ExecutionEnvironment;
use crate::domains::settings::SshSettings;

/// ssh reserves 255 for its own connection failures.
const SSH_CONNECTION_FAILED: i32 = 255;

#[derive(Debug, Deserialize)]
struct SshRecordConfig {
    host: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    identity_file: Option<PathBuf>,
    /// Remote directory the worktree is reachable at; defaults to the local path.
    #[serde(default)]
    workdir: Option<String>,
}

/// Runs sessions on a remote host. Connections are multiplexed through an
/// ssh ControlMaster socket that ssh re-creates whenever it has gone away.
#[derive(Debug, Clone)]
pub struct SshEnvironment {
    name: String,
    binary: String,
    destination: String,
    port: Option<u16>,
    identity_file: Option<PathBuf>,
    workdir: Option<String>,
    connect_timeout_secs: u64,
    control_persist_secs: u64,
    control_dir: PathBuf,
    command_timeout: Duration,
    stop_grace: Duration,
}

impl SshEnvironment {
    pub fn from_record(
        record: &EnvironmentRecord,
        settings: &SshSettings,
        command_timeout: Duration,
        stop_grace: Duration,
    ) -> Result<Self, EnvironmentError> {
        if record.kind != EnvironmentKind::Ssh {
            return Err(EnvironmentError::invalid_config(
                "type",
                format!("environment '{}' is {}, not SSH", record.name, record.kind),
            ));
        }
        let config: SshRecordConfig = serde_json::from_value(record.config.clone())
            .map_err(|e| EnvironmentError::invalid_config("config", e))?;
        if config.host.trim().is_empty() {
            return Err(EnvironmentError::invalid_config("host", "host must not be empty"));
        }
        let destination = match &config.user {
            Some(user) if !user.is_empty() => format!("{user}@{}", config.host),
            _ => config.host.clone(),
        };

        Ok(Self {
            name: record.name.clone(),
            binary: settings.binary.clone(),
            destination,
            port: config.port,
            identity_file: config.identity_file,
            workdir: config.workdir,
            connect_timeout_secs: settings.connect_timeout_secs,
            control_persist_secs: settings.control_persist_secs,
            control_dir: settings.control_dir(),
            command_timeout,
            stop_grace,
        })
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}/%C", self.control_dir.display()),
            "-o".to_string(),
            format!("ControlPersist={}", self.control_persist_secs),
        ];
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(self.destination.clone());
        args
    }

    fn command_for(&self, script: &str) -> Command {
        if let Err(e) = std::fs::create_dir_all(&self.control_dir) {
            warn!(
                "Failed to create ssh control directory {}: {e}",
                self.control_dir.display()
            );
        }
        let mut command = Command::new(&self.binary);
        command.args(self.ssh_args()).arg(script);
        command
    }

    async fn remote(&self, script: &str, step: &str, limit: Duration) -> Result<Output, EnvironmentError> {
        debug!("{step} on {}: {script}", self.destination);
        match run_with_timeout(self.command_for(script), step, limit).await {
            Ok(output) if output.status.code() == Some(SSH_CONNECTION_FAILED) => Err(
                EnvironmentError::unavailable(&self.name, stderr_text(&output)),
            ),
            Err(EnvironmentError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(
                EnvironmentError::unavailable(&self.name, format!("ssh binary '{}' not found", self.binary)),
            ),
            other => other,
        }
    }

    fn ssh_handle(handle: &EnvironmentHandle) -> Result<(u32, &str), EnvironmentError> {
        match handle {
            EnvironmentHandle::Ssh {
                remote_pid, workdir, ..
            } => Ok((*remote_pid, workdir)),
            other => Err(EnvironmentError::invalid_config(
                "handle",
                format!("{other} is not a remote process"),
            )),
        }
    }

    fn remote_workdir(&self, context: &SessionContext) -> String {
        self.workdir
            .clone()
            .unwrap_or_else(|| context.worktree_path.display().to_string())
    }
}

fn start_script(workdir: &str, context: &SessionContext) -> String {
    let mut script = format!("cd {} || exit 1; ", shell_words::quote(workdir));
    let session_env = [
        ("CLAUDEWORK_SESSION_ID".to_string(), context.session_id.clone()),
        ("CLAUDEWORK_SESSION_NAME".to_string(), context.session_name.clone()),
    ];
    for (key, value) in context.env.iter().chain(session_env.iter()) {
        script.push_str(&format!("export {key}={}; ", shell_words::quote(value)));
    }
    script.push_str(&format!(
        "nohup {} >/dev/null 2>&1 </dev/null & echo $!",
        shell_words::join(&context.command)
    ));
    script
}

fn in_dir(workdir: &str, argv: &[String]) -> String {
    format!("cd {} && {}", shell_words::quote(workdir), shell_words::join(argv))
}

#[async_trait]
impl ExecutionEnvironment for SshEnvironment {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::Ssh
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn start(&self, context: &SessionContext) -> Result<EnvironmentHandle, EnvironmentError> {
        if context.command.is_empty() {
            return Err(EnvironmentError::invalid_config("command", "command must not be empty"));
        }
        let workdir = self.remote_workdir(context);
        let output = self
            .remote(&start_script(&workdir, context), "ssh start", self.command_timeout)
            .await
            .map_err(|e| match e {
                EnvironmentError::Timeout { after, .. } => EnvironmentError::unavailable(
                    &self.name,
                    format!("no answer from {} within {after:?}", self.destination),
                ),
                other => other,
            })?;
        if !output.status.success() {
            return Err(EnvironmentError::start_failed(&self.name, stderr_text(&output)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let remote_pid = stdout
            .lines()
            .last()
            .and_then(|line| line.trim().parse::<u32>().ok())
            .ok_or_else(|| {
                EnvironmentError::start_failed(&self.name, format!("could not read remote pid from '{}'", stdout.trim()))
            })?;

        info!(
            "Started remote agent for session '{}' on {} with pid {remote_pid}",
            context.session_name, self.destination
        );
        Ok(EnvironmentHandle::Ssh {
            destination: self.destination.clone(),
            remote_pid,
            workdir,
        })
    }

    async fn stop(&self, handle: &EnvironmentHandle) -> Result<(), EnvironmentError> {
        let (pid, _) = Self::ssh_handle(handle)?;
        let ticks = (self.stop_grace.as_millis() / 100).max(1);
        let script = format!(
            "kill -TERM {pid} 2>/dev/null || exit 0; i=0; \
             while kill -0 {pid} 2>/dev/null && [ $i -lt {ticks} ]; do sleep 0.1; i=$((i+1)); done; \
             kill -KILL {pid} 2>/dev/null; exit 0"
        );
        let output = self
            .remote(&script, "ssh stop", self.command_timeout + self.stop_grace)
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(EnvironmentError::CommandFailed {
                message: stderr_text(&output),
            })
        }
    }

    async fn exec<'a>(
        &self,
        handle: &EnvironmentHandle,
        argv: &[String],
        cwd: Option<&'a Path>,
    ) -> ExecOutcome {
        let workdir = match (cwd, Self::ssh_handle(handle)) {
            (Some(dir), _) => dir.display().to_string(),
            (None, Ok((_, dir))) => dir.to_string(),
            (None, Err(e)) => {
                return ExecOutcome::Unavailable {
                    reason: e.to_string(),
                }
            }
        };
        match self
            .remote(&in_dir(&workdir, argv), "ssh exec", self.command_timeout)
            .await
        {
            Ok(output) => ExecOutcome::Completed {
                exit_code: exit_code_of(&output.status),
                output: combined_output(&output),
            },
            Err(EnvironmentError::Timeout { after, .. }) => ExecOutcome::timed_out(after),
            Err(e) => ExecOutcome::Unavailable {
                reason: e.to_string(),
            },
        }
    }

    async fn status(&self, handle: &EnvironmentHandle) -> EnvironmentStatus {
        let Ok((pid, _)) = Self::ssh_handle(handle) else {
            return EnvironmentStatus::Unknown;
        };
        match self
            .remote(&format!("kill -0 {pid} 2>/dev/null"), "ssh status", self.command_timeout)
            .await
        {
            Ok(output) if output.status.success() => EnvironmentStatus::Running,
            Ok(_) => EnvironmentStatus::Stopped,
            Err(e) => {
                debug!("Status of {handle} unknown: {e}");
                EnvironmentStatus::Unknown
            }
        }
    }

    async fn spawn(&self, handle: &EnvironmentHandle, argv: &[String]) -> Result<SpawnedCommand, EnvironmentError> {
        let (_, workdir) = Self::ssh_handle(handle)?;
        if argv.is_empty() {
            return Err(EnvironmentError::invalid_config("command", "command must not be empty"));
        }
        let pid_file = remote_pid_file();
        let mut command = self.command_for(&tracked_script(workdir, argv, &pid_file));
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EnvironmentError::unavailable(&self.name, format!("ssh binary '{}' not found", self.binary))
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
        Self::ssh_handle(handle)?;
        let output = self
            .remote(
                &kill_tree_script(pid_file, self.stop_grace),
                "ssh kill",
                self.command_timeout + self.stop_grace,
            )
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(EnvironmentError::CommandFailed {
                message: stderr_text(&output),
            })
        }
    }

    async fn teardown(&self, handle: &EnvironmentHandle, _keep_volumes: bool) -> Result<(), EnvironmentError> {
        self.stop(handle).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domains::environments::command::write_fake_binary;
    use tempfile::TempDir;

    /// Stands in for ssh by running the remote script locally.
    const LOCAL_SSH: &str = r#"echo "$@" >> "$(dirname "$0")/calls.log"
for last; do :; done
exec sh -c "$last""#;

    const UNREACHABLE_SSH: &str = r#"echo "ssh: connect to host build-box port 22: Connection refused" >&2
exit 255"#;

    fn record(config: serde_json::Value) -> EnvironmentRecord {
        EnvironmentRecord {
            id: "env-ssh".into(),
            name: "build-box".into(),
            kind: EnvironmentKind::Ssh,
            description: None,
            config,
            auth_dir_path: None,
            is_default: false,
        }
    }

    fn environment(temp: &TempDir, body: &str) -> SshEnvironment {
        let binary = write_fake_binary(temp.path(), "ssh", body);
        let settings = SshSettings {
            binary: binary.display().to_string(),
            control_dir: Some(temp.path().join("control")),
            ..SshSettings::default()
        };
        SshEnvironment::from_record(
            &record(serde_json::json!({"host": "build-box", "user": "dev", "port": 2222})),
            &settings,
            Duration::from_secs(5),
            Duration::from_millis(300),
        )
        .unwrap()
    }

    fn context(dir: &Path, command: &[&str]) -> SessionContext {
        SessionContext {
            session_id: "session-1".into(),
            session_name: "brave-otter".into(),
            worktree_path: dir.to_path_buf(),
            branch_name: "session/brave-otter".into(),
            command: command.iter().map(|s| s.to_string()).collect(),
            env: vec![("GREETING".into(), "hello world".into())],
        }
    }

    #[tokio::test]
    async fn start_status_and_stop_over_transport() {
        let temp = TempDir::new().unwrap();
        let env = environment(&temp, LOCAL_SSH);
        assert_eq!(env.destination(), "dev@build-box");

        let handle = env.start(&context(temp.path(), &["sleep", "30"])).await.unwrap();
        assert!(handle.process_id().is_some());
        assert_eq!(env.status(&handle).await, EnvironmentStatus::Running);
        env.stop(&handle).await.unwrap();

        let log = std::fs::read_to_string(temp.path().join("calls.log")).unwrap();
        assert!(log.contains("BatchMode=yes"));
        assert!(log.contains("ControlMaster=auto"));
        assert!(log.contains("-p 2222"));
        assert!(log.contains("dev@build-box"));
        assert!(temp.path().join("control").is_dir());
    }

    #[tokio::test]
    async fn exec_runs_in_remote_workdir_with_quoting() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("notes file.txt"), "remote").unwrap();
        let env = environment(&temp, LOCAL_SSH);
        let handle = EnvironmentHandle::Ssh {
            destination: "dev@build-box".into(),
            remote_pid: 1,
            workdir: temp.path().display().to_string(),
        };
        let outcome = env
            .exec(&handle, &["cat".to_string(), "notes file.txt".to_string()], None)
            .await;
        assert_eq!(
            outcome,
            ExecOutcome::Completed {
                exit_code: 0,
                output: "remote".into()
            }
        );
    }

    #[tokio::test]
    async fn unreachable_host_degrades_to_unavailable() {
        let temp = TempDir::new().unwrap();
        let env = environment(&temp, UNREACHABLE_SSH);

        let err = env.start(&context(temp.path(), &["claude"])).await.unwrap_err();
        assert!(err.is_unavailable(), "got {err:?}");

        let handle = EnvironmentHandle::Ssh {
            destination: "dev@build-box".into(),
            remote_pid: 42,
            workdir: "/srv".into(),
        };
        assert!(matches!(
            env.exec(&handle, &["ls".to_string()], None).await,
            ExecOutcome::Unavailable { .. }
        ));
        assert_eq!(env.status(&handle).await, EnvironmentStatus::Unknown);
    }

    #[test]
    fn start_script_exports_env_and_backgrounds_command() {
        let script = start_script("/srv/my repo", &context(Path::new("/ignored"), &["claude", "--model", "x y"]));
        assert!(script.starts_with("cd '/srv/my repo' || exit 1; "));
        assert!(script.contains("export GREETING='hello world'; "));
        assert!(script.contains("export CLAUDEWORK_SESSION_ID=session-1; "));
        assert!(script.ends_with("nohup claude --model 'x y' >/dev/null 2>&1 </dev/null & echo $!"));
    }

    #[test]
    fn record_requires_host() {
        let err = SshEnvironment::from_record(
            &record(serde_json::json!({"user": "dev"})),
            &SshSettings::default(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, EnvironmentError::InvalidConfig { .. }));
    }
}
