use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::process::Command;

use super::command::{combined_output, exit_code_of, run_with_timeout};
use super::error::EnvironmentError;
use super::process_cleanup::{process_alive, terminate_pid};
use super::types::{
    EnvironmentHandle, EnvironmentKind, EnvironmentStatus, ExecOutcome, SessionContext,
    SpawnedCommand,
};
use super::ExecutionEnvironment;

const HOST_NAME: &str = "host";

/// Runs sessions as local OS processes rooted at the worktree.
#[derive(Debug, Clone)]
pub struct HostEnvironment {
    exec_timeout: Duration,
    stop_grace: Duration,
}

impl HostEnvironment {
    pub fn new(exec_timeout: Duration, stop_grace: Duration) -> Self {
        Self {
            exec_timeout,
            stop_grace,
        }
    }

    fn host_handle(handle: &EnvironmentHandle) -> Result<(u32, &Path), EnvironmentError> {
        match handle {
            EnvironmentHandle::Host { pid, workdir } => Ok((*pid, workdir.as_path())),
            other => Err(EnvironmentError::invalid_config(
                "handle",
                format!("{other} is not a host process"),
            )),
        }
    }
}

fn build_command(argv: &[String], workdir: &Path) -> Result<Command, EnvironmentError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| EnvironmentError::invalid_config("command", "command must not be empty"))?;
    let mut command = Command::new(program);
    command.args(args).current_dir(workdir);
    Ok(command)
}

#[async_trait]
impl ExecutionEnvironment for HostEnvironment {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::Host
    }

    fn name(&self) -> String {
        HOST_NAME.to_string()
    }

    async fn start(&self, context: &SessionContext) -> Result<EnvironmentHandle, EnvironmentError> {
        if !context.worktree_path.is_dir() {
            return Err(EnvironmentError::start_failed(
                HOST_NAME,
                format!("worktree {} does not exist", context.worktree_path.display()),
            ));
        }

        let mut command = build_command(&context.command, &context.worktree_path)?;
        command
            .envs(context.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("CLAUDEWORK_SESSION_ID", &context.session_id)
            .env("CLAUDEWORK_SESSION_NAME", &context.session_name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            EnvironmentError::start_failed(HOST_NAME, format!("{}: {e}", context.command[0]))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| EnvironmentError::start_failed(HOST_NAME, "process exited immediately"))?;

        let session_name = context.session_name.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!("Agent for session '{session_name}' exited with {status}"),
                Err(e) => warn!("Failed to wait on agent for session '{session_name}': {e}"),
            }
        });

        info!(
            "Started host agent for session '{}' with pid {pid}",
            context.session_name
        );
        Ok(EnvironmentHandle::Host {
            pid,
            workdir: context.worktree_path.clone(),
        })
    }

    async fn stop(&self, handle: &EnvironmentHandle) -> Result<(), EnvironmentError> {
        let (pid, _) = Self::host_handle(handle)?;
        if !process_alive(pid) {
            debug!("Host process {pid} already gone");
            return Ok(());
        }
        if terminate_pid(pid, self.stop_grace, true).await {
            Ok(())
        } else {
            Err(EnvironmentError::CommandFailed {
                message: format!("process {pid} survived SIGKILL"),
            })
        }
    }

    async fn exec<'a>(
        &self,
        handle: &EnvironmentHandle,
        argv: &[String],
        cwd: Option<&'a Path>,
    ) -> ExecOutcome {
        let workdir: PathBuf = match (cwd, Self::host_handle(handle)) {
            (Some(dir), _) => dir.to_path_buf(),
            (None, Ok((_, dir))) => dir.to_path_buf(),
            (None, Err(e)) => {
                return ExecOutcome::Unavailable {
                    reason: e.to_string(),
                }
            }
        };
        let command = match build_command(argv, &workdir) {
            Ok(command) => command,
            Err(e) => {
                return ExecOutcome::Completed {
                    exit_code: 127,
                    output: e.to_string(),
                }
            }
        };

        match run_with_timeout(command, "host exec", self.exec_timeout).await {
            Ok(output) => ExecOutcome::Completed {
                exit_code: exit_code_of(&output.status),
                output: combined_output(&output),
            },
            Err(EnvironmentError::Timeout { after, .. }) => ExecOutcome::timed_out(after),
            Err(e) => ExecOutcome::Completed {
                exit_code: 127,
                output: e.to_string(),
            },
        }
    }

    async fn status(&self, handle: &EnvironmentHandle) -> EnvironmentStatus {
        match Self::host_handle(handle) {
            Ok((pid, _)) if process_alive(pid) => EnvironmentStatus::Running,
            Ok(_) => EnvironmentStatus::Stopped,
            Err(_) => EnvironmentStatus::Unknown,
        }
    }

    async fn spawn(&self, handle: &EnvironmentHandle, argv: &[String]) -> Result<SpawnedCommand, EnvironmentError> {
        let (_, workdir) = Self::host_handle(handle)?;
        let mut command = build_command(argv, workdir)?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        let child = command
            .spawn()
            .map_err(|e| EnvironmentError::start_failed(HOST_NAME, format!("{}: {e}", argv[0])))?;
        Ok(SpawnedCommand {
            child,
            remote_pid_file: None,
        })
    }

    /// Host commands lead their own process group and are killed locally.
    async fn kill_spawned(&self, _handle: &EnvironmentHandle, pid_file: &str) -> Result<(), EnvironmentError> {
        debug!("No remote process behind {pid_file} on the host");
        Ok(())
    }

    async fn teardown(&self, handle: &EnvironmentHandle, _keep_volumes: bool) -> Result<(), EnvironmentError> {
        self.stop(handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn env() -> HostEnvironment {
        HostEnvironment::new(Duration::from_secs(5), Duration::from_millis(500))
    }

    fn context(dir: &Path, command: &[&str]) -> SessionContext {
        SessionContext {
            session_id: "session-1".into(),
            session_name: "brave-otter".into(),
            worktree_path: dir.to_path_buf(),
            branch_name: "session/brave-otter".into(),
            command: command.iter().map(|s| s.to_string()).collect(),
            env: vec![("FOO".into(), "bar".into())],
        }
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn start_stop_and_status() {
        let temp = TempDir::new().unwrap();
        let host = env();
        let handle = host.start(&context(temp.path(), &["sleep", "30"])).await.unwrap();
        assert_eq!(host.status(&handle).await, EnvironmentStatus::Running);

        host.stop(&handle).await.unwrap();
        assert_eq!(host.status(&handle).await, EnvironmentStatus::Stopped);
        host.stop(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn start_rejects_empty_command_and_missing_worktree() {
        let temp = TempDir::new().unwrap();
        let host = env();
        let err = host.start(&context(temp.path(), &[])).await.unwrap_err();
        assert!(matches!(err, EnvironmentError::InvalidConfig { .. }));

        let err = host
            .start(&context(&temp.path().join("missing"), &["sleep", "1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, EnvironmentError::StartFailed { .. }));
    }

    #[tokio::test]
    async fn exec_captures_output_in_workdir() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("marker.txt"), "here").unwrap();
        let host = env();
        let handle = EnvironmentHandle::Host {
            pid: std::process::id(),
            workdir: temp.path().to_path_buf(),
        };

        let outcome = host.exec(&handle, &argv(&["cat", "marker.txt"]), None).await;
        assert_eq!(
            outcome,
            ExecOutcome::Completed {
                exit_code: 0,
                output: "here".into()
            }
        );

        let failed = host.exec(&handle, &argv(&["sh", "-c", "exit 4"]), None).await;
        assert!(matches!(failed, ExecOutcome::Completed { exit_code: 4, .. }));
    }

    #[tokio::test]
    async fn exec_times_out() {
        let temp = TempDir::new().unwrap();
        let host = HostEnvironment::new(Duration::from_millis(100), Duration::from_millis(100));
        let handle = EnvironmentHandle::Host {
            pid: std::process::id(),
            workdir: temp.path().to_path_buf(),
        };
        let outcome = host.exec(&handle, &argv(&["sleep", "5"]), None).await;
        assert!(matches!(outcome, ExecOutcome::TimedOut { .. }));
    }

    #[tokio::test]
    async fn spawn_streams_stdout() {
        let temp = TempDir::new().unwrap();
        let host = env();
        let handle = EnvironmentHandle::Host {
            pid: std::process::id(),
            workdir: temp.path().to_path_buf(),
        };
        let spawned = host
            .spawn(&handle, &argv(&["sh", "-c", "echo streamed"]))
            .await
            .unwrap();
        assert!(spawned.remote_pid_file.is_none());
        let mut child = spawned.child;
        let mut stdout = child.stdout.take().unwrap();
        let mut text = String::new();
        stdout.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "streamed\n");
        assert!(child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn status_of_foreign_handle_is_unknown() {
        let host = env();
        let handle = EnvironmentHandle::Ssh {
            destination: "example".into(),
            remote_pid: 1,
            workdir: "/".into(),
        };
        assert_eq!(host.status(&handle).await, EnvironmentStatus::Unknown);
    }
}
