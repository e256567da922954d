use std::process::{Output, Stdio};
use std::time::Duration;

use log::{debug, warn};
use tokio::process::Command;
use tokio::time::timeout;
use uuid::Uuid;

use super::error::EnvironmentError;

/// Runs `command` to completion with captured output. The child is killed
/// when the limit elapses.
pub async fn run_with_timeout(
    mut command: Command,
    step: &str,
    limit: Duration,
) -> Result<Output, EnvironmentError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("{step}: running {command:?}");
    match timeout(limit, command.output()).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            warn!("{step} timed out after {limit:?}");
            Err(EnvironmentError::Timeout {
                step: step.to_string(),
                after: limit,
            })
        }
    }
}

/// Stdout followed by stderr, lossily decoded.
pub fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&stderr);
    }
    text
}

pub fn stderr_text(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr
    }
}

/// Exit code, or `128 + signal` for signal deaths, the way shells report it.
pub fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// SIGTERM to SIGKILL delay for commands started through `spawn`.
pub const SPAWNED_STOP_GRACE: Duration = Duration::from_millis(1500);

pub fn remote_pid_file() -> String {
    format!("/tmp/claudework-run-{}.pid", Uuid::new_v4().simple())
}

/// Runs `argv` in `workdir` from a shell that first records its own pid in
/// `pid_file`, and removes the file once the command exits.
pub fn tracked_script(workdir: &str, argv: &[String], pid_file: &str) -> String {
    let pid_file = shell_words::quote(pid_file);
    format!(
        "cd {} || exit 1; echo $$ > {pid_file}; {}; rc=$?; rm -f {pid_file}; exit $rc",
        shell_words::quote(workdir),
        shell_words::join(argv),
    )
}

/// Signals the process tree recorded by [`tracked_script`]. When the
/// recorded shell leads a process group the whole group is signalled,
/// otherwise the shell and every descendant found through `pgrep -P` or
/// `/proc`. SIGKILL follows after `grace`.
pub fn kill_tree_script(pid_file: &str, grace: Duration) -> String {
    let pid_file = shell_words::quote(pid_file);
    let ticks = (grace.as_millis() / 100).max(1);
    format!(
        "pid=$(cat {pid_file} 2>/dev/null); [ -n \"$pid\" ] || exit 0; \
         tree() {{ for c in $(pgrep -P \"$1\" 2>/dev/null || cat /proc/\"$1\"/task/*/children 2>/dev/null); do echo \"$c\"; tree \"$c\"; done; }}; \
         kids=$(tree \"$pid\"); \
         sig() {{ kill -s \"$1\" -- \"-$pid\" 2>/dev/null || kill -s \"$1\" $kids \"$pid\" 2>/dev/null; }}; \
         sig TERM; i=0; \
         while kill -0 \"$pid\" 2>/dev/null && [ $i -lt {ticks} ]; do sleep 0.1; i=$((i+1)); done; \
         sig KILL; rm -f {pid_file}; exit 0"
    )
}

/// Writes an executable shell script standing in for an external CLI.
#[cfg(all(test, unix))]
pub(crate) fn write_fake_binary(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
