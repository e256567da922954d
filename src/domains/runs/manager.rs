use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use super::types::{LogStream, RunLogLine, RunSnapshot, RunStatus};
use crate::domains::environments::process_cleanup::kill_process_group;
use crate::domains::sessions::supervisor::ProcessSupervisor;
use crate::errors::{CoreError, CoreResult};
use crate::infrastructure::events::{ClaudeworkEvent, EventPayload, EventSink};

/// Output still buffered in pipes after exit is drained for at most this long.
const LOG_DRAIN_LIMIT: Duration = Duration::from_secs(2);

struct RunState {
    status: RunStatus,
    exit_code: Option<i32>,
    signal: Option<i32>,
    finished_at: Option<chrono::DateTime<Utc>>,
}

struct RunEntry {
    run_id: String,
    session_id: String,
    command: String,
    pid: Option<u32>,
    remote_pid_file: Option<String>,
    started_at: chrono::DateTime<Utc>,
    state: Mutex<RunState>,
    logs: Mutex<Vec<RunLogLine>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    done: watch::Receiver<bool>,
}

impl RunEntry {
    fn snapshot(&self) -> RunSnapshot {
        let (status, exit_code, signal, finished_at) = match self.state.lock() {
            Ok(state) => (state.status, state.exit_code, state.signal, state.finished_at),
            Err(poisoned) => {
                let state = poisoned.into_inner();
                (state.status, state.exit_code, state.signal, state.finished_at)
            }
        };
        RunSnapshot {
            run_id: self.run_id.clone(),
            session_id: self.session_id.clone(),
            command: self.command.clone(),
            pid: self.pid,
            status,
            exit_code,
            signal,
            started_at: self.started_at,
            finished_at,
            execution_time_ms: finished_at.map(|end| (end - self.started_at).num_milliseconds()),
        }
    }

    fn push_line(&self, stream: LogStream, line: String) {
        if let Ok(mut logs) = self.logs.lock() {
            logs.push(RunLogLine {
                stream,
                line,
                at: Utc::now(),
            });
        }
    }

    fn finish(&self, exit_code: Option<i32>, signal: Option<i32>) {
        if let Ok(mut state) = self.state.lock() {
            state.status = RunStatus::Exited;
            state.exit_code = exit_code;
            state.signal = signal;
            state.finished_at = Some(Utc::now());
        }
    }

    fn is_running(&self) -> bool {
        !*self.done.borrow()
    }
}

/// Commands chaining with `&&`, `||` or pipes go through `sh -c`; anything
/// else is split like a shell would and executed directly.
pub fn command_argv(command: &str) -> CoreResult<Vec<String>> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(CoreError::validation("command", "Command must not be empty"));
    }
    if trimmed.contains("&&") || trimmed.contains("||") || trimmed.contains('|') {
        return Ok(vec!["sh".to_string(), "-c".to_string(), trimmed.to_string()]);
    }
    let argv = shell_words::split(trimmed)
        .map_err(|e| CoreError::validation("command", format!("Cannot parse '{trimmed}': {e}")))?;
    if argv.is_empty() {
        return Err(CoreError::validation("command", "Command must not be empty"));
    }
    Ok(argv)
}

/// Short-lived commands next to a session's agent, each with its own
/// ordered log.
pub struct AdHocRunManager {
    supervisor: Arc<ProcessSupervisor>,
    events: Arc<dyn EventSink>,
    runs: DashMap<String, Arc<RunEntry>>,
}

impl AdHocRunManager {
    pub fn new(supervisor: Arc<ProcessSupervisor>, events: Arc<dyn EventSink>) -> Self {
        Self {
            supervisor,
            events,
            runs: DashMap::new(),
        }
    }

    fn entry(&self, run_id: &str) -> Option<Arc<RunEntry>> {
        self.runs.get(run_id).map(|entry| entry.value().clone())
    }

    /// Starts `command` in the session's sandbox and returns its run id
    /// without waiting for it.
    pub async fn run_script(&self, session_id: &str, command: &str) -> CoreResult<String> {
        let argv = command_argv(command)?;
        let sandbox = self.supervisor.sandbox(session_id)?;
        let spawned = sandbox
            .environment
            .spawn(&sandbox.handle, &argv)
            .await?;
        let mut child = spawned.child;

        let run_id = Uuid::new_v4().to_string();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(false);
        let entry = Arc::new(RunEntry {
            run_id: run_id.clone(),
            session_id: session_id.to_string(),
            command: command.trim().to_string(),
            pid: child.id(),
            remote_pid_file: spawned.remote_pid_file,
            started_at: Utc::now(),
            state: Mutex::new(RunState {
                status: RunStatus::Running,
                exit_code: None,
                signal: None,
                finished_at: None,
            }),
            logs: Mutex::new(Vec::new()),
            kill: Mutex::new(Some(kill_tx)),
            done: done_rx,
        });
        self.runs.insert(run_id.clone(), entry.clone());

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(entry.clone(), stdout, LogStream::Stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(entry.clone(), stderr, LogStream::Stderr)));
        }

        let events = self.events.clone();
        let waiter_entry = entry.clone();
        tokio::spawn(async move {
            let entry = waiter_entry;
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    debug!("Killing run {}", entry.run_id);
                    match (&entry.remote_pid_file, entry.pid) {
                        (Some(pid_file), _) => {
                            if let Err(e) = sandbox.environment.kill_spawned(&sandbox.handle, pid_file).await {
                                warn!("Failed to kill run {} inside its sandbox: {e}", entry.run_id);
                            }
                        }
                        (None, Some(pid)) => kill_process_group(pid),
                        (None, None) => {}
                    }
                    if let Err(e) = child.start_kill() {
                        debug!("Run {} already exited: {e}", entry.run_id);
                    }
                    child.wait().await
                }
            };

            if tokio::time::timeout(LOG_DRAIN_LIMIT, futures::future::join_all(readers))
                .await
                .is_err()
            {
                warn!("Output of run {} did not close after exit", entry.run_id);
            }

            let (exit_code, signal) = match status {
                Ok(status) => (status.code(), exit_signal(&status)),
                Err(e) => {
                    warn!("Failed to wait on run {}: {e}", entry.run_id);
                    (None, None)
                }
            };
            entry.finish(exit_code, signal);
            let _ = done_tx.send(true);
            info!(
                "Run {} ('{}') exited with code {exit_code:?}, signal {signal:?}",
                entry.run_id, entry.command
            );
            events.emit(
                ClaudeworkEvent::RunFinished,
                EventPayload::Run {
                    run_id: entry.run_id.clone(),
                    session_id: entry.session_id.clone(),
                    exit_code,
                },
            );
        });

        info!("Started run {run_id} in session {session_id}: {}", entry.command);
        self.events.emit(
            ClaudeworkEvent::RunStarted,
            EventPayload::Run {
                run_id: run_id.clone(),
                session_id: session_id.to_string(),
                exit_code: None,
            },
        );
        Ok(run_id)
    }

    /// `None` for unknown (or already collected) runs.
    pub fn get_status(&self, run_id: &str) -> Option<RunSnapshot> {
        self.entry(run_id).map(|entry| entry.snapshot())
    }

    pub fn logs(&self, run_id: &str) -> Option<Vec<RunLogLine>> {
        self.entry(run_id)
            .map(|entry| entry.logs.lock().map(|logs| logs.clone()).unwrap_or_default())
    }

    pub fn list_for_session(&self, session_id: &str) -> Vec<RunSnapshot> {
        let mut runs: Vec<RunSnapshot> = self
            .runs
            .iter()
            .filter(|entry| entry.session_id == session_id)
            .map(|entry| entry.snapshot())
            .collect();
        runs.sort_by_key(|run| run.started_at);
        runs
    }

    pub async fn wait(&self, run_id: &str) -> CoreResult<RunSnapshot> {
        let entry = self
            .entry(run_id)
            .ok_or_else(|| CoreError::not_found("run", run_id))?;
        let mut done = entry.done.clone();
        if done.wait_for(|finished| *finished).await.is_err() {
            warn!("Run {run_id} lost its waiter");
        }
        Ok(entry.snapshot())
    }

    /// Terminates an in-flight run. Stopping an exited run is a no-op.
    pub async fn stop(&self, run_id: &str) -> CoreResult<RunSnapshot> {
        let entry = self
            .entry(run_id)
            .ok_or_else(|| CoreError::not_found("run", run_id))?;
        if !entry.is_running() {
            return Ok(entry.snapshot());
        }
        let sender = entry.kill.lock().ok().and_then(|mut kill| kill.take());
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
        self.wait(run_id).await
    }

    /// Removes an exited run and returns its final state. Running runs stay.
    pub fn take_finished(&self, run_id: &str) -> Option<RunSnapshot> {
        self.runs
            .remove_if(run_id, |_, entry| !entry.is_running())
            .map(|(_, entry)| entry.snapshot())
    }

    /// Stops the session's in-flight runs and drops every finished run of
    /// the session. Returns the ids that were still running.
    pub async fn stop_for_session(&self, session_id: &str) -> Vec<String> {
        let runs = self.list_for_session(session_id);
        let mut stopped = Vec::new();
        for run in &runs {
            if run.is_running() {
                if let Err(e) = self.stop(&run.run_id).await {
                    warn!("Failed to stop run {}: {e}", run.run_id);
                }
                stopped.push(run.run_id.clone());
            }
            if self.take_finished(&run.run_id).is_none() {
                warn!("Run {} is still running after stop", run.run_id);
            }
        }
        stopped
    }

    pub async fn shutdown(&self) {
        let ids: Vec<String> = self
            .runs
            .iter()
            .filter(|entry| entry.is_running())
            .map(|entry| entry.key().clone())
            .collect();
        let stops = ids.iter().map(|id| self.stop(id));
        for result in futures::future::join_all(stops).await {
            if let Err(e) = result {
                warn!("Failed to stop run during shutdown: {e}");
            }
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(entry: Arc<RunEntry>, stream: R, kind: LogStream) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => entry.push_line(kind, line),
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading run {} output: {e}", entry.run_id);
                break;
            }
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
