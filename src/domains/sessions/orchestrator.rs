use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use uuid::Uuid;

use super::entity::{CreateSessionRequest, Project, Session, SessionStatus};
use super::naming::{generate_session_name, is_valid_session_name};
use super::repository::SessionRepository;
use super::supervisor::ProcessSupervisor;
use crate::domains::environments::{
    CloneLocation, EnvironmentFactory, EnvironmentKind, EnvironmentRecord, EnvironmentStatus,
    ExecutionEnvironment, SessionContext,
};
use crate::domains::git::{
    BranchInfo, CommitFileChange, CommitInfo, DiffDetails, GitWorktreeService, PullResult,
    SessionWarnings, WorktreeEntry,
};
use crate::domains::merge::{GitOperationResult, KeyedLocks};
use crate::domains::runs::AdHocRunManager;
use crate::domains::settings::Settings;
use crate::errors::{CoreError, CoreResult};
use crate::infrastructure::events::{ClaudeworkEvent, EventPayload, EventSink};

pub const SESSION_BRANCH_PREFIX: &str = "session";

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub worktree_root: PathBuf,
    pub agent_command: Vec<String>,
    pub name_generation_attempts: u32,
    pub keep_volumes: bool,
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            worktree_root: settings.worktree_root(),
            agent_command: settings.agent_argv(),
            name_generation_attempts: settings.name_generation_attempts,
            keep_volumes: settings.debug_mode_keep_volumes,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeleteOptions {
    pub delete_branch: bool,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self { delete_branch: true }
    }
}

/// Services the orchestrator is built from.
pub struct OrchestratorDeps {
    pub repository: Arc<dyn SessionRepository>,
    pub git: Arc<GitWorktreeService>,
    pub environments: Arc<dyn EnvironmentFactory>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub runs: Arc<AdHocRunManager>,
    pub events: Arc<dyn EventSink>,
}

/// Owns the session state machine and mediates every git and sandbox
/// operation for a session. Operations on one session are serialized;
/// different sessions never wait on each other.
pub struct SessionOrchestrator {
    repository: Arc<dyn SessionRepository>,
    git: Arc<GitWorktreeService>,
    environments: Arc<dyn EnvironmentFactory>,
    supervisor: Arc<ProcessSupervisor>,
    runs: Arc<AdHocRunManager>,
    events: Arc<dyn EventSink>,
    config: OrchestratorConfig,
    session_locks: KeyedLocks,
}

impl SessionOrchestrator {
    pub fn new(deps: OrchestratorDeps, config: OrchestratorConfig) -> Self {
        Self {
            repository: deps.repository,
            git: deps.git,
            environments: deps.environments,
            supervisor: deps.supervisor,
            runs: deps.runs,
            events: deps.events,
            config,
            session_locks: KeyedLocks::new(),
        }
    }

    pub fn runs(&self) -> &Arc<AdHocRunManager> {
        &self.runs
    }

    pub fn git(&self) -> &Arc<GitWorktreeService> {
        &self.git
    }

    // ----- projects and environments -----

    /// Registers a local repository. Registering the same path twice
    /// returns the existing project.
    pub async fn register_project(
        &self,
        path: &Path,
        name: Option<&str>,
        clone_location: CloneLocation,
    ) -> CoreResult<Project> {
        let path = path.canonicalize().map_err(|e| {
            CoreError::validation("path", format!("{}: {e}", path.display()))
        })?;
        if !self.git.is_repository(&path).await? {
            return Err(CoreError::validation(
                "path",
                format!("{} is not a git repository root", path.display()),
            ));
        }
        if let Some(existing) = self
            .repository
            .list_projects()?
            .into_iter()
            .find(|p| p.path == path)
        {
            debug!("Project at {} already registered", path.display());
            return Ok(existing);
        }

        let project = Project {
            id: Uuid::new_v4().to_string(),
            name: name
                .map(str::to_string)
                .unwrap_or_else(|| dir_name(&path)),
            path,
            remote_url: None,
            environment_id: None,
            clone_location,
            created_at: Utc::now(),
        };
        self.repository.save_project(&project)?;
        info!("Registered project '{}' at {}", project.name, project.path.display());
        Ok(project)
    }

    /// Clones `url` and registers the checkout as a project.
    pub async fn clone_project(
        &self,
        url: &str,
        destination: &Path,
        clone_location: CloneLocation,
    ) -> CoreResult<Project> {
        let path = self.git.clone_repository(url, destination).await?;
        let mut project = self.register_project(&path, None, clone_location).await?;
        project.remote_url = Some(url.to_string());
        self.repository.save_project(&project)?;
        Ok(project)
    }

    pub fn list_projects(&self) -> CoreResult<Vec<Project>> {
        Ok(self.repository.list_projects()?)
    }

    pub fn get_project(&self, project_id: &str) -> CoreResult<Project> {
        self.repository
            .get_project(project_id)?
            .ok_or_else(|| CoreError::not_found("project", project_id))
    }

    /// Looks a project up by id, name or checkout path.
    pub fn find_project(&self, key: &str) -> CoreResult<Project> {
        if let Some(project) = self.repository.get_project(key)? {
            return Ok(project);
        }
        let as_path = Path::new(key).canonicalize().ok();
        let matches: Vec<Project> = self
            .repository
            .list_projects()?
            .into_iter()
            .filter(|p| p.name == key || as_path.as_deref() == Some(p.path.as_path()))
            .collect();
        single_match("project", key, matches)
    }

    /// Points a project at an environment record, or back to its clone
    /// location policy with `None`.
    pub fn set_project_environment(
        &self,
        project_id: &str,
        environment_id: Option<&str>,
    ) -> CoreResult<Project> {
        let mut project = self.get_project(project_id)?;
        if let Some(id) = environment_id {
            self.get_environment(id)?;
        }
        project.environment_id = environment_id.map(str::to_string);
        self.repository.save_project(&project)?;
        Ok(project)
    }

    /// Deletes the project and all of its sessions. Refuses with `Conflict`
    /// while sessions are live unless `force` is set.
    pub async fn delete_project(&self, project_id: &str, force: bool) -> CoreResult<()> {
        let project = self.get_project(project_id)?;
        let sessions = self.repository.list_sessions(Some(&project.id))?;
        let live: Vec<String> = sessions
            .iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.name.clone())
            .collect();
        if !live.is_empty() && !force {
            return Err(CoreError::conflict(
                format!("Project '{}' has active sessions", project.name),
                live,
            ));
        }
        for session in sessions {
            self.delete(&session.id, DeleteOptions::default()).await?;
        }
        self.repository.delete_project(&project.id)?;
        info!("Deleted project '{}'", project.name);
        Ok(())
    }

    /// Stores an environment record after checking its config resolves.
    /// Marking it default clears the flag on every other record.
    pub fn save_environment(&self, record: EnvironmentRecord) -> CoreResult<EnvironmentRecord> {
        self.environments
            .resolve(Some(&record), CloneLocation::Host)?;
        if record.is_default {
            for mut other in self.repository.list_environments()? {
                if other.id != record.id && other.is_default {
                    other.is_default = false;
                    self.repository.save_environment(&other)?;
                }
            }
        }
        self.repository.save_environment(&record)?;
        Ok(record)
    }

    pub fn get_environment(&self, environment_id: &str) -> CoreResult<EnvironmentRecord> {
        self.repository
            .get_environment(environment_id)?
            .ok_or_else(|| CoreError::not_found("environment", environment_id))
    }

    pub fn list_environments(&self) -> CoreResult<Vec<EnvironmentRecord>> {
        Ok(self.repository.list_environments()?)
    }

    // ----- session lifecycle -----

    pub fn get_session(&self, session_id: &str) -> CoreResult<Session> {
        self.repository
            .get_session(session_id)?
            .ok_or_else(|| CoreError::not_found("session", session_id))
    }

    pub fn list_sessions(&self, project_id: Option<&str>) -> CoreResult<Vec<Session>> {
        Ok(self.repository.list_sessions(project_id)?)
    }

    /// Looks a session up by id, or by name when that is unambiguous across
    /// projects.
    pub fn find_session(&self, key: &str) -> CoreResult<Session> {
        if let Some(session) = self.repository.get_session(key)? {
            return Ok(session);
        }
        let matches: Vec<Session> = self
            .repository
            .list_sessions(None)?
            .into_iter()
            .filter(|s| s.name == key)
            .collect();
        single_match("session", key, matches)
    }

    /// Allocates a worktree, records the session as `initializing` and
    /// starts its agent. A failure removes the worktree and branch again;
    /// when the agent could not start the record stays behind in `error`
    /// with the cause, except after a timeout where nothing is kept.
    pub async fn create(&self, request: CreateSessionRequest) -> CoreResult<Session> {
        let project = self.get_project(&request.project_id)?;
        if !self.git.is_repository(&project.path).await? {
            return Err(CoreError::validation(
                "project",
                format!("{} is not a git repository", project.path.display()),
            ));
        }

        let taken: HashSet<String> = self
            .repository
            .list_sessions(Some(&project.id))?
            .into_iter()
            .map(|s| s.name)
            .collect();
        let repo_dir = dir_name(&project.path);
        let name = match request
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
        {
            Some(name) => {
                if !is_valid_session_name(name) {
                    return Err(CoreError::validation(
                        "name",
                        format!("'{name}' may only contain lowercase letters, digits, '-' and '_'"),
                    ));
                }
                if taken.contains(name) {
                    return Err(CoreError::validation(
                        "name",
                        format!("Session name '{name}' already exists in this project"),
                    ));
                }
                name.to_string()
            }
            None => generate_session_name(
                |candidate| {
                    taken.contains(candidate)
                        || self.worktree_path_for(&repo_dir, candidate).exists()
                },
                self.config.name_generation_attempts,
            ),
        };

        let base_branch = match request.base_branch {
            Some(base) if !base.trim().is_empty() => base.trim().to_string(),
            _ => self.git.default_branch(&project.path).await?,
        };
        let branch_name = format!("{SESSION_BRANCH_PREFIX}/{name}");
        let worktree_path = self.worktree_path_for(&repo_dir, &name);
        let session_id = Uuid::new_v4().to_string();
        let _guard = self.session_locks.acquire(&session_id).await;

        self.git
            .create_worktree(&project.path, &branch_name, &worktree_path, &base_branch)
            .await?;

        let now = Utc::now();
        let mut session = Session {
            id: session_id,
            project_id: project.id.clone(),
            name,
            branch_name,
            base_branch,
            worktree_path,
            status: SessionStatus::Initializing,
            environment_id: project.environment_id.clone(),
            environment_kind: None,
            handle: None,
            container_id: None,
            process_id: None,
            model: request.model,
            command: request.command.unwrap_or_default(),
            env: request.env,
            error: None,
            rebase_in_progress: false,
            created_at: now,
            updated_at: now,
            last_activity: None,
        };
        if let Err(e) = self.repository.save_session(&session) {
            self.rollback_worktree(&project, &session).await;
            return Err(e.into());
        }
        self.events.emit(
            ClaudeworkEvent::SessionAdded,
            EventPayload::Session {
                session_id: session.id.clone(),
                name: session.name.clone(),
            },
        );
        info!(
            "Created session '{}' on {} at {}",
            session.name,
            session.branch_name,
            session.worktree_path.display()
        );

        match self.launch(&project, &mut session).await {
            Ok(()) => Ok(session),
            Err(err) => {
                warn!("Session '{}' failed to start: {err}", session.name);
                self.discard_sandbox(&project, &session).await;
                self.rollback_worktree(&project, &session).await;
                if matches!(err, CoreError::Timeout { .. }) {
                    self.forget_session(&session);
                } else {
                    self.fail_session(&mut session, &err);
                }
                Err(err)
            }
        }
    }

    /// (Re)starts the agent of a stopped, completed or failed session.
    /// Rejected with `Conflict` while an agent is live.
    pub async fn start(&self, session_id: &str) -> CoreResult<Session> {
        let _guard = self.session_locks.acquire(session_id).await;
        let mut session = self.get_session(session_id)?;
        if session.status.is_active() || self.supervisor.is_supervised(session_id) {
            return Err(CoreError::conflict(
                format!("Session '{}' is already running", session.name),
                Vec::new(),
            ));
        }
        let project = self.get_project(&session.project_id)?;

        if session.status != SessionStatus::Initializing {
            self.set_status(&mut session, SessionStatus::Initializing)?;
        }
        if let Some(previous) = session.handle.clone() {
            // The home volume is keyed by session id and reused.
            match self.environment_for(&project, &session) {
                Ok(environment) => {
                    if let Err(e) = environment.teardown(&previous, true).await {
                        warn!("Failed to release previous sandbox {previous}: {e}");
                    }
                }
                Err(e) => warn!("Cannot resolve environment of {previous}: {e}"),
            }
            session.detach();
        }

        if let Err(err) = self.ensure_worktree(&project, &session).await {
            self.fail_session(&mut session, &err);
            return Err(err);
        }
        match self.launch(&project, &mut session).await {
            Ok(()) => Ok(session),
            Err(err) => {
                self.fail_session(&mut session, &err);
                Err(err)
            }
        }
    }

    /// Stops the agent and marks the session `completed`. Stopping a
    /// session without a live agent only records the status; stopping a
    /// terminal session does nothing.
    pub async fn stop(&self, session_id: &str) -> CoreResult<Session> {
        let _guard = self.session_locks.acquire(session_id).await;
        self.stop_locked(session_id, SessionStatus::Completed).await
    }

    /// Agent finished its task.
    pub async fn complete(&self, session_id: &str) -> CoreResult<Session> {
        self.stop(session_id).await
    }

    async fn stop_locked(&self, session_id: &str, next: SessionStatus) -> CoreResult<Session> {
        let mut session = self.get_session(session_id)?;
        if session.status.is_terminal() {
            debug!("Session '{}' already {}", session.name, session.status);
            return Ok(session);
        }
        let project = self.get_project(&session.project_id)?;
        if let Err(err) = self.halt_agent(&project, &session).await {
            self.fail_session(&mut session, &err);
            return Err(err);
        }
        self.set_status(&mut session, next)?;
        Ok(session)
    }

    /// Tears the session down: in-flight runs, the agent, the sandbox
    /// (volumes stay when configured to keep them), the worktree, the branch
    /// when asked, and finally the record.
    pub async fn delete(&self, session_id: &str, options: DeleteOptions) -> CoreResult<()> {
        let guard = self.session_locks.acquire(session_id).await;
        let session = self.get_session(session_id)?;
        let project = self.get_project(&session.project_id)?;

        let stopped_runs = self.runs.stop_for_session(&session.id).await;
        if !stopped_runs.is_empty() {
            debug!("Stopped {} run(s) of session '{}'", stopped_runs.len(), session.name);
        }
        if !session.status.is_terminal() {
            info!("Stopping session '{}' before deletion", session.name);
        }
        self.halt_agent(&project, &session).await?;

        if let Some(handle) = &session.handle {
            let environment = self.environment_for(&project, &session)?;
            environment
                .teardown(handle, self.config.keep_volumes)
                .await?;
        }

        let branch = options
            .delete_branch
            .then_some(session.branch_name.as_str());
        self.git
            .remove_worktree(&project.path, &session.worktree_path, branch)
            .await?;

        self.forget_session(&session);
        drop(guard);
        self.session_locks.forget(session_id);
        info!("Deleted session '{}'", session.name);
        Ok(())
    }

    /// Polls the sandbox, bounded by the status timeout.
    pub async fn get_status(&self, session_id: &str) -> CoreResult<EnvironmentStatus> {
        if self.supervisor.is_supervised(session_id) {
            return self.supervisor.get_status(session_id).await;
        }
        let session = self.get_session(session_id)?;
        match (&session.handle, session.status.is_active()) {
            (Some(handle), true) => {
                let project = self.get_project(&session.project_id)?;
                let environment = self.environment_for(&project, &session)?;
                Ok(self.supervisor.poll(&environment, handle).await)
            }
            _ => Ok(EnvironmentStatus::Stopped),
        }
    }

    pub async fn mark_waiting_input(&self, session_id: &str) -> CoreResult<Session> {
        self.move_to(session_id, SessionStatus::WaitingInput).await
    }

    pub async fn mark_running(&self, session_id: &str) -> CoreResult<Session> {
        self.move_to(session_id, SessionStatus::Running).await
    }

    async fn move_to(&self, session_id: &str, next: SessionStatus) -> CoreResult<Session> {
        let _guard = self.session_locks.acquire(session_id).await;
        let mut session = self.get_session(session_id)?;
        if !session.status.is_active() {
            return Err(CoreError::InvalidTransition {
                session_id: session.id.clone(),
                from: session.status.to_string(),
                to: next.to_string(),
            });
        }
        session.touch();
        self.set_status(&mut session, next)?;
        Ok(session)
    }

    pub async fn record_activity(&self, session_id: &str) -> CoreResult<()> {
        let _guard = self.session_locks.acquire(session_id).await;
        let mut session = self.get_session(session_id)?;
        session.touch();
        self.repository.save_session(&session)?;
        Ok(())
    }

    /// Stops live sessions without activity for `idle_minutes` and marks
    /// them `stopped`. Zero disables the check.
    pub async fn stop_idle_sessions(&self, idle_minutes: u64) -> CoreResult<Vec<String>> {
        if idle_minutes == 0 {
            return Ok(Vec::new());
        }
        let cutoff = Utc::now() - chrono::Duration::minutes(idle_minutes as i64);
        let is_idle = |s: &Session| {
            s.status.is_active() && s.last_activity.unwrap_or(s.updated_at) < cutoff
        };
        let idle: Vec<String> = self
            .repository
            .list_sessions(None)?
            .into_iter()
            .filter(|s| is_idle(s))
            .map(|s| s.id)
            .collect();

        let mut stopped = Vec::new();
        for id in idle {
            let _guard = self.session_locks.acquire(&id).await;
            // Activity may have been recorded while waiting for the lock
            match self.get_session(&id) {
                Ok(current) if is_idle(&current) => {}
                Ok(current) => {
                    debug!("Session '{}' is no longer idle", current.name);
                    continue;
                }
                Err(e) => {
                    debug!("Idle session {id} went away: {e}");
                    continue;
                }
            }
            match self.stop_locked(&id, SessionStatus::Stopped).await {
                Ok(session) => {
                    info!("Stopped idle session '{}'", session.name);
                    stopped.push(id);
                }
                Err(e) => warn!("Failed to stop idle session {id}: {e}"),
            }
        }
        Ok(stopped)
    }

    /// Re-registers live handles recorded by an earlier process so they can
    /// be stopped and used for runs. Returns how many were adopted.
    pub fn rehydrate(&self) -> CoreResult<usize> {
        let mut adopted = 0;
        for session in self.repository.list_sessions(None)? {
            let Some(handle) = session.handle.clone() else {
                continue;
            };
            if !session.status.is_active() || self.supervisor.is_supervised(&session.id) {
                continue;
            }
            let project = match self.get_project(&session.project_id) {
                Ok(project) => project,
                Err(e) => {
                    warn!("Skipping session '{}': {e}", session.name);
                    continue;
                }
            };
            match self.environment_for(&project, &session) {
                Ok(environment) => {
                    self.supervisor.adopt(&session.id, environment, handle)?;
                    adopted += 1;
                }
                Err(e) => warn!("Cannot resolve environment of session '{}': {e}", session.name),
            }
        }
        Ok(adopted)
    }

    /// Best-effort stop of every run and supervised agent.
    pub async fn shutdown_all(&self) {
        self.runs.shutdown().await;
        for id in self.supervisor.shutdown_all().await {
            let _guard = self.session_locks.acquire(&id).await;
            match self.get_session(&id) {
                Ok(mut session) if !session.status.is_terminal() => {
                    if let Err(e) = self.set_status(&mut session, SessionStatus::Stopped) {
                        warn!("Failed to record shutdown of session '{}': {e}", session.name);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to load session {id} during shutdown: {e}"),
            }
        }
    }

    /// Starts `command` inside the session's sandbox.
    pub async fn run_script(&self, session_id: &str, command: &str) -> CoreResult<String> {
        let session = self.get_session(session_id)?;
        if !session.status.is_active() {
            return Err(CoreError::validation(
                "session",
                format!("Session '{}' is {}, not running", session.name, session.status),
            ));
        }
        self.runs.run_script(session_id, command).await
    }

    /// Warns about unsaved work before a destructive operation. An
    /// unreachable sandbox is reported as a validation error.
    pub async fn check_warnings(&self, session_id: &str) -> CoreResult<SessionWarnings> {
        let session = self.get_session(session_id)?;
        let project = self.get_project(&session.project_id)?;
        if session.status.is_active() && session.handle.is_some() {
            if let EnvironmentStatus::Unknown = self.get_status(session_id).await? {
                return Err(CoreError::validation(
                    "session",
                    format!("Sandbox of session '{}' is unreachable", session.name),
                ));
            }
        }
        self.git.check_warnings(&session.target(&project)).await
    }

    // ----- git operations -----

    pub async fn rebase(&self, session_id: &str) -> CoreResult<GitOperationResult> {
        let _guard = self.session_locks.acquire(session_id).await;
        let (mut session, project) = self.session_and_project(session_id)?;
        let target = session.target(&project);
        let result = self.git.rebase_from_main(&target).await?;
        let pending = self.git.rebase_in_progress(&target).await?;
        self.record_rebase_state(&mut session, pending, result.conflict_paths())?;
        Ok(result)
    }

    pub async fn abort_rebase(&self, session_id: &str) -> CoreResult<GitOperationResult> {
        let _guard = self.session_locks.acquire(session_id).await;
        let (mut session, project) = self.session_and_project(session_id)?;
        let result = self.git.abort_rebase(&session.target(&project)).await?;
        self.record_rebase_state(&mut session, false, &[])?;
        Ok(result)
    }

    pub async fn continue_rebase(&self, session_id: &str) -> CoreResult<GitOperationResult> {
        let _guard = self.session_locks.acquire(session_id).await;
        let (mut session, project) = self.session_and_project(session_id)?;
        let target = session.target(&project);
        let result = self.git.continue_rebase(&target).await?;
        let pending = self.git.rebase_in_progress(&target).await?;
        self.record_rebase_state(&mut session, pending, result.conflict_paths())?;
        Ok(result)
    }

    pub async fn squash_merge(
        &self,
        session_id: &str,
        commit_message: &str,
    ) -> CoreResult<GitOperationResult> {
        let _guard = self.session_locks.acquire(session_id).await;
        let (session, project) = self.session_and_project(session_id)?;
        if session.rebase_in_progress {
            return Err(CoreError::validation(
                "session",
                format!("Session '{}' has a rebase in progress", session.name),
            ));
        }
        self.git
            .squash_merge(&session.target(&project), commit_message)
            .await
    }

    pub async fn diff(&self, session_id: &str) -> CoreResult<DiffDetails> {
        let _guard = self.session_locks.acquire(session_id).await;
        let (session, project) = self.session_and_project(session_id)?;
        self.git.get_diff_details(&session.target(&project)).await
    }

    pub async fn commits(&self, session_id: &str, limit: usize) -> CoreResult<Vec<CommitInfo>> {
        let _guard = self.session_locks.acquire(session_id).await;
        let (session, project) = self.session_and_project(session_id)?;
        self.git.get_commits(&session.target(&project), limit).await
    }

    pub async fn commit_changes(
        &self,
        session_id: &str,
        commit_hash: &str,
    ) -> CoreResult<Vec<CommitFileChange>> {
        let _guard = self.session_locks.acquire(session_id).await;
        let (session, project) = self.session_and_project(session_id)?;
        self.git
            .get_commit_changes(&session.target(&project), commit_hash)
            .await
    }

    /// Hard reset of the session worktree; callers confirm beforehand.
    pub async fn reset_to_commit(&self, session_id: &str, commit_hash: &str) -> CoreResult<()> {
        let _guard = self.session_locks.acquire(session_id).await;
        let (session, project) = self.session_and_project(session_id)?;
        self.git
            .reset_to_commit(&session.target(&project), commit_hash)
            .await
    }

    pub async fn pull(&self, project_id: &str) -> CoreResult<PullResult> {
        let project = self.get_project(project_id)?;
        self.git.pull(&project.path).await
    }

    pub async fn branches(&self, project_id: &str) -> CoreResult<Vec<BranchInfo>> {
        let project = self.get_project(project_id)?;
        self.git.get_branches(&project.path).await
    }

    pub async fn worktrees(&self, project_id: &str) -> CoreResult<Vec<WorktreeEntry>> {
        let project = self.get_project(project_id)?;
        self.git.list_worktrees(&project.path).await
    }

    // ----- internals -----

    fn worktree_path_for(&self, repo_dir: &str, name: &str) -> PathBuf {
        self.config.worktree_root.join(format!("{repo_dir}-{name}"))
    }

    fn session_and_project(&self, session_id: &str) -> CoreResult<(Session, Project)> {
        let session = self.get_session(session_id)?;
        let project = self.get_project(&session.project_id)?;
        Ok((session, project))
    }

    fn environment_for(
        &self,
        project: &Project,
        session: &Session,
    ) -> CoreResult<Arc<dyn ExecutionEnvironment>> {
        let record = match &session.environment_id {
            Some(id) => Some(self.get_environment(id)?),
            None => None,
        };
        let policy = match session.environment_kind {
            Some(EnvironmentKind::Docker) => CloneLocation::Docker,
            Some(EnvironmentKind::Host) => CloneLocation::Host,
            _ => project.clone_location,
        };
        Ok(self.environments.resolve(record.as_ref(), policy)?)
    }

    fn context_for(&self, session: &Session) -> SessionContext {
        let mut command = if session.command.is_empty() {
            self.config.agent_command.clone()
        } else {
            session.command.clone()
        };
        if let Some(model) = &session.model {
            command.push("--model".to_string());
            command.push(model.clone());
        }
        SessionContext {
            session_id: session.id.clone(),
            session_name: session.name.clone(),
            worktree_path: session.worktree_path.clone(),
            branch_name: session.branch_name.clone(),
            command,
            env: session.env.clone(),
        }
    }

    /// Starts the agent of an `initializing` session and moves it to
    /// `running`.
    async fn launch(&self, project: &Project, session: &mut Session) -> CoreResult<()> {
        let environment = self.environment_for(project, session)?;
        session.environment_kind = Some(environment.kind());
        let context = self.context_for(session);
        let handle = self
            .supervisor
            .start_session(&session.id, environment, &context)
            .await?;
        session.attach(&handle);
        session.touch();
        self.set_status(session, SessionStatus::Running)
    }

    async fn halt_agent(&self, project: &Project, session: &Session) -> CoreResult<()> {
        if self.supervisor.stop(&session.id).await? {
            return Ok(());
        }
        if let Some(handle) = &session.handle {
            if !session.status.is_terminal() {
                let environment = self.environment_for(project, session)?;
                environment.stop(handle).await?;
            }
        }
        Ok(())
    }

    async fn discard_sandbox(&self, project: &Project, session: &Session) {
        match self.supervisor.stop(&session.id).await {
            Ok(_) => {}
            Err(e) => warn!("Failed to stop agent of '{}': {e}", session.name),
        }
        if let Some(handle) = &session.handle {
            if let Ok(environment) = self.environment_for(project, session) {
                if let Err(e) = environment.teardown(handle, false).await {
                    warn!("Failed to tear down {handle}: {e}");
                }
            }
        }
    }

    async fn ensure_worktree(&self, project: &Project, session: &Session) -> CoreResult<()> {
        if session.worktree_path.exists() {
            return Ok(());
        }
        info!(
            "Recreating worktree for session '{}' at {}",
            session.name,
            session.worktree_path.display()
        );
        if self
            .git
            .branch_exists(&project.path, &session.branch_name)
            .await?
        {
            self.git
                .create_worktree_for_existing_branch(
                    &project.path,
                    &session.branch_name,
                    &session.worktree_path,
                )
                .await?;
        } else {
            self.git
                .create_worktree(
                    &project.path,
                    &session.branch_name,
                    &session.worktree_path,
                    &session.base_branch,
                )
                .await?;
        }
        Ok(())
    }

    async fn rollback_worktree(&self, project: &Project, session: &Session) {
        if let Err(e) = self
            .git
            .remove_worktree(
                &project.path,
                &session.worktree_path,
                Some(&session.branch_name),
            )
            .await
        {
            warn!(
                "Failed to roll back worktree {}: {e}",
                session.worktree_path.display()
            );
        }
    }

    fn set_status(&self, session: &mut Session, next: SessionStatus) -> CoreResult<()> {
        let from = session.status;
        session.transition(next)?;
        self.repository.save_session(session)?;
        if from != next {
            debug!("Session '{}': {from} -> {next}", session.name);
            self.events.emit(
                ClaudeworkEvent::SessionStatusChanged,
                EventPayload::Status {
                    session_id: session.id.clone(),
                    from,
                    to: next,
                    error: None,
                },
            );
        }
        Ok(())
    }

    fn fail_session(&self, session: &mut Session, cause: &CoreError) {
        let from = session.status;
        session.fail(cause);
        if let Err(e) = self.repository.save_session(session) {
            warn!("Failed to record error state of '{}': {e}", session.name);
        }
        self.events.emit(
            ClaudeworkEvent::SessionStatusChanged,
            EventPayload::Status {
                session_id: session.id.clone(),
                from,
                to: SessionStatus::Error,
                error: session.error.clone(),
            },
        );
    }

    fn forget_session(&self, session: &Session) {
        if let Err(e) = self.repository.delete_session(&session.id) {
            warn!("Failed to delete record of session '{}': {e}", session.name);
        }
        self.events.emit(
            ClaudeworkEvent::SessionRemoved,
            EventPayload::Session {
                session_id: session.id.clone(),
                name: session.name.clone(),
            },
        );
    }

    fn record_rebase_state(
        &self,
        session: &mut Session,
        in_progress: bool,
        conflicts: &[String],
    ) -> CoreResult<()> {
        if session.rebase_in_progress == in_progress && conflicts.is_empty() {
            return Ok(());
        }
        session.rebase_in_progress = in_progress;
        session.updated_at = Utc::now();
        self.repository.save_session(session)?;
        self.events.emit(
            ClaudeworkEvent::RebaseStateChanged,
            EventPayload::Rebase {
                session_id: session.id.clone(),
                in_progress,
                conflicts: conflicts.to_vec(),
            },
        );
        Ok(())
    }
}

fn single_match<T>(kind: &str, key: &str, mut matches: Vec<T>) -> CoreResult<T> {
    match matches.len() {
        0 => Err(CoreError::not_found(kind, key)),
        1 => Ok(matches.remove(0)),
        n => Err(CoreError::validation(
            kind,
            format!("'{key}' matches {n} {kind}s; use the id instead"),
        )),
    }
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "project".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::environments::EnvironmentError;
    use crate::domains::sessions::test_support::{
        commit_file, failing, fixture, host, request, run_git,
    };
    use std::fs;
    use std::time::Duration;

    const SLEEPER: &[&str] = &["sleep", "30"];

    #[tokio::test]
    async fn create_stop_delete_lifecycle() {
        let fx = fixture(host(), SLEEPER).await;
        let mut rx = fx.events.subscribe();

        let session = fx
            .orchestrator
            .create(request(&fx, Some("fix-login")))
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.branch_name, "session/fix-login");
        assert_eq!(session.base_branch, "main");
        assert!(session.worktree_path.ends_with("repo-fix-login"));
        assert!(session.worktree_path.join("README.md").exists());
        assert!(session.process_id.is_some());
        assert_eq!(
            fx.orchestrator.get_status(&session.id).await.unwrap(),
            EnvironmentStatus::Running
        );
        assert_eq!(rx.recv().await.unwrap().event, ClaudeworkEvent::SessionAdded);
        assert_eq!(
            rx.recv().await.unwrap().event,
            ClaudeworkEvent::SessionStatusChanged
        );

        let stopped = fx.orchestrator.stop(&session.id).await.unwrap();
        assert_eq!(stopped.status, SessionStatus::Completed);
        let again = fx.orchestrator.stop(&session.id).await.unwrap();
        assert_eq!(again.status, SessionStatus::Completed);
        assert_eq!(
            fx.orchestrator.get_status(&session.id).await.unwrap(),
            EnvironmentStatus::Stopped
        );

        fx.orchestrator
            .delete(&session.id, DeleteOptions::default())
            .await
            .unwrap();
        assert!(!session.worktree_path.exists());
        assert!(fx
            .orchestrator
            .get_session(&session.id)
            .unwrap_err()
            .is_not_found());
        assert!(!fx
            .orchestrator
            .git()
            .branch_exists(&fx.project.path, "session/fix-login")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn generated_names_are_unique_and_valid() {
        let fx = fixture(host(), SLEEPER).await;
        let first = fx.orchestrator.create(request(&fx, None)).await.unwrap();
        let second = fx.orchestrator.create(request(&fx, None)).await.unwrap();
        assert_ne!(first.name, second.name);
        assert!(is_valid_session_name(&first.name));
        assert_ne!(first.worktree_path, second.worktree_path);
        fx.orchestrator.shutdown_all().await;
    }

    #[tokio::test]
    async fn bad_or_duplicate_names_are_rejected_before_side_effects() {
        let fx = fixture(host(), SLEEPER).await;
        let err = fx
            .orchestrator
            .create(request(&fx, Some("Bad Name")))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));

        fx.orchestrator
            .create(request(&fx, Some("taken")))
            .await
            .unwrap();
        let err = fx
            .orchestrator
            .create(request(&fx, Some("taken")))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
        assert_eq!(fx.orchestrator.list_sessions(None).unwrap().len(), 1);
        fx.orchestrator.shutdown_all().await;
    }

    #[tokio::test]
    async fn unknown_base_branch_leaves_nothing_behind() {
        let fx = fixture(host(), SLEEPER).await;
        let mut req = request(&fx, Some("orphan"));
        req.base_branch = Some("does-not-exist".into());
        assert!(fx.orchestrator.create(req).await.is_err());
        assert!(fx.orchestrator.list_sessions(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_environment_keeps_record_in_error() {
        let fx = fixture(failing(|| {
            EnvironmentError::unavailable("docker", "daemon not running")
        }), SLEEPER)
        .await;
        let err = fx
            .orchestrator
            .create(request(&fx, Some("boxed")))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());

        let sessions = fx.orchestrator.list_sessions(None).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, SessionStatus::Error);
        assert!(sessions[0]
            .error
            .as_deref()
            .unwrap()
            .contains("daemon not running"));
        assert!(!sessions[0].worktree_path.exists());
        assert!(!fx
            .orchestrator
            .git()
            .branch_exists(&fx.project.path, "session/boxed")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn timed_out_create_rolls_back_completely() {
        let fx = fixture(failing(|| EnvironmentError::Timeout {
            step: "docker run".into(),
            after: Duration::from_secs(1),
        }), SLEEPER)
        .await;
        let err = fx
            .orchestrator
            .create(request(&fx, Some("slow")))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Timeout { .. }));
        assert!(fx.orchestrator.list_sessions(None).unwrap().is_empty());
        assert!(!fx
            .orchestrator
            .git()
            .branch_exists(&fx.project.path, "session/slow")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn restart_recreates_missing_worktree_on_existing_branch() {
        let fx = fixture(host(), SLEEPER).await;
        let session = fx
            .orchestrator
            .create(request(&fx, Some("again")))
            .await
            .unwrap();
        let err = fx.orchestrator.start(&session.id).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));

        fx.orchestrator.stop(&session.id).await.unwrap();
        let path = session.worktree_path.to_string_lossy().to_string();
        run_git(&fx.project.path, &["worktree", "remove", "--force", &path]);
        assert!(!session.worktree_path.exists());

        let restarted = fx.orchestrator.start(&session.id).await.unwrap();
        assert_eq!(restarted.status, SessionStatus::Running);
        assert!(restarted.worktree_path.join("README.md").exists());
        assert_ne!(restarted.process_id, None);
        fx.orchestrator.shutdown_all().await;
        assert_eq!(
            fx.orchestrator.get_session(&session.id).unwrap().status,
            SessionStatus::Stopped
        );
    }

    #[tokio::test]
    async fn delete_project_refuses_with_active_sessions() {
        let fx = fixture(host(), SLEEPER).await;
        let session = fx
            .orchestrator
            .create(request(&fx, Some("busy")))
            .await
            .unwrap();

        match fx.orchestrator.delete_project(&fx.project.id, false).await {
            Err(CoreError::Conflict { paths, .. }) => assert_eq!(paths, vec!["busy".to_string()]),
            other => panic!("expected conflict, got {other:?}"),
        }

        fx.orchestrator
            .delete_project(&fx.project.id, true)
            .await
            .unwrap();
        assert!(fx.orchestrator.list_projects().unwrap().is_empty());
        assert!(fx.orchestrator.list_sessions(None).unwrap().is_empty());
        assert!(!session.worktree_path.exists());
    }

    #[tokio::test]
    async fn rebase_conflict_is_tracked_until_aborted() {
        let fx = fixture(host(), SLEEPER).await;
        let session = fx
            .orchestrator
            .create(request(&fx, Some("conflicting")))
            .await
            .unwrap();
        commit_file(&session.worktree_path, "README.md", "session\n", "session edit");
        commit_file(&fx.project.path, "README.md", "main\n", "main edit");

        let result = fx.orchestrator.rebase(&session.id).await.unwrap();
        assert_eq!(result.conflict_paths(), ["README.md".to_string()]);
        assert!(fx.orchestrator.get_session(&session.id).unwrap().rebase_in_progress);

        let err = fx
            .orchestrator
            .squash_merge(&session.id, "squash")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));

        fx.orchestrator.abort_rebase(&session.id).await.unwrap();
        assert!(!fx.orchestrator.get_session(&session.id).unwrap().rebase_in_progress);
        fx.orchestrator.shutdown_all().await;
    }

    #[tokio::test]
    async fn squash_merge_lands_session_work_on_base() {
        let fx = fixture(host(), SLEEPER).await;
        let session = fx
            .orchestrator
            .create(request(&fx, Some("feature")))
            .await
            .unwrap();
        commit_file(&session.worktree_path, "feature.txt", "work\n", "add feature");

        let commits = fx.orchestrator.commits(&session.id, 10).await.unwrap();
        assert_eq!(commits.len(), 1);
        let diff = fx.orchestrator.diff(&session.id).await.unwrap();
        assert_eq!(diff.files.len(), 1);

        let result = fx
            .orchestrator
            .squash_merge(&session.id, "Add feature")
            .await
            .unwrap();
        assert!(result.success);
        assert!(fx.project.path.join("feature.txt").exists());
        fx.orchestrator.shutdown_all().await;
    }

    #[tokio::test]
    async fn idle_sessions_are_stopped() {
        let fx = fixture(host(), SLEEPER).await;
        let session = fx
            .orchestrator
            .create(request(&fx, Some("sleepy")))
            .await
            .unwrap();
        assert!(fx.orchestrator.stop_idle_sessions(0).await.unwrap().is_empty());
        assert!(fx.orchestrator.stop_idle_sessions(30).await.unwrap().is_empty());

        let mut stale = fx.orchestrator.get_session(&session.id).unwrap();
        stale.last_activity = Some(Utc::now() - chrono::Duration::hours(2));
        fx.orchestrator.repository.save_session(&stale).unwrap();

        let stopped = fx.orchestrator.stop_idle_sessions(30).await.unwrap();
        assert_eq!(stopped, vec![session.id.clone()]);
        assert_eq!(
            fx.orchestrator.get_session(&session.id).unwrap().status,
            SessionStatus::Stopped
        );
    }

    #[tokio::test]
    async fn recorded_activity_defers_idle_stop() {
        let fx = fixture(host(), SLEEPER).await;
        let session = fx
            .orchestrator
            .create(request(&fx, Some("busy")))
            .await
            .unwrap();
        let mut stale = fx.orchestrator.get_session(&session.id).unwrap();
        stale.last_activity = Some(Utc::now() - chrono::Duration::hours(2));
        fx.orchestrator.repository.save_session(&stale).unwrap();

        fx.orchestrator.record_activity(&session.id).await.unwrap();
        assert!(fx.orchestrator.stop_idle_sessions(30).await.unwrap().is_empty());
        assert_eq!(
            fx.orchestrator.get_session(&session.id).unwrap().status,
            SessionStatus::Running
        );
        fx.orchestrator.shutdown_all().await;
    }

    #[tokio::test]
    async fn activity_recorded_while_waiting_for_the_lock_is_honored() {
        let fx = fixture(host(), SLEEPER).await;
        let session = fx
            .orchestrator
            .create(request(&fx, Some("racer")))
            .await
            .unwrap();
        let mut stale = fx.orchestrator.get_session(&session.id).unwrap();
        stale.last_activity = Some(Utc::now() - chrono::Duration::hours(2));
        fx.orchestrator.repository.save_session(&stale).unwrap();

        let guard = fx.orchestrator.session_locks.acquire(&session.id).await;
        let orchestrator = fx.orchestrator.clone();
        let sweep = tokio::spawn(async move { orchestrator.stop_idle_sessions(30).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut fresh = fx.orchestrator.get_session(&session.id).unwrap();
        fresh.touch();
        fx.orchestrator.repository.save_session(&fresh).unwrap();
        drop(guard);

        assert!(sweep.await.unwrap().unwrap().is_empty());
        assert_eq!(
            fx.orchestrator.get_session(&session.id).unwrap().status,
            SessionStatus::Running
        );
        fx.orchestrator.shutdown_all().await;
    }

    #[tokio::test]
    async fn waiting_input_round_trip_and_terminal_rejection() {
        let fx = fixture(host(), SLEEPER).await;
        let session = fx
            .orchestrator
            .create(request(&fx, Some("asker")))
            .await
            .unwrap();
        let waiting = fx.orchestrator.mark_waiting_input(&session.id).await.unwrap();
        assert_eq!(waiting.status, SessionStatus::WaitingInput);
        let running = fx.orchestrator.mark_running(&session.id).await.unwrap();
        assert_eq!(running.status, SessionStatus::Running);

        fx.orchestrator.stop(&session.id).await.unwrap();
        let err = fx.orchestrator.mark_running(&session.id).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn runs_need_a_live_session() {
        let fx = fixture(host(), SLEEPER).await;
        let session = fx
            .orchestrator
            .create(request(&fx, Some("runner")))
            .await
            .unwrap();
        let run_id = fx
            .orchestrator
            .run_script(&session.id, "echo hello")
            .await
            .unwrap();
        let finished = fx.orchestrator.runs().wait(&run_id).await.unwrap();
        assert_eq!(finished.exit_code, Some(0));

        fx.orchestrator.stop(&session.id).await.unwrap();
        let err = fx
            .orchestrator
            .run_script(&session.id, "echo hello")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[tokio::test]
    async fn rehydrate_adopts_live_handles() {
        let fx = fixture(host(), SLEEPER).await;
        let session = fx
            .orchestrator
            .create(request(&fx, Some("survivor")))
            .await
            .unwrap();
        // Simulate a fresh process that only has the stored record.
        assert!(fx.orchestrator.supervisor.supervised(&session.id).unwrap().is_some());
        let live = fx.orchestrator.supervisor.shutdown_all().await;
        assert_eq!(live.len(), 1);
        assert_eq!(fx.orchestrator.rehydrate().unwrap(), 1);
        assert!(fx.orchestrator.supervisor.is_supervised(&session.id));
        assert_eq!(fx.orchestrator.rehydrate().unwrap(), 0);
    }

    #[tokio::test]
    async fn sessions_and_projects_resolve_by_name() {
        let fx = fixture(host(), SLEEPER).await;
        let session = fx
            .orchestrator
            .create(request(&fx, Some("lookup")))
            .await
            .unwrap();
        assert_eq!(fx.orchestrator.find_session("lookup").unwrap().id, session.id);
        assert_eq!(fx.orchestrator.find_session(&session.id).unwrap().name, "lookup");
        assert!(fx.orchestrator.find_session("missing").unwrap_err().is_not_found());
        assert_eq!(fx.orchestrator.find_project("demo").unwrap().id, fx.project.id);
        let by_path = fx.project.path.to_string_lossy().to_string();
        assert_eq!(fx.orchestrator.find_project(&by_path).unwrap().id, fx.project.id);
        fx.orchestrator.shutdown_all().await;
    }

    #[tokio::test]
    async fn register_rejects_non_repositories() {
        let fx = fixture(host(), SLEEPER).await;
        let plain = fx.tmp.path().join("plain");
        fs::create_dir_all(&plain).unwrap();
        let err = fx
            .orchestrator
            .register_project(&plain, None, CloneLocation::Host)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));

        let again = fx
            .orchestrator
            .register_project(&fx.project.path, None, CloneLocation::Host)
            .await
            .unwrap();
        assert_eq!(again.id, fx.project.id);
    }
}
