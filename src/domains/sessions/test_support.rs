//! Fixtures shared by the session tests: a throwaway repository wired to a
//! full orchestrator.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use super::entity::{CreateSessionRequest, Project};
use super::orchestrator::{OrchestratorConfig, OrchestratorDeps, SessionOrchestrator};
use super::repository::InMemorySessionRepository;
use super::supervisor::ProcessSupervisor;
use crate::domains::environments::{
    CloneLocation, EnvironmentError, EnvironmentFactory, EnvironmentKind, EnvironmentRecord,
    ExecutionEnvironment, HostEnvironment, MockExecutionEnvironment,
};
use crate::domains::git::{CliGitRunner, GitTimeouts, GitWorktreeService};
use crate::domains::runs::AdHocRunManager;
use crate::infrastructure::events::{BroadcastEventSink, EventSink};

struct FixedFactory(Arc<dyn ExecutionEnvironment>);

impl EnvironmentFactory for FixedFactory {
    fn resolve(
        &self,
        _record: Option<&EnvironmentRecord>,
        _policy: CloneLocation,
    ) -> Result<Arc<dyn ExecutionEnvironment>, EnvironmentError> {
        Ok(self.0.clone())
    }
}

pub struct Fixture {
    pub tmp: TempDir,
    pub orchestrator: Arc<SessionOrchestrator>,
    pub events: BroadcastEventSink,
    pub project: Project,
}

pub fn run_git(path: &Path, args: &[&str]) {
    let output = Command::new("git")
        .current_dir(path)
        .args(args)
        .output()
        .expect("failed to execute git command");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

pub fn init_repo(path: &Path) {
    fs::create_dir_all(path).unwrap();
    run_git(path, &["init"]);
    run_git(path, &["config", "user.email", "test@example.com"]);
    run_git(path, &["config", "user.name", "Test User"]);
    fs::write(path.join("README.md"), "initial\n").unwrap();
    run_git(path, &["add", "README.md"]);
    run_git(path, &["commit", "-m", "Initial commit"]);
    run_git(path, &["branch", "-M", "main"]);
}

pub fn commit_file(path: &Path, name: &str, contents: &str, message: &str) {
    fs::write(path.join(name), contents).unwrap();
    run_git(path, &["add", name]);
    run_git(path, &["commit", "-m", message]);
}

pub fn host() -> Arc<dyn ExecutionEnvironment> {
    Arc::new(HostEnvironment::new(
        Duration::from_secs(5),
        Duration::from_millis(200),
    ))
}

/// An environment whose `start` always fails with `error()`.
pub fn failing(error: fn() -> EnvironmentError) -> Arc<dyn ExecutionEnvironment> {
    let mut env = MockExecutionEnvironment::new();
    env.expect_name().return_const("docker".to_string());
    env.expect_kind().return_const(EnvironmentKind::Docker);
    env.expect_start().returning(move |_| Err(error()));
    Arc::new(env)
}

pub async fn fixture(env: Arc<dyn ExecutionEnvironment>, agent: &[&str]) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let repo = tmp.path().join("repo");
    init_repo(&repo);

    let events = BroadcastEventSink::new(64);
    let sink: Arc<dyn EventSink> = Arc::new(events.clone());
    let supervisor = Arc::new(ProcessSupervisor::new(Duration::from_secs(2)));
    let runs = Arc::new(AdHocRunManager::new(supervisor.clone(), sink.clone()));
    let orchestrator = SessionOrchestrator::new(
        OrchestratorDeps {
            repository: Arc::new(InMemorySessionRepository::new()),
            git: Arc::new(GitWorktreeService::new(
                Arc::new(CliGitRunner::new()),
                GitTimeouts::default(),
            )),
            environments: Arc::new(FixedFactory(env)),
            supervisor,
            runs,
            events: sink,
        },
        OrchestratorConfig {
            worktree_root: tmp.path().join("worktrees"),
            agent_command: agent.iter().map(|s| s.to_string()).collect(),
            name_generation_attempts: 10,
            keep_volumes: false,
        },
    );
    let project = orchestrator
        .register_project(&repo, Some("demo"), CloneLocation::Host)
        .await
        .unwrap();
    Fixture {
        tmp,
        orchestrator: Arc::new(orchestrator),
        events,
        project,
    }
}

pub fn request(fx: &Fixture, name: Option<&str>) -> CreateSessionRequest {
    CreateSessionRequest {
        project_id: fx.project.id.clone(),
        name: name.map(str::to_string),
        ..Default::default()
    }
}
