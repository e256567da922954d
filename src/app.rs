use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use uuid::Uuid;

use crate::cli::{Command, ConfigCommand, CreateArgs, EnvAddArgs, EnvCommand, ProjectCommand};
use crate::domains::environments::{DefaultEnvironmentFactory, EnvironmentRecord};
use crate::domains::git::{CliGitRunner, GitWorktreeService};
use crate::domains::runs::AdHocRunManager;
use crate::domains::sessions::{
    ActivityMonitor, CreateSessionRequest, DeleteOptions, OrchestratorConfig, OrchestratorDeps,
    ProcessSupervisor, SessionOrchestrator, SessionRepository,
};
use crate::domains::settings::{Settings, SettingsService};
use crate::errors::{CoreError, CoreResult};
use crate::infrastructure::events::{BroadcastEventSink, EventSink};
use crate::infrastructure::logging::current_log_path;

/// Everything one process needs, wired from settings and a store.
pub struct App {
    pub orchestrator: Arc<SessionOrchestrator>,
    pub events: BroadcastEventSink,
    settings: Settings,
}

impl App {
    pub fn new(settings: Settings, repository: Arc<dyn SessionRepository>) -> Self {
        let events = BroadcastEventSink::default();
        let sink: Arc<dyn EventSink> = Arc::new(events.clone());
        let supervisor = Arc::new(ProcessSupervisor::new(settings.status_timeout()));
        let runs = Arc::new(AdHocRunManager::new(supervisor.clone(), sink.clone()));
        let git = Arc::new(GitWorktreeService::new(
            Arc::new(CliGitRunner::new()),
            settings.git_timeouts(),
        ));
        let orchestrator = SessionOrchestrator::new(
            OrchestratorDeps {
                repository,
                git,
                environments: Arc::new(DefaultEnvironmentFactory::new(settings.clone())),
                supervisor,
                runs,
                events: sink,
            },
            OrchestratorConfig::from_settings(&settings),
        );
        Self {
            orchestrator: Arc::new(orchestrator),
            events,
            settings,
        }
    }

    /// Adopts the live sandboxes recorded by earlier invocations.
    pub fn rehydrate(&self) -> CoreResult<usize> {
        let adopted = self.orchestrator.rehydrate()?;
        if adopted > 0 {
            info!("Adopted {adopted} running session(s)");
        }
        Ok(adopted)
    }

    /// Executes one command and returns what should be printed.
    pub async fn dispatch(&self, command: Command, settings: &mut SettingsService) -> CoreResult<Value> {
        let o = &self.orchestrator;
        match command {
            Command::Project(cmd) => self.project(cmd).await,
            Command::Env(cmd) => self.env(cmd),
            Command::Config(cmd) => configure(cmd, settings),
            Command::Create(args) => to_json(&o.create(create_request(o, args)?).await?),
            Command::List { project } => {
                let project_id = match project {
                    Some(key) => Some(o.find_project(&key)?.id),
                    None => None,
                };
                to_json(&o.list_sessions(project_id.as_deref())?)
            }
            Command::Show { session } => to_json(&o.find_session(&session)?),
            Command::Start { session } => to_json(&o.start(&self.session_id(&session)?).await?),
            Command::Stop { session } => to_json(&o.stop(&self.session_id(&session)?).await?),
            Command::Delete {
                session,
                keep_branch,
            } => {
                let id = self.session_id(&session)?;
                o.delete(
                    &id,
                    DeleteOptions {
                        delete_branch: !keep_branch,
                    },
                )
                .await?;
                Ok(json!({ "deleted": id }))
            }
            Command::Status { session } => {
                to_json(&o.get_status(&self.session_id(&session)?).await?)
            }
            Command::Warnings { session } => {
                to_json(&o.check_warnings(&self.session_id(&session)?).await?)
            }
            Command::Rebase { session } => to_json(&o.rebase(&self.session_id(&session)?).await?),
            Command::AbortRebase { session } => {
                to_json(&o.abort_rebase(&self.session_id(&session)?).await?)
            }
            Command::ContinueRebase { session } => {
                to_json(&o.continue_rebase(&self.session_id(&session)?).await?)
            }
            Command::Merge { session, message } => {
                to_json(&o.squash_merge(&self.session_id(&session)?, &message).await?)
            }
            Command::Diff { session } => to_json(&o.diff(&self.session_id(&session)?).await?),
            Command::Commits { session, limit } => {
                to_json(&o.commits(&self.session_id(&session)?, limit).await?)
            }
            Command::Changes { session, commit } => {
                to_json(&o.commit_changes(&self.session_id(&session)?, &commit).await?)
            }
            Command::Reset {
                session,
                commit,
                yes,
            } => {
                if !yes {
                    return Err(CoreError::validation(
                        "yes",
                        "reset discards work; pass --yes to confirm",
                    ));
                }
                let id = self.session_id(&session)?;
                o.reset_to_commit(&id, &commit).await?;
                Ok(json!({ "reset": id, "commit": commit }))
            }
            Command::Run { session, command } => {
                let id = self.session_id(&session)?;
                self.run(&id, &command.join(" ")).await
            }
            Command::Watch {
                interval,
                stop_on_exit,
            } => self.watch(Duration::from_secs(interval.max(1)), stop_on_exit).await,
        }
    }

    fn session_id(&self, key: &str) -> CoreResult<String> {
        Ok(self.orchestrator.find_session(key)?.id)
    }

    async fn project(&self, command: ProjectCommand) -> CoreResult<Value> {
        let o = &self.orchestrator;
        match command {
            ProjectCommand::Add {
                path,
                name,
                clone_location,
            } => to_json(&o.register_project(&path, name.as_deref(), clone_location).await?),
            ProjectCommand::Clone {
                url,
                destination,
                clone_location,
            } => to_json(&o.clone_project(&url, &destination, clone_location).await?),
            ProjectCommand::List => to_json(&o.list_projects()?),
            ProjectCommand::Remove { project, force } => {
                let id = o.find_project(&project)?.id;
                o.delete_project(&id, force).await?;
                Ok(json!({ "deleted": id }))
            }
            ProjectCommand::Pull { project } => to_json(&o.pull(&o.find_project(&project)?.id).await?),
            ProjectCommand::Branches { project } => {
                to_json(&o.branches(&o.find_project(&project)?.id).await?)
            }
            ProjectCommand::Worktrees { project } => {
                to_json(&o.worktrees(&o.find_project(&project)?.id).await?)
            }
            ProjectCommand::SetEnv {
                project,
                environment,
            } => {
                let id = o.find_project(&project)?.id;
                to_json(&o.set_project_environment(&id, environment.as_deref())?)
            }
        }
    }

    fn env(&self, command: EnvCommand) -> CoreResult<Value> {
        match command {
            EnvCommand::Add(args) => to_json(&self.orchestrator.save_environment(environment_record(args)?)?),
            EnvCommand::List => to_json(&self.orchestrator.list_environments()?),
        }
    }

    async fn run(&self, session_id: &str, command: &str) -> CoreResult<Value> {
        let runs = self.orchestrator.runs();
        let run_id = self.orchestrator.run_script(session_id, command).await?;
        let snapshot = tokio::select! {
            finished = runs.wait(&run_id) => finished?,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted; stopping run {run_id}");
                runs.stop(&run_id).await?
            }
        };
        let logs = runs.logs(&run_id).unwrap_or_default();
        runs.take_finished(&run_id);
        Ok(json!({ "run": to_json(&snapshot)?, "logs": to_json(&logs)? }))
    }

    async fn watch(&self, period: Duration, stop_on_exit: bool) -> CoreResult<Value> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = ActivityMonitor::new(
            self.orchestrator.clone(),
            self.settings.idle_timeout_minutes,
        );
        let task = tokio::spawn(monitor.start_polling(period, shutdown_rx));
        info!("Watching sessions every {period:?}; press Ctrl-C to exit");

        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {e}");
        }
        let _ = shutdown_tx.send(true);
        if let Err(e) = task.await {
            warn!("Activity monitor ended abnormally: {e}");
        }
        if stop_on_exit {
            self.orchestrator.shutdown_all().await;
        }
        Ok(json!({ "watching": false }))
    }
}

fn create_request(o: &SessionOrchestrator, args: CreateArgs) -> CoreResult<CreateSessionRequest> {
    Ok(CreateSessionRequest {
        project_id: o.find_project(&args.project)?.id,
        name: args.name,
        base_branch: args.base,
        model: args.model,
        command: (!args.command.is_empty()).then_some(args.command),
        env: args.env,
    })
}

fn environment_record(args: EnvAddArgs) -> CoreResult<EnvironmentRecord> {
    let config: Value = serde_json::from_str(&args.config)
        .map_err(|e| CoreError::validation("config", format!("not valid JSON: {e}")))?;
    if !config.is_object() {
        return Err(CoreError::validation("config", "must be a JSON object"));
    }
    Ok(EnvironmentRecord {
        id: Uuid::new_v4().to_string(),
        name: args.name,
        kind: args.kind,
        description: args.description,
        config,
        auth_dir_path: args.auth_dir,
        is_default: args.default,
    })
}

fn configure(command: ConfigCommand, settings: &mut SettingsService) -> CoreResult<Value> {
    match command {
        ConfigCommand::Show => {
            let mut shown = to_json(&settings.effective())?;
            if let Value::Object(fields) = &mut shown {
                let log_file = current_log_path().map(|path| path.display().to_string());
                fields.insert("log_file".to_string(), json!(log_file));
            }
            Ok(shown)
        }
        ConfigCommand::Set { key, value } => {
            let result = match key.as_str() {
                "agent-command" => settings.set_agent_command(value),
                "worktree-root" => settings.set_worktree_root(
                    (!value.trim().is_empty()).then(|| value.trim().into()),
                ),
                "keep-volumes" => settings.set_debug_mode_keep_volumes(parse_flag(&value)?),
                "idle-timeout-minutes" => settings.set_idle_timeout_minutes(parse_number(&key, &value)?),
                "clone-timeout-minutes" => {
                    settings.set_git_clone_timeout_minutes(parse_number(&key, &value)?)
                }
                "docker-image" => settings.set_docker_image(value),
                other => return Err(CoreError::validation("key", format!("unknown setting '{other}'"))),
            };
            result.map_err(|e| CoreError::validation(&key, e))?;
            to_json(settings.stored())
        }
    }
}

fn parse_flag(value: &str) -> CoreResult<bool> {
    crate::domains::settings::validation::parse_bool_flag(value)
        .ok_or_else(|| CoreError::validation("value", format!("'{value}' is not a boolean")))
}

fn parse_number(key: &str, value: &str) -> CoreResult<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| CoreError::validation(key, format!("'{value}' is not a number")))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> CoreResult<Value> {
    serde_json::to_value(value).map_err(|e| CoreError::Internal {
        message: format!("Failed to serialize output: {e}"),
    })
}

/// Process exit status for a failed command.
pub fn exit_code(error: &CoreError) -> i32 {
    match error {
        CoreError::Validation { .. } | CoreError::InvalidTransition { .. } => 2,
        CoreError::NotFound { .. } => 3,
        CoreError::Conflict { .. } => 4,
        CoreError::EnvironmentUnavailable { .. } => 5,
        CoreError::Timeout { .. } => 6,
        CoreError::Git { .. } | CoreError::Internal { .. } => 1,
    }
}
