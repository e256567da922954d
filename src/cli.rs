use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::domains::environments::{CloneLocation, EnvironmentKind};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Claudework - isolated, concurrent agent sessions on git worktrees
#[derive(Debug, Parser)]
#[command(
    name = "claudework",
    about = "Claudework - isolated, concurrent agent sessions on git worktrees",
    version = VERSION,
    help_template = "\
{before-help}{name} {version}
{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}

EXAMPLES:
    claudework project add .                 # Register the current repository
    claudework create demo --name fix-login  # Start a session on session/fix-login
    claudework rebase fix-login              # Rebase the session onto its base branch
    claudework merge fix-login -m 'Fix login'
"
)]
pub struct Cli {
    /// Session store to use instead of the per-user default.
    #[arg(long, global = true, value_name = "FILE")]
    pub store: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage registered repositories
    #[command(subcommand)]
    Project(ProjectCommand),

    /// Manage sandbox environments
    #[command(subcommand)]
    Env(EnvCommand),

    /// Show or change settings
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Create a session and start its agent
    Create(CreateArgs),

    /// List sessions
    List {
        /// Only sessions of this project (id, name or path)
        project: Option<String>,
    },

    /// Show one session
    Show { session: String },

    /// Restart the agent of a stopped session
    Start { session: String },

    /// Stop the agent and mark the session completed
    Stop { session: String },

    /// Tear a session down
    Delete {
        session: String,
        /// Leave the session branch in place
        #[arg(long)]
        keep_branch: bool,
    },

    /// Poll the sandbox of a session
    Status { session: String },

    /// Report uncommitted changes and unpushed commits
    Warnings { session: String },

    /// Rebase the session branch onto its base branch
    Rebase { session: String },

    /// Abort a rebase that stopped on conflicts
    AbortRebase { session: String },

    /// Continue a rebase after staging resolutions
    ContinueRebase { session: String },

    /// Squash-merge the session into its base branch
    Merge {
        session: String,
        #[arg(short, long)]
        message: String,
    },

    /// Diff of the session branch against its base
    Diff { session: String },

    /// Commits on the session branch
    Commits {
        session: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Files touched by one commit
    Changes { session: String, commit: String },

    /// Hard-reset the session worktree to a commit
    Reset {
        session: String,
        commit: String,
        /// Confirm discarding everything after the commit
        #[arg(long)]
        yes: bool,
    },

    /// Run a command in the session sandbox and wait for it
    Run {
        session: String,
        /// Command line, interpreted by the shell when it chains commands
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Keep sessions reconciled until interrupted
    Watch {
        /// Seconds between sweeps
        #[arg(long, default_value_t = 60)]
        interval: u64,
        /// Stop every supervised agent on exit
        #[arg(long)]
        stop_on_exit: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum ProjectCommand {
    /// Register a local repository
    Add {
        path: PathBuf,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, value_parser = parse_clone_location, default_value = "host")]
        clone_location: CloneLocation,
    },
    /// Clone a repository and register it
    Clone {
        url: String,
        destination: PathBuf,
        #[arg(long, value_parser = parse_clone_location, default_value = "host")]
        clone_location: CloneLocation,
    },
    List,
    /// Delete a project and its sessions
    Remove {
        project: String,
        /// Delete even when sessions are still live
        #[arg(long)]
        force: bool,
    },
    /// Fast-forward the primary checkout
    Pull { project: String },
    Branches { project: String },
    Worktrees { project: String },
    /// Attach an environment, or clear it without one
    SetEnv {
        project: String,
        environment: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum EnvCommand {
    Add(EnvAddArgs),
    List,
}

#[derive(Debug, Args)]
pub struct EnvAddArgs {
    pub name: String,
    #[arg(long = "type", value_parser = parse_environment_kind)]
    pub kind: EnvironmentKind,
    /// Kind-specific JSON, e.g. '{"image":"node:20"}' or '{"host":"build-box"}'
    #[arg(long, default_value = "{}")]
    pub config: String,
    #[arg(long)]
    pub description: Option<String>,
    /// Host directory with agent credentials mounted into containers
    #[arg(long)]
    pub auth_dir: Option<PathBuf>,
    #[arg(long)]
    pub default: bool,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Effective settings including environment overrides
    Show,
    Set {
        #[arg(value_parser = ["agent-command", "worktree-root", "keep-volumes", "idle-timeout-minutes", "clone-timeout-minutes", "docker-image"])]
        key: String,
        value: String,
    },
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    /// Project id, name or path
    pub project: String,
    #[arg(long)]
    pub name: Option<String>,
    /// Branch to start from; the default branch when omitted
    #[arg(long)]
    pub base: Option<String>,
    #[arg(long)]
    pub model: Option<String>,
    /// Extra agent environment as KEY=VALUE
    #[arg(long = "env", value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,
    /// Agent command overriding the configured one
    #[arg(last = true)]
    pub command: Vec<String>,
}

fn parse_clone_location(raw: &str) -> Result<CloneLocation, String> {
    raw.parse()
}

fn parse_environment_kind(raw: &str) -> Result<EnvironmentKind, String> {
    raw.parse()
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}
