pub mod branches;
pub mod diff;
pub mod history;
pub mod operations;
pub mod runner;
pub mod service;
pub mod types;
pub mod worktrees;

pub use runner::{CliGitRunner, GitCommandError, GitFailureKind, GitOutput, GitRunner};
pub use service::{GitTimeouts, GitWorktreeService};
pub use types::*;
