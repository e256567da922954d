pub mod command;
pub mod docker;
pub mod error;
pub mod factory;
pub mod host;
pub mod process_cleanup;
pub mod ssh;
pub mod types;

use std::path::Path;

use async_trait::async_trait;

pub use docker::DockerEnvironment;
pub use error::EnvironmentError;
pub use factory::{DefaultEnvironmentFactory, EnvironmentFactory};
pub use host::HostEnvironment;
pub use ssh::SshEnvironment;
pub use types::*;

/// A place where a session's agent and ad-hoc commands run.
///
/// `start` fails with [`EnvironmentError::Unavailable`] when the backing
/// daemon or host cannot be reached; `exec` and `status` report that
/// condition as a value instead.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    fn kind(&self) -> EnvironmentKind;

    /// Label used in errors and logs.
    fn name(&self) -> String;

    async fn start(&self, context: &SessionContext) -> Result<EnvironmentHandle, EnvironmentError>;

    /// Stops the agent. Stopping something already gone is not an error.
    async fn stop(&self, handle: &EnvironmentHandle) -> Result<(), EnvironmentError>;

    async fn exec<'a>(
        &self,
        handle: &EnvironmentHandle,
        argv: &[String],
        cwd: Option<&'a Path>,
    ) -> ExecOutcome;

    async fn status(&self, handle: &EnvironmentHandle) -> EnvironmentStatus;

    /// Starts `argv` next to the agent with piped stdout/stderr, for callers
    /// that stream output and control the process themselves.
    async fn spawn(&self, handle: &EnvironmentHandle, argv: &[String]) -> Result<SpawnedCommand, EnvironmentError>;

    /// Terminates, inside the sandbox, a command whose `spawn` recorded
    /// `pid_file`. Killing only the local client would leave it running.
    async fn kill_spawned(&self, handle: &EnvironmentHandle, pid_file: &str) -> Result<(), EnvironmentError>;

    /// Releases everything `start` allocated. `keep_volumes` leaves
    /// persistent storage behind for inspection.
    async fn teardown(&self, handle: &EnvironmentHandle, keep_volumes: bool) -> Result<(), EnvironmentError>;
}
