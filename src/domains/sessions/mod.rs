pub mod activity;
pub mod entity;
pub mod naming;
pub mod orchestrator;
pub mod repository;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod test_support;

pub use activity::{ActivityMonitor, SweepReport};
pub use entity::{CreateSessionRequest, Project, Session, SessionStatus};
pub use orchestrator::{DeleteOptions, OrchestratorConfig, OrchestratorDeps, SessionOrchestrator};
pub use repository::{InMemorySessionRepository, SessionRepository};
pub use supervisor::ProcessSupervisor;
