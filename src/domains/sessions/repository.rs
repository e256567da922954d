use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::domains::environments::EnvironmentRecord;
use crate::domains::sessions::entity::{Project, Session};

/// Persistence port for projects, sessions and environment records.
/// Writes are whole-record upserts keyed by id.
pub trait SessionRepository: Send + Sync {
    fn get_project(&self, id: &str) -> Result<Option<Project>>;
    fn list_projects(&self) -> Result<Vec<Project>>;
    fn save_project(&self, project: &Project) -> Result<()>;
    fn delete_project(&self, id: &str) -> Result<bool>;

    fn get_environment(&self, id: &str) -> Result<Option<EnvironmentRecord>>;
    fn list_environments(&self) -> Result<Vec<EnvironmentRecord>>;
    fn save_environment(&self, record: &EnvironmentRecord) -> Result<()>;

    fn get_session(&self, id: &str) -> Result<Option<Session>>;
    /// Sessions of one project, or of all projects when `project_id` is `None`.
    fn list_sessions(&self, project_id: Option<&str>) -> Result<Vec<Session>>;
    fn save_session(&self, session: &Session) -> Result<()>;
    fn delete_session(&self, id: &str) -> Result<bool>;
}

#[derive(Default)]
struct Tables {
    projects: HashMap<String, Project>,
    environments: HashMap<String, EnvironmentRecord>,
    sessions: HashMap<String, Session>,
}

/// Process-local repository for embedding and tests.
#[derive(Default)]
pub struct InMemorySessionRepository {
    tables: Mutex<Tables>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> Result<T> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| anyhow::anyhow!("session repository lock poisoned"))?;
        Ok(f(&mut tables))
    }
}

fn by_creation<T>(mut items: Vec<T>, key: impl Fn(&T) -> chrono::DateTime<chrono::Utc>) -> Vec<T> {
    items.sort_by_key(|item| key(item));
    items
}

impl SessionRepository for InMemorySessionRepository {
    fn get_project(&self, id: &str) -> Result<Option<Project>> {
        self.with(|t| t.projects.get(id).cloned())
    }

    fn list_projects(&self) -> Result<Vec<Project>> {
        let projects: Vec<Project> = self.with(|t| t.projects.values().cloned().collect())?;
        Ok(by_creation(projects, |p: &Project| p.created_at))
    }

    fn save_project(&self, project: &Project) -> Result<()> {
        self.with(|t| {
            t.projects.insert(project.id.clone(), project.clone());
        })
    }

    fn delete_project(&self, id: &str) -> Result<bool> {
        self.with(|t| {
            t.sessions.retain(|_, s| s.project_id != id);
            t.projects.remove(id).is_some()
        })
    }

    fn get_environment(&self, id: &str) -> Result<Option<EnvironmentRecord>> {
        self.with(|t| t.environments.get(id).cloned())
    }

    fn list_environments(&self) -> Result<Vec<EnvironmentRecord>> {
        self.with(|t| {
            let mut records: Vec<_> = t.environments.values().cloned().collect();
            records.sort_by(|a, b| a.name.cmp(&b.name));
            records
        })
    }

    fn save_environment(&self, record: &EnvironmentRecord) -> Result<()> {
        self.with(|t| {
            t.environments.insert(record.id.clone(), record.clone());
        })
    }

    fn get_session(&self, id: &str) -> Result<Option<Session>> {
        self.with(|t| t.sessions.get(id).cloned())
    }

    fn list_sessions(&self, project_id: Option<&str>) -> Result<Vec<Session>> {
        let sessions: Vec<Session> = self.with(|t| {
            t.sessions
                .values()
                .filter(|s| project_id.map_or(true, |id| s.project_id == id))
                .cloned()
                .collect()
        })?;
        Ok(by_creation(sessions, |s: &Session| s.created_at))
    }

    fn save_session(&self, session: &Session) -> Result<()> {
        self.with(|t| {
            t.sessions.insert(session.id.clone(), session.clone());
        })
    }

    fn delete_session(&self, id: &str) -> Result<bool> {
        self.with(|t| t.sessions.remove(id).is_some())
    }
}
