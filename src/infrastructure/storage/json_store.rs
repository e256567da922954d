use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::domains::environments::EnvironmentRecord;
use crate::domains::sessions::{Project, Session, SessionRepository};

const STORE_VERSION: u32 = 1;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    projects: BTreeMap<String, Project>,
    #[serde(default)]
    environments: BTreeMap<String, EnvironmentRecord>,
    #[serde(default)]
    sessions: BTreeMap<String, Session>,
}

/// Session store backed by a single JSON document. Every write replaces the
/// file through a temp file and rename, so readers never see a torn store.
pub struct JsonFileRepository {
    path: PathBuf,
    document: Mutex<StoreDocument>,
}

impl JsonFileRepository {
    /// `<data dir>/claudework/store.json`.
    pub fn open_default() -> Result<Self> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to get data directory")?
            .join("claudework");
        Self::open(&data_dir.join("store.json"))
    }

    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create store directory {}", parent.display()))?;
        }
        let document = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read store {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Store {} is not valid JSON", path.display()))?
        } else {
            StoreDocument {
                version: STORE_VERSION,
                ..StoreDocument::default()
            }
        };
        log::debug!("Opened session store at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            document: Mutex::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read<T>(&self, f: impl FnOnce(&StoreDocument) -> T) -> Result<T> {
        let document = self
            .document
            .lock()
            .map_err(|_| anyhow::anyhow!("session store lock poisoned"))?;
        Ok(f(&document))
    }

    /// Applies `f` to a copy and only adopts it once the copy is on disk.
    fn write<T>(&self, f: impl FnOnce(&mut StoreDocument) -> T) -> Result<T> {
        let mut document = self
            .document
            .lock()
            .map_err(|_| anyhow::anyhow!("session store lock poisoned"))?;
        let mut next = document.clone();
        let out = f(&mut next);
        next.version = STORE_VERSION;
        self.persist(&next)?;
        *document = next;
        Ok(out)
    }

    fn persist(&self, document: &StoreDocument) -> Result<()> {
        let contents =
            serde_json::to_string_pretty(document).context("Failed to serialize session store")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl SessionRepository for JsonFileRepository {
    fn get_project(&self, id: &str) -> Result<Option<Project>> {
        self.read(|d| d.projects.get(id).cloned())
    }

    fn list_projects(&self) -> Result<Vec<Project>> {
        let mut projects: Vec<Project> = self.read(|d| d.projects.values().cloned().collect())?;
        projects.sort_by_key(|p| p.created_at);
        Ok(projects)
    }

    fn save_project(&self, project: &Project) -> Result<()> {
        self.write(|d| {
            d.projects.insert(project.id.clone(), project.clone());
        })
    }

    fn delete_project(&self, id: &str) -> Result<bool> {
        self.write(|d| {
            d.sessions.retain(|_, s| s.project_id != id);
            d.projects.remove(id).is_some()
        })
    }

    fn get_environment(&self, id: &str) -> Result<Option<EnvironmentRecord>> {
        self.read(|d| d.environments.get(id).cloned())
    }

    fn list_environments(&self) -> Result<Vec<EnvironmentRecord>> {
        let mut records: Vec<EnvironmentRecord> =
            self.read(|d| d.environments.values().cloned().collect())?;
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    fn save_environment(&self, record: &EnvironmentRecord) -> Result<()> {
        self.write(|d| {
            d.environments.insert(record.id.clone(), record.clone());
        })
    }

    fn get_session(&self, id: &str) -> Result<Option<Session>> {
        self.read(|d| d.sessions.get(id).cloned())
    }

    fn list_sessions(&self, project_id: Option<&str>) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self.read(|d| {
            d.sessions
                .values()
                .filter(|s| project_id.map_or(true, |id| s.project_id == id))
                .cloned()
                .collect()
        })?;
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    fn save_session(&self, session: &Session) -> Result<()> {
        self.write(|d| {
            d.sessions.insert(session.id.clone(), session.clone());
        })
    }

    fn delete_session(&self, id: &str) -> Result<bool> {
        self.write(|d| d.sessions.remove(id).is_some())
    }
}
