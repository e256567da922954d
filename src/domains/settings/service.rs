use super::types::*;
use super::validation::{clamp_settings, parse_bool_flag};
use std::path::PathBuf;

pub const KEEP_VOLUMES_ENV: &str = "CLAUDEWORK_KEEP_VOLUMES";
pub const WORKTREE_ROOT_ENV: &str = "CLAUDEWORK_WORKTREE_ROOT";

#[derive(Debug, Clone)]
pub enum SettingsServiceError {
    InvalidValue { field: String, message: String },
    RepositoryError(String),
}

impl std::fmt::Display for SettingsServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsServiceError::InvalidValue { field, message } => {
                write!(f, "Invalid value for {field}: {message}")
            }
            SettingsServiceError::RepositoryError(msg) => write!(f, "Repository error: {msg}"),
        }
    }
}

impl std::error::Error for SettingsServiceError {}

pub trait SettingsRepository: Send + Sync {
    fn load(&self) -> Result<Settings, String>;
    fn save(&self, settings: &Settings) -> Result<(), String>;
}

pub struct SettingsService {
    repository: Box<dyn SettingsRepository>,
    settings: Settings,
}

impl SettingsService {
    pub fn new(repository: Box<dyn SettingsRepository>) -> Self {
        let mut settings = repository.load().unwrap_or_else(|e| {
            log::warn!("Falling back to default settings: {e}");
            Settings::default()
        });
        clamp_settings(&mut settings);

        Self {
            repository,
            settings,
        }
    }

    fn save(&mut self) -> Result<(), SettingsServiceError> {
        self.repository
            .save(&self.settings)
            .map_err(SettingsServiceError::RepositoryError)
    }

    /// Stored settings without environment overrides.
    pub fn stored(&self) -> &Settings {
        &self.settings
    }

    /// Stored settings with process environment overrides applied.
    pub fn effective(&self) -> Settings {
        apply_env_overrides(self.settings.clone(), |key| std::env::var(key).ok())
    }

    pub fn set_git_clone_timeout_minutes(&mut self, minutes: u64) -> Result<(), SettingsServiceError> {
        if !(super::validation::MIN_CLONE_TIMEOUT_MINUTES..=super::validation::MAX_CLONE_TIMEOUT_MINUTES)
            .contains(&minutes)
        {
            return Err(SettingsServiceError::InvalidValue {
                field: "git_clone_timeout_minutes".into(),
                message: format!("{minutes} is outside 1-30"),
            });
        }
        self.settings.git_clone_timeout_minutes = minutes;
        self.save()
    }

    pub fn set_debug_mode_keep_volumes(&mut self, keep: bool) -> Result<(), SettingsServiceError> {
        self.settings.debug_mode_keep_volumes = keep;
        self.save()
    }

    pub fn set_worktree_root(&mut self, root: Option<PathBuf>) -> Result<(), SettingsServiceError> {
        if let Some(path) = &root {
            if !path.is_absolute() {
                return Err(SettingsServiceError::InvalidValue {
                    field: "worktree_root".into(),
                    message: format!("{} is not an absolute path", path.display()),
                });
            }
        }
        self.settings.worktree_root = root;
        self.save()
    }

    pub fn set_agent_command(&mut self, command: String) -> Result<(), SettingsServiceError> {
        if shell_words::split(&command).map(|argv| argv.is_empty()).unwrap_or(true) {
            return Err(SettingsServiceError::InvalidValue {
                field: "agent_command".into(),
                message: "must be a non-empty, well-quoted command line".into(),
            });
        }
        self.settings.agent_command = command;
        self.save()
    }

    pub fn set_idle_timeout_minutes(&mut self, minutes: u64) -> Result<(), SettingsServiceError> {
        self.settings.idle_timeout_minutes = minutes;
        self.save()
    }

    pub fn set_docker_image(&mut self, image: String) -> Result<(), SettingsServiceError> {
        if image.trim().is_empty() {
            return Err(SettingsServiceError::InvalidValue {
                field: "docker.image".into(),
                message: "must not be empty".into(),
            });
        }
        self.settings.docker.image = image;
        self.save()
    }
}

/// Applies `CLAUDEWORK_KEEP_VOLUMES` and `CLAUDEWORK_WORKTREE_ROOT`.
/// Unparsable values are ignored with a warning.
pub fn apply_env_overrides<F>(mut settings: Settings, lookup: F) -> Settings
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(KEEP_VOLUMES_ENV) {
        match parse_bool_flag(&raw) {
            Some(keep) => settings.debug_mode_keep_volumes = keep,
            None => log::warn!("Ignoring invalid {KEEP_VOLUMES_ENV} value '{raw}'"),
        }
    }
    if let Some(raw) = lookup(WORKTREE_ROOT_ENV) {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            log::warn!("Ignoring empty {WORKTREE_ROOT_ENV}");
        } else {
            settings.worktree_root = Some(PathBuf::from(trimmed));
        }
    }
    settings
}
