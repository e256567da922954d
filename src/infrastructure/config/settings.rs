use crate::domains::settings::{Settings, SettingsRepository};
use std::fs;
use std::path::{Path, PathBuf};

pub struct FileSettingsRepository {
    settings_path: PathBuf,
}

impl FileSettingsRepository {
    /// `<config dir>/claudework/settings.json`.
    pub fn new() -> Result<Self, String> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| "Failed to get config directory".to_string())?
            .join("claudework");
        Self::at(&config_dir)
    }

    pub fn at(config_dir: &Path) -> Result<Self, String> {
        if !config_dir.exists() {
            fs::create_dir_all(config_dir)
                .map_err(|e| format!("Failed to create config directory: {e}"))?;
        }

        Ok(Self {
            settings_path: config_dir.join("settings.json"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }
}

impl SettingsRepository for FileSettingsRepository {
    fn load(&self) -> Result<Settings, String> {
        if self.settings_path.exists() {
            let contents = fs::read_to_string(&self.settings_path)
                .map_err(|e| format!("Failed to read settings file: {e}"))?;
            serde_json::from_str(&contents).or_else(|e| {
                log::warn!(
                    "Unparsable settings at {}, using defaults: {e}",
                    self.settings_path.display()
                );
                Ok(Settings::default())
            })
        } else {
            Ok(Settings::default())
        }
    }

    fn save(&self, settings: &Settings) -> Result<(), String> {
        log::debug!("Saving settings to: {:?}", self.settings_path);

        let contents = serde_json::to_string_pretty(settings).map_err(|e| {
            let error = format!("Failed to serialize settings: {e}");
            log::error!("JSON serialization error: {error}");
            error
        })?;

        fs::write(&self.settings_path, &contents).map_err(|e| {
            let error = format!(
                "Failed to write settings file {:?}: {e}",
                self.settings_path
            );
            log::error!("File write error: {error}");
            error
        })?;

        log::debug!("Settings successfully written to disk");
        Ok(())
    }
}
