pub mod service;
pub mod types;
pub mod validation;

pub use service::{apply_env_overrides, SettingsRepository, SettingsService, SettingsServiceError};
pub use types::*;
