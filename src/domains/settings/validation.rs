use super::types::Settings;

pub const MIN_CLONE_TIMEOUT_MINUTES: u64 = 1;
pub const MAX_CLONE_TIMEOUT_MINUTES: u64 = 30;

/// Pulls every numeric knob back into its supported range.
pub fn clamp_settings(settings: &mut Settings) {
    let clone = settings
        .git_clone_timeout_minutes
        .clamp(MIN_CLONE_TIMEOUT_MINUTES, MAX_CLONE_TIMEOUT_MINUTES);
    if clone != settings.git_clone_timeout_minutes {
        log::warn!(
            "git_clone_timeout_minutes {} out of range, using {clone}",
            settings.git_clone_timeout_minutes
        );
        settings.git_clone_timeout_minutes = clone;
    }

    settings.git_timeout_secs = settings.git_timeout_secs.max(1);
    settings.exec_timeout_secs = settings.exec_timeout_secs.max(1);
    settings.status_timeout_secs = settings.status_timeout_secs.max(1);
    settings.name_generation_attempts = settings.name_generation_attempts.max(1);
    settings.docker.readiness_attempts = settings.docker.readiness_attempts.max(1);

    if settings.agent_command.trim().is_empty() {
        log::warn!("Empty agent_command in settings, falling back to 'claude'");
        settings.agent_command = "claude".to_string();
    }
}

pub fn parse_bool_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
