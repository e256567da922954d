use chrono::Local;
use env_logger::Builder;
use log::LevelFilter;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::domains::settings::validation::parse_bool_flag;

static LOG_PATH: Mutex<Option<PathBuf>> = Mutex::new(None);
static LOG_FILE_WRITER: Mutex<Option<BufWriter<File>>> = Mutex::new(None);
static LOGGER_INITIALIZED: Mutex<bool> = Mutex::new(false);

pub const ENABLE_LOGS_ENV: &str = "CLAUDEWORK_ENABLE_LOGS";
pub const RETENTION_HOURS_ENV: &str = "CLAUDEWORK_LOG_RETENTION_HOURS";

const DEFAULT_RETENTION_HOURS: u64 = 72;
const SECONDS_PER_HOUR: u64 = 3_600;

#[derive(Debug)]
struct LoggingConfig {
    file_logging_enabled: bool,
    retention: Duration,
    log_dir: PathBuf,
    deferred_warnings: Vec<String>,
}

impl LoggingConfig {
    fn from_lookup<F>(log_dir: PathBuf, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut deferred_warnings = Vec::new();
        let default_retention = Duration::from_secs(DEFAULT_RETENTION_HOURS * SECONDS_PER_HOUR);

        let retention = match lookup(RETENTION_HOURS_ENV) {
            Some(value) => match value.trim().parse::<u64>() {
                Ok(hours) => Duration::from_secs(hours.saturating_mul(SECONDS_PER_HOUR)),
                Err(_) => {
                    deferred_warnings.push(format!(
                        "Invalid {RETENTION_HOURS_ENV} value '{value}'. Using default {DEFAULT_RETENTION_HOURS} hours."
                    ));
                    default_retention
                }
            },
            None => default_retention,
        };

        let mut file_logging_enabled = cfg!(debug_assertions);
        if let Some(value) = lookup(ENABLE_LOGS_ENV) {
            match parse_bool_flag(&value) {
                Some(flag) => file_logging_enabled = flag,
                None => deferred_warnings.push(format!(
                    "Invalid {ENABLE_LOGS_ENV} value '{value}'. Expected a boolean. Falling back to default ({file_logging_enabled})."
                )),
            }
        }

        Self {
            file_logging_enabled,
            retention,
            log_dir,
            deferred_warnings,
        }
    }
}

pub fn get_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("claudework")
        .join("logs")
}

/// Path of the active log file, if file logging was enabled at startup.
pub fn current_log_path() -> Option<PathBuf> {
    LOG_PATH.lock().ok().and_then(|guard| guard.clone())
}

fn log_file_name() -> String {
    format!("claudework-{}.log", Local::now().format("%Y%m%d-%H%M%S"))
}

/// Console logging via env_logger plus an optional log file. Safe to call
/// more than once; only the first call installs the logger.
pub fn init_logging() {
    {
        let Ok(mut initialized) = LOGGER_INITIALIZED.lock() else {
            return;
        };
        if *initialized {
            return;
        }
        *initialized = true;
    }

    let mut config = LoggingConfig::from_lookup(get_log_dir(), |key| env::var(key).ok());
    let log_path = if config.file_logging_enabled {
        open_log_file(&mut config)
    } else {
        None
    };

    let mut builder = Builder::new();
    if cfg!(test) {
        builder.is_test(true);
    }

    if let Ok(rust_log) = env::var("RUST_LOG") {
        builder.parse_filters(&rust_log);
    } else if config.file_logging_enabled {
        builder.filter_module("claudework", LevelFilter::Debug);
        builder.filter_level(LevelFilter::Warn);
    } else {
        builder.filter_level(LevelFilter::Warn);
    }

    builder.format(move |buf, record| {
        let log_line = format_line(record);
        writeln!(buf, "{log_line}")?;

        if let Ok(mut guard) = LOG_FILE_WRITER.lock() {
            if let Some(ref mut writer) = *guard {
                let _ = writeln!(writer, "{log_line}");
                let _ = writer.flush();
            }
        }

        Ok(())
    });
    builder.target(env_logger::Target::Stderr);

    if builder.try_init().is_err() {
        // Another logger (e.g. a test harness) got there first.
        return;
    }

    log::info!("claudework v{} starting (pid {})", env!("CARGO_PKG_VERSION"), std::process::id());
    match log_path.as_ref() {
        Some(path) => log::info!("Log file: {}", path.display()),
        None => log::info!("File logging disabled. Console logging set to WARN by default."),
    }

    for warning in config.deferred_warnings {
        log::warn!("{warning}");
    }
}

fn open_log_file(config: &mut LoggingConfig) -> Option<PathBuf> {
    if let Err(e) = fs::create_dir_all(&config.log_dir) {
        config.deferred_warnings.push(format!(
            "Failed to create log directory {}: {e}",
            config.log_dir.display()
        ));
        return None;
    }

    let cleanup_warnings = cleanup_old_logs(&config.log_dir, config.retention);
    config.deferred_warnings.extend(cleanup_warnings);

    let candidate = config.log_dir.join(log_file_name());
    match OpenOptions::new().create(true).append(true).open(&candidate) {
        Ok(file) => {
            if let Ok(mut guard) = LOG_FILE_WRITER.lock() {
                *guard = Some(BufWriter::new(file));
            }
            if let Ok(mut guard) = LOG_PATH.lock() {
                *guard = Some(candidate.clone());
            }
            Some(candidate)
        }
        Err(e) => {
            config.deferred_warnings.push(format!(
                "Failed to open log file {}: {e}. Continuing with console logging only.",
                candidate.display()
            ));
            None
        }
    }
}

fn format_line(record: &log::Record<'_>) -> String {
    let level_str = match record.level() {
        log::Level::Error => "ERROR",
        log::Level::Warn => "WARN ",
        log::Level::Info => "INFO ",
        log::Level::Debug => "DEBUG",
        log::Level::Trace => "TRACE",
    };
    format!(
        "[{} {} {}] {}",
        Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        level_str,
        record.target(),
        record.args()
    )
}

fn cleanup_old_logs(log_dir: &Path, retention: Duration) -> Vec<String> {
    if retention.is_zero() {
        return Vec::new();
    }

    let mut warnings = Vec::new();
    let Some(cutoff) = SystemTime::now().checked_sub(retention) else {
        return warnings;
    };
    let Ok(entries) = fs::read_dir(log_dir) else {
        return warnings;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some("log") {
            continue;
        }

        match entry.metadata().and_then(|meta| meta.modified()) {
            Ok(modified) if modified < cutoff => {
                if let Err(e) = fs::remove_file(&path) {
                    warnings.push(format!(
                        "Failed to delete old log file {}: {e}",
                        path.display()
                    ));
                }
            }
            Ok(_) => {}
            Err(_) => warnings.push(format!(
                "Unable to determine age for log file {}",
                path.display()
            )),
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn log_dir_is_namespaced() {
        assert!(get_log_dir().ends_with("claudework/logs"));
        assert!(log_file_name().starts_with("claudework-"));
    }

    #[test]
    fn cleanup_removes_only_logs_older_than_retention() {
        let tmp = TempDir::new().unwrap();
        let log_dir = tmp.path().join("logs");
        fs::create_dir_all(&log_dir).unwrap();

        let old_log = log_dir.join("claudework-old.log");
        let recent_log = log_dir.join("claudework-recent.log");
        let unrelated = log_dir.join("notes.txt");
        fs::write(&old_log, "old").unwrap();
        fs::write(&recent_log, "recent").unwrap();
        fs::write(&unrelated, "keep").unwrap();

        let two_hours_ago = SystemTime::now() - Duration::from_secs(2 * 60 * 60);
        let thirty_minutes_ago = SystemTime::now() - Duration::from_secs(30 * 60);
        set_file_mtime(&old_log, FileTime::from_system_time(two_hours_ago)).unwrap();
        set_file_mtime(&recent_log, FileTime::from_system_time(thirty_minutes_ago)).unwrap();
        set_file_mtime(&unrelated, FileTime::from_system_time(two_hours_ago)).unwrap();

        let warnings = cleanup_old_logs(&log_dir, Duration::from_secs(60 * 60));
        assert!(warnings.is_empty());
        assert!(!old_log.exists());
        assert!(recent_log.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn config_respects_toggle_and_defers_bad_values() {
        let dir = PathBuf::from("/tmp/logs");
        let disabled = LoggingConfig::from_lookup(dir.clone(), |key| {
            (key == ENABLE_LOGS_ENV).then(|| "0".to_string())
        });
        assert!(!disabled.file_logging_enabled);

        let enabled = LoggingConfig::from_lookup(dir.clone(), |key| match key {
            ENABLE_LOGS_ENV => Some("yes".into()),
            RETENTION_HOURS_ENV => Some("2".into()),
            _ => None,
        });
        assert!(enabled.file_logging_enabled);
        assert_eq!(enabled.retention, Duration::from_secs(2 * 3_600));

        let invalid = LoggingConfig::from_lookup(dir, |key| match key {
            ENABLE_LOGS_ENV => Some("sometimes".into()),
            RETENTION_HOURS_ENV => Some("forever".into()),
            _ => None,
        });
        assert_eq!(invalid.deferred_warnings.len(), 2);
        assert_eq!(
            invalid.retention,
            Duration::from_secs(DEFAULT_RETENTION_HOURS * SECONDS_PER_HOUR)
        );
    }

    #[test]
    #[serial]
    fn init_is_idempotent() {
        std::env::set_var(ENABLE_LOGS_ENV, "0");
        init_logging();
        init_logging();
        std::env::remove_var(ENABLE_LOGS_ENV);
        assert!(*LOGGER_INITIALIZED.lock().unwrap());
    }
}
