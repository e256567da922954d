use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use claudework::app::{exit_code, App};
use claudework::cli::Cli;
use claudework::domains::sessions::SessionRepository;
use claudework::domains::settings::SettingsService;
use claudework::infrastructure::config::FileSettingsRepository;
use claudework::infrastructure::logging::init_logging;
use claudework::infrastructure::storage::JsonFileRepository;

fn open_store(path: Option<&Path>) -> anyhow::Result<Arc<dyn SessionRepository>> {
    let store = match path {
        Some(path) => JsonFileRepository::open(path)?,
        None => JsonFileRepository::open_default()?,
    };
    info!("Using session store {}", store.path().display());
    Ok(Arc::new(store))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let settings_repository = match FileSettingsRepository::new() {
        Ok(repository) => repository,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let mut settings = SettingsService::new(Box::new(settings_repository));
    let repository = match open_store(cli.store.as_deref()) {
        Ok(repository) => repository,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let app = App::new(settings.effective(), repository);
    if let Err(e) = app.rehydrate() {
        error!("Failed to adopt running sessions: {e}");
    }

    match app.dispatch(cli.command, &mut settings).await {
        Ok(output) => {
            match serde_json::to_string_pretty(&output) {
                Ok(text) => println!("{text}"),
                Err(e) => {
                    eprintln!("error: {e}");
                    return ExitCode::FAILURE;
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            if let Ok(details) = serde_json::to_string_pretty(&e) {
                println!("{details}");
            }
            eprintln!("error: {e}");
            ExitCode::from(exit_code(&e) as u8)
        }
    }
}
