use super::error;
use super::output;
use super::run;
use super::{Commands, ConfigAction};
use crate::app::config::Config;
use crate::download::completion_log;
use crate::util::paths::{self, AppFile};
use anyhow::Result;

/// Handle a CLI command and return exit code
pub async fn handle_command(command: Commands, verbose: bool) -> i32 {
    let result = match command {
        Commands::Run(args) => run::handle_run(args, verbose).await,
        Commands::History { limit, json } => handle_history(limit, json),
        Commands::Config { action } => handle_config(action),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            error::ERROR
        }
    }
}

/// Show statistics of previous operations
fn handle_history(limit: Option<usize>, json: bool) -> Result<i32> {
    let logs_dir = paths::app_path(AppFile::Logs)?;
    let mut entries = completion_log::read_operations(&logs_dir)?;

    if let Some(limit) = limit {
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
    }

    println!("{}", output::format_history(&entries, json));
    Ok(error::SUCCESS)
}

fn handle_config(action: ConfigAction) -> Result<i32> {
    match action {
        ConfigAction::Show { json } => {
            let config = Config::load()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
            Ok(error::SUCCESS)
        }
        ConfigAction::Path => {
            println!("{}", paths::app_path(AppFile::Settings)?.display());
            Ok(error::SUCCESS)
        }
        ConfigAction::Init { force } => {
            let path = paths::app_path(AppFile::Settings)?;
            if path.exists() && !force {
                eprintln!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
                return Ok(error::INVALID_INPUT);
            }
            let path = Config::default().save()?;
            println!("Wrote default configuration to {}", path.display());
            Ok(error::SUCCESS)
        }
    }
}
