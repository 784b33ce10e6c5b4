use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use vidherd::cli::{self, Cli};
use vidherd::util::paths::{self, AppFile};

#[tokio::main]
async fn main() {
    // Parse CLI arguments first to get verbose flag and config override
    let cli = Cli::parse();

    if let Some(ref config_dir) = cli.config {
        paths::set_config_dir_override(Some(config_dir.clone()));
    }

    let logs_dir = paths::app_path(AppFile::Logs).unwrap_or_else(|_| PathBuf::from("."));
    std::fs::create_dir_all(&logs_dir).ok();

    // Daily rotating JSON log (vidherd.jsonl.YYYY-MM-DD)
    let file_appender = tracing_appender::rolling::daily(&logs_dir, "vidherd.jsonl");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let log_level = if cli.verbose {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    let stderr_layer = cli.verbose.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(log_level)
    });

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(log_level),
        )
        .with(stderr_layer)
        .init();

    tracing::info!("Starting vidherd {}", env!("CARGO_PKG_VERSION"));
    tracing::trace!("CLI arguments: {:?}", cli);

    let exit_code = cli::handler::handle_command(cli.command, cli.verbose).await;

    // Flush the log writer before exiting
    drop(guard);
    std::process::exit(exit_code);
}
