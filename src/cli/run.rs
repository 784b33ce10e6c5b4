//! `vidherd run`: one download operation from the command line
//!
//! The first Ctrl+C stops the operation once running jobs finish, the second
//! one terminates them.

use super::error;
use super::output;
use super::RunArgs;
use crate::app::config::Config;
use crate::download::completion_log;
use crate::download::item::ItemId;
use crate::download::progress::{NoticeLevel, ProgressEvent, ProgressSink};
use crate::download::stats::OperationStats;
use crate::download::worker::WorkerId;
use crate::download::{DownloadManager, OperationHandle};
use crate::media::memory::InMemoryRepository;
use crate::media::{MediaKind, MediaRepository, TargetId};
use crate::util::paths::{self, AppFile};
use anyhow::{Context, Result};
use regex::Regex;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tokio::signal;

static PROGRESS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[download\]\s+\d+(\.\d+)?%").expect("Invalid regex pattern")
});

/// Prints downloader output and per-item results to the terminal
pub struct ConsoleSink {
    verbose: bool,
}

impl ConsoleSink {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl ProgressSink for ConsoleSink {
    fn report_line(&self, worker_id: WorkerId, text: &str) {
        if !self.verbose && PROGRESS_LINE.is_match(text) {
            return;
        }
        println!("[w{}] {}", worker_id, text);
    }

    fn report_progress(&self, item_id: ItemId, event: &ProgressEvent) {
        if let Some(result) = event.result {
            tracing::debug!(item_id, "Item finished: {}", result);
        }
    }

    fn report_worker_summary(&self, available: usize, total: usize) {
        tracing::debug!("Workers available: {}/{}", available, total);
    }

    fn report_operation_finished(&self, stats: &OperationStats) {
        tracing::info!("Operation {} finished", stats.operation_id);
    }

    fn report_notice(&self, level: NoticeLevel, text: &str) {
        match level {
            NoticeLevel::Info => eprintln!("{}", text),
            NoticeLevel::Warning => eprintln!("Warning: {}", text),
            NoticeLevel::Error => eprintln!("Error: {}", text),
        }
    }
}

/// Guess what a URL points at from its shape
pub fn classify_url(url: &str) -> MediaKind {
    let lower = url.to_lowercase();
    if lower.contains("/playlist") || (lower.contains("list=") && !lower.contains("v=")) {
        MediaKind::Playlist
    } else if ["/channel/", "/c/", "/user/", "/@"]
        .iter()
        .any(|marker| lower.contains(marker))
    {
        MediaKind::Channel
    } else {
        MediaKind::Video
    }
}

/// Look the URL up in the library, adding it as a new root if unknown
pub fn resolve_url(repo: &InMemoryRepository, url: &str, destination: &Path) -> TargetId {
    if let Some(id) = repo.find_by_url(url) {
        return id;
    }
    let id = match classify_url(url) {
        MediaKind::Channel => repo.add_channel(url, url, None, destination),
        MediaKind::Playlist => repo.add_playlist(url, url, None, destination),
        _ => repo.add_video(url, Some(url), None, destination),
    };
    tracing::info!("Added {} to the library as {}", url, id);
    id
}

/// Roots admitted when `run` is given no URL
///
/// Private folders are skipped: they are downloaded only when named.
pub fn library_targets(repo: &InMemoryRepository) -> Vec<TargetId> {
    repo.roots()
        .into_iter()
        .filter(|id| {
            repo.resolve_target(*id)
                .is_some_and(|info| !(info.kind == MediaKind::Folder && info.flags.private))
        })
        .collect()
}

async fn watch_interrupts(handle: OperationHandle) {
    if signal::ctrl_c().await.is_err() {
        return;
    }
    eprintln!("Stopping once running jobs finish (Ctrl+C again to stop now)");
    handle.stop_soon().await;

    if signal::ctrl_c().await.is_err() {
        return;
    }
    eprintln!("Stopping now");
    handle.stop_now().await;
}

fn exit_code(stats: &OperationStats) -> i32 {
    if stats.manual_stop {
        error::INTERRUPTED
    } else if stats.jobs.error > 0 {
        error::JOB_ERRORS
    } else {
        error::SUCCESS
    }
}

pub async fn handle_run(args: RunArgs, verbose: bool) -> Result<i32> {
    let config = Config::load()?;
    let mut settings = config.operation_settings()?;
    if let Some(workers) = args.workers {
        if workers == 0 {
            eprintln!("--workers must be at least 1");
            return Ok(error::INVALID_INPUT);
        }
        settings.worker_count = workers;
    }

    let library_path = match &args.library {
        Some(path) => path.clone(),
        None => paths::app_path(AppFile::Library)?,
    };
    let repo = Arc::new(
        InMemoryRepository::load(&library_path)
            .with_context(|| format!("Failed to load library {}", library_path.display()))?,
    );
    repo.reset_operation_state();

    let destination = args
        .directory
        .clone()
        .unwrap_or_else(|| config.downloader.default_directory.clone());
    let targets: Vec<TargetId> = if args.urls.is_empty() {
        library_targets(&repo)
    } else {
        args.urls
            .iter()
            .map(|url| resolve_url(&repo, url, &destination))
            .collect()
    };
    if targets.is_empty() {
        println!("Nothing to download: the library is empty and no URL was given");
        return Ok(error::NOT_FOUND);
    }

    let mode = args.mode();
    let mut manager = DownloadManager::new(
        settings,
        repo.clone(),
        Arc::new(ConsoleSink::new(verbose)),
        Arc::new(config.translator()),
    );
    let admitted = manager.admit(&targets, mode, args.ignore_limits).await;
    println!(
        "Operation {}: {} items ({:?})",
        manager.operation_id(),
        admitted,
        mode
    );

    let (handle, operation) = manager.start();
    let interrupts = tokio::spawn(watch_interrupts(handle));
    let stats = operation.await.context("Operation task failed")?;
    interrupts.abort();

    repo.save(&library_path)
        .with_context(|| format!("Failed to save library {}", library_path.display()))?;
    let logged = paths::app_path(AppFile::Logs)
        .and_then(|dir| completion_log::append_operation(&stats, &dir));
    match logged {
        Ok(path) => tracing::debug!("Operation logged to {}", path.display()),
        Err(e) => tracing::warn!("Failed to log operation: {}", e),
    }

    println!("{}", output::format_operation_summary(&stats));
    let messages = output::format_target_messages(&repo.records());
    if !messages.is_empty() {
        println!("\n{}", messages);
    }

    Ok(exit_code(&stats))
}
