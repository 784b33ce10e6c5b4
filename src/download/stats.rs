//! Per-operation counters and final statistics
//!
//! Each operation owns one [`OperationCounters`]; starting a new operation
//! starts from zero.

use super::item::DownloadMode;
use super::result::ResultCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use uuid::Uuid;

/// What a confirmed video counts as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VideoKind {
    New,
    /// Already on disk, skipped by the downloader
    Old,
    Simulated,
    Clip,
    SliceRemoved,
    Other,
}

/// Why an operation stopped before its queue was exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    Manual,
    VideoLimit,
    SizeLimit,
    TimeLimit,
}

/// Number of jobs per final severity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobTallies {
    pub ok: u64,
    pub warning: u64,
    pub error: u64,
    pub size_limit_abort: u64,
    pub already_done: u64,
    pub stopped: u64,
}

/// Statistics handed to the caller once an operation is finished
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationStats {
    pub operation_id: Uuid,
    pub mode: Option<DownloadMode>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub manual_stop: bool,
    pub stop_reason: Option<StopReason>,
    pub videos_total: u64,
    pub new_videos: u64,
    pub old_videos: u64,
    pub simulated_videos: u64,
    pub clips: u64,
    pub slices_removed: u64,
    pub other_videos: u64,
    pub bytes_downloaded: u64,
    pub restarts: u64,
    pub not_started: u64,
    pub jobs: JobTallies,
}

impl OperationStats {
    /// Duration in seconds, if the operation has finished
    pub fn duration_secs(&self) -> Option<f64> {
        self.stopped_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}

/// Running totals shared by every job of one operation
#[derive(Debug, Default)]
pub struct OperationCounters {
    videos_total: AtomicU64,
    new_videos: AtomicU64,
    old_videos: AtomicU64,
    simulated_videos: AtomicU64,
    clips: AtomicU64,
    slices_removed: AtomicU64,
    other_videos: AtomicU64,
    bytes_downloaded: AtomicU64,
    restarts: AtomicU64,
    not_started: AtomicU64,
    results: [AtomicU64; 6],
    manual_stop: AtomicBool,
}

impl OperationCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a confirmed video, returning the new overall total
    pub fn register_video(&self, kind: VideoKind) -> u64 {
        let counter = match kind {
            VideoKind::New => &self.new_videos,
            VideoKind::Old => &self.old_videos,
            VideoKind::Simulated => &self.simulated_videos,
            VideoKind::Clip => &self.clips,
            VideoKind::SliceRemoved => &self.slices_removed,
            VideoKind::Other => &self.other_videos,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.videos_total.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Add downloaded bytes, returning the new cumulative size
    pub fn register_bytes(&self, bytes: u64) -> u64 {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    pub fn register_result(&self, code: ResultCode) {
        self.results[code as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn register_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn register_not_started(&self, count: u64) {
        self.not_started.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_manual_stop(&self) {
        self.manual_stop.store(true, Ordering::Relaxed);
    }

    pub fn videos_total(&self) -> u64 {
        self.videos_total.load(Ordering::Relaxed)
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::Relaxed)
    }

    /// Copy the counters into a statistics record
    pub fn fill(&self, stats: &mut OperationStats) {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        stats.videos_total = load(&self.videos_total);
        stats.new_videos = load(&self.new_videos);
        stats.old_videos = load(&self.old_videos);
        stats.simulated_videos = load(&self.simulated_videos);
        stats.clips = load(&self.clips);
        stats.slices_removed = load(&self.slices_removed);
        stats.other_videos = load(&self.other_videos);
        stats.bytes_downloaded = load(&self.bytes_downloaded);
        stats.restarts = load(&self.restarts);
        stats.not_started = load(&self.not_started);
        stats.manual_stop = self.manual_stop.load(Ordering::Relaxed);
        stats.jobs = JobTallies {
            ok: load(&self.results[ResultCode::Ok as usize]),
            warning: load(&self.results[ResultCode::Warning as usize]),
            error: load(&self.results[ResultCode::Error as usize]),
            size_limit_abort: load(&self.results[ResultCode::SizeLimitAbort as usize]),
            already_done: load(&self.results[ResultCode::AlreadyDone as usize]),
            stopped: load(&self.results[ResultCode::Stopped as usize]),
        };
    }
}
