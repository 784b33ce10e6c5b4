//! Shared run state of one operation: stop flag, counters and ceilings

use super::queue::WorkQueue;
use super::settings::OperationLimits;
use super::stats::{OperationCounters, StopReason, VideoKind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::watch;

/// How hard a stop request is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StopLevel {
    /// Stop admitting work; running jobs finish (containers after their current video)
    Soon,
    /// Terminate running subprocesses too
    Now,
}

pub struct OperationControl {
    running: AtomicBool,
    stop_tx: watch::Sender<Option<StopLevel>>,
    stop_reason: Mutex<Option<StopReason>>,
    counters: OperationCounters,
    limits: OperationLimits,
    /// KiB/s, 0 for unlimited
    bandwidth: AtomicU64,
    queue: WorkQueue,
    started: Instant,
}

impl OperationControl {
    pub fn new(queue: WorkQueue, limits: OperationLimits, bandwidth: Option<u64>) -> Self {
        let (stop_tx, _) = watch::channel(None);
        Self {
            running: AtomicBool::new(true),
            stop_tx,
            stop_reason: Mutex::new(None),
            counters: OperationCounters::new(),
            limits,
            bandwidth: AtomicU64::new(bandwidth.unwrap_or(0)),
            queue,
            started: Instant::now(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop_level(&self) -> Option<StopLevel> {
        *self.stop_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<StopLevel>> {
        self.stop_tx.subscribe()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        *self.stop_reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn counters(&self) -> &OperationCounters {
        &self.counters
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    pub fn bandwidth_limit(&self) -> Option<u64> {
        match self.bandwidth.load(Ordering::Relaxed) {
            0 => None,
            kib => Some(kib),
        }
    }

    /// Applies to jobs started from now on
    pub fn set_bandwidth_limit(&self, limit: Option<u64>) {
        self.bandwidth.store(limit.unwrap_or(0), Ordering::Relaxed);
    }

    /// Queue drained with every worker idle; not a stop
    pub fn mark_finished(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Stop the operation
    ///
    /// The first reason wins; the level only ever escalates. Remaining queued
    /// items are abandoned.
    pub async fn stop(&self, level: StopLevel, reason: StopReason) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        {
            let mut current = self.stop_reason.lock().unwrap_or_else(PoisonError::into_inner);
            if current.is_none() {
                *current = Some(reason);
            }
        }
        if reason == StopReason::Manual {
            self.counters.set_manual_stop();
        }
        let escalated = self.stop_tx.send_if_modified(|current| {
            if current.is_none_or(|c| c < level) {
                *current = Some(level);
                true
            } else {
                false
            }
        });
        if was_running || escalated {
            tracing::info!("Stopping operation ({:?}, {:?})", level, reason);
        }

        let abandoned = self.queue.abandon_remaining().await;
        self.counters.register_not_started(abandoned.len() as u64);
    }

    /// Count a confirmed video and enforce the video ceiling
    ///
    /// Items flagged `ignore_limits` count but never trigger a stop.
    pub async fn register_video(&self, kind: VideoKind, ignore_limits: bool) -> u64 {
        let total = self.counters.register_video(kind);
        if !ignore_limits
            && self.is_running()
            && self.limits.max_videos.is_some_and(|max| total >= max)
        {
            tracing::info!("Video limit reached ({})", total);
            self.stop(StopLevel::Soon, StopReason::VideoLimit).await;
        }
        total
    }

    /// Add downloaded bytes and enforce the size ceiling
    pub async fn register_bytes(&self, bytes: u64, ignore_limits: bool) -> u64 {
        let total = self.counters.register_bytes(bytes);
        if !ignore_limits
            && self.is_running()
            && self.limits.max_bytes.is_some_and(|max| total >= max)
        {
            tracing::info!("Size limit reached ({} bytes)", total);
            self.stop(StopLevel::Soon, StopReason::SizeLimit).await;
        }
        total
    }

    /// Enforce the elapsed-time ceiling; true if it fired now
    pub async fn check_time_limit(&self) -> bool {
        let Some(max) = self.limits.max_elapsed else {
            return false;
        };
        if self.is_running() && self.elapsed() >= max {
            tracing::info!("Time limit reached ({:?})", max);
            self.stop(StopLevel::Soon, StopReason::TimeLimit).await;
            return true;
        }
        false
    }
}
