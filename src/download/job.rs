//! One attempt at downloading (or checking) a single work item
//!
//! ```text
//! starting -> running -> finishing-ok
//!                     -> finishing-error
//!                     -> stalled
//! ```
//!
//! A stall (no stdout for `stall_timeout`) and a network error on stderr both
//! end the attempt with [`JobOutcome::Stalled`]. The owning worker decides
//! whether to start a fresh attempt.

use super::control::{OperationControl, StopLevel};
use super::error::DownloadError;
use super::item::WorkItem;
use super::options::{JobOptions, OptionTranslator};
use super::parser::{OutputParser, StderrClass};
use super::process::{ProcessState, ProcessSupervisor};
use super::progress::{ProgressEvent, ProgressSink, Stage, VideoSignal};
use super::result::{JobOutcome, ResultCode, Severity};
use super::settings::OperationSettings;
use super::stats::VideoKind;
use super::worker::WorkerId;
use crate::media::{MediaKind, MediaRepository};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

/// Downloader errors meaning the video itself is gone
static MISSING_VIDEO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)video unavailable|has been removed|private video|does not exist")
        .expect("Invalid regex pattern")
});

/// Collaborators shared by every job of one operation
pub struct JobContext {
    pub repo: Arc<dyn MediaRepository>,
    pub sink: Arc<dyn ProgressSink>,
    pub translator: Arc<dyn OptionTranslator>,
    pub control: Arc<OperationControl>,
    pub settings: Arc<OperationSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Starting,
    Running,
    FinishingOk,
    FinishingError,
    Stalled,
}

/// Result of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobReport {
    pub outcome: JobOutcome,
    /// Severity accumulated during the attempt, stalled or not
    pub severity: ResultCode,
    pub state: JobState,
    pub playlist_size: Option<u32>,
}

pub struct JobRunner {
    ctx: Arc<JobContext>,
    worker_id: WorkerId,
    item: WorkItem,
    state: JobState,
    severity: Severity,
    parser: OutputParser,
    last_activity: Instant,
    network_error: Option<String>,
    /// A container job ends after its current video once a soft stop arrives
    stop_after_video: bool,
}

impl JobRunner {
    pub fn new(ctx: Arc<JobContext>, worker_id: WorkerId, item: WorkItem) -> Self {
        let parser = OutputParser::new(item.mode.is_simulated(), ctx.settings.filters.clone());
        Self {
            ctx,
            worker_id,
            item,
            state: JobState::Starting,
            severity: Severity::new(),
            parser,
            last_activity: Instant::now(),
            network_error: None,
            stop_after_video: false,
        }
    }

    fn transition(&mut self, next: JobState) {
        tracing::trace!(
            worker_id = self.worker_id,
            item_id = self.item.id,
            "Job {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    pub async fn run(mut self) -> JobReport {
        let options = JobOptions {
            bandwidth_limit: self.ctx.control.bandwidth_limit(),
        };
        let spec = self.ctx.translator.build_command(&self.item, &options);
        self.ctx.sink.report_line(
            self.worker_id,
            &format!("Starting {} ({:?})", self.item.name, self.item.mode),
        );

        let mut process = match ProcessSupervisor::spawn(&spec) {
            Ok(process) => process,
            Err(e) => {
                tracing::error!(item_id = self.item.id, "{}", e);
                self.ctx.repo.record_error(self.item.target, &e.to_string());
                self.severity.set_result(ResultCode::Error);
                return self.finish(JobOutcome::Finished(ResultCode::Error));
            }
        };
        self.transition(JobState::Running);
        self.last_activity = Instant::now();

        let outcome = match self.supervise(&mut process).await {
            Ok(()) => JobOutcome::Finished(self.severity.get()),
            Err(e) if e.is_retryable() => {
                tracing::warn!(item_id = self.item.id, "{}", e);
                self.ctx.sink.report_line(self.worker_id, &e.to_string());
                JobOutcome::Stalled
            }
            Err(e) => {
                tracing::error!(item_id = self.item.id, "{}", e);
                self.severity.set_result(ResultCode::Error);
                JobOutcome::Finished(self.severity.get())
            }
        };
        self.finish(outcome)
    }

    fn finish(mut self, outcome: JobOutcome) -> JobReport {
        let severity = self.severity.get();
        match outcome {
            JobOutcome::Stalled => self.transition(JobState::Stalled),
            JobOutcome::Finished(code) if code <= ResultCode::Warning => {
                self.transition(JobState::FinishingOk)
            }
            JobOutcome::Finished(_) => self.transition(JobState::FinishingError),
        }

        if let JobOutcome::Finished(code) = outcome {
            self.ctx.sink.report_progress(
                self.item.id,
                &ProgressEvent::finished(code, self.parser.playlist_size()),
            );
            self.ctx
                .sink
                .report_line(self.worker_id, &format!("Finished {}: {}", self.item.name, code));
        }

        JobReport {
            outcome,
            severity,
            state: self.state,
            playlist_size: self.parser.playlist_size(),
        }
    }

    /// Drive the process until it exits, stalls or is stopped
    async fn supervise(&mut self, process: &mut ProcessSupervisor) -> Result<(), DownloadError> {
        let stop_rx = self.ctx.control.subscribe();
        let poll_interval = self.ctx.settings.poll_interval;
        let stall_timeout = self.ctx.settings.stall_timeout;

        loop {
            while let Some(line) = process.read_stdout_line() {
                self.last_activity = Instant::now();
                self.handle_stdout(&line).await;
            }
            while let Some(line) = process.read_stderr_line() {
                self.handle_stderr(&line);
            }

            if let Some(message) = self.network_error.take() {
                process.terminate();
                process.wait().await;
                return Err(DownloadError::Network(message));
            }

            let stop_level = *stop_rx.borrow();
            if stop_level == Some(StopLevel::Now)
                || (self.stop_after_video && stop_level.is_some())
            {
                process.terminate();
                process.wait().await;
                self.severity.set_result(ResultCode::Stopped);
                return Ok(());
            }

            if let ProcessState::Exited(code) = process.poll() {
                return self.handle_exit(process, code).await;
            }

            if self.last_activity.elapsed() >= stall_timeout {
                process.terminate();
                process.wait().await;
                return Err(DownloadError::Stalled(stall_timeout));
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn handle_exit(
        &mut self,
        process: &mut ProcessSupervisor,
        code: i32,
    ) -> Result<(), DownloadError> {
        let (stdout, stderr) = process
            .drain_remaining(self.ctx.settings.drain_timeout)
            .await;
        for line in stdout {
            self.handle_stdout(&line).await;
        }
        for line in stderr {
            self.handle_stderr(&line);
        }
        if let Some(message) = self.network_error.take() {
            return Err(DownloadError::Network(message));
        }
        // A negative code is a signal we did not send (ours never reach
        // here), so the download was cut short and counts as an error too
        if code != 0 {
            let e = DownloadError::ProcessExit(code);
            tracing::debug!(item_id = self.item.id, "{}", e);
            self.severity.set_result(ResultCode::Error);
        }
        Ok(())
    }

    async fn handle_stdout(&mut self, line: &str) {
        self.ctx.sink.report_line(self.worker_id, line);
        let event = self.parser.parse_stdout_line(line);
        if event.is_empty() {
            return;
        }

        match event.stage {
            Some(Stage::FilesizeAbort) => self.severity.set_result(ResultCode::SizeLimitAbort),
            Some(Stage::AlreadyDone) if self.item.kind == MediaKind::Video => {
                self.severity.set_result(ResultCode::AlreadyDone)
            }
            _ => {}
        }

        if let Some(signal) = &event.video {
            self.confirm_video(signal).await;
        }
        self.ctx.sink.report_progress(self.item.id, &event);
    }

    async fn confirm_video(&mut self, signal: &VideoSignal) {
        let meta = signal.metadata();
        let video_id = match self.ctx.repo.create_or_update_video(self.item.target, meta) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(item_id = self.item.id, "Could not store video: {}", e);
                None
            }
        };

        let kind = match signal {
            VideoSignal::New(_) => {
                if let Some(id) = video_id {
                    self.ctx.repo.mark_downloaded(id, true);
                }
                if let Some(size) = meta.file_size.filter(|_| self.item.mode.counts_bytes()) {
                    self.ctx
                        .control
                        .register_bytes(size, self.item.ignore_limits)
                        .await;
                }
                VideoKind::New
            }
            VideoSignal::Old(_) => {
                if let Some(id) = video_id {
                    self.ctx.repo.mark_downloaded(id, false);
                }
                VideoKind::Old
            }
            VideoSignal::Simulated(_) => VideoKind::Simulated,
        };
        self.ctx
            .control
            .register_video(kind, self.item.ignore_limits)
            .await;

        if self.item.kind.is_container() && self.ctx.control.stop_level().is_some() {
            self.stop_after_video = true;
        }
    }

    fn handle_stderr(&mut self, line: &str) {
        match self.parser.parse_stderr_line(line) {
            StderrClass::Ignorable => tracing::trace!(item_id = self.item.id, "ignored: {}", line),
            StderrClass::DebugNoise => {}
            StderrClass::Warning(message) => {
                self.severity.set_result(ResultCode::Warning);
                self.ctx.repo.record_warning(self.item.target, &message);
                self.ctx
                    .sink
                    .report_line(self.worker_id, &format!("WARNING: {}", message));
            }
            StderrClass::Error(message) => {
                self.severity.set_result(ResultCode::Error);
                self.ctx.repo.record_error(self.item.target, &message);
                if self.item.kind == MediaKind::Video && MISSING_VIDEO.is_match(&message) {
                    self.ctx.repo.mark_missing(self.item.target);
                }
                self.ctx
                    .sink
                    .report_line(self.worker_id, &format!("ERROR: {}", message));
            }
            StderrClass::NetworkError(message) => {
                self.network_error.get_or_insert(message);
            }
        }
    }
}
