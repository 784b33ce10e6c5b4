//! Progress reporting towards the user interface
//!
//! The engine never talks to a UI directly. Everything it wants to show goes
//! through a [`ProgressSink`]: status lines per worker, structured progress per
//! work item, the worker availability summary and the final statistics.

use super::item::ItemId;
use super::result::ResultCode;
use super::stats::OperationStats;
use super::worker::WorkerId;
use crate::media::VideoMetadata;
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Stage of a job as announced by the downloader output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Pending,
    Downloading,
    PostProcessing,
    Checking,
    AlreadyDone,
    FilesizeAbort,
}

/// Video confirmed by a sequence of output lines
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "video", rename_all = "lowercase")]
pub enum VideoSignal {
    /// Freshly downloaded file
    New(VideoMetadata),
    /// File was already on disk
    Old(VideoMetadata),
    /// Metadata fetched without downloading
    Simulated(VideoMetadata),
}

impl VideoSignal {
    pub fn metadata(&self) -> &VideoMetadata {
        match self {
            VideoSignal::New(m) | VideoSignal::Old(m) | VideoSignal::Simulated(m) => m,
        }
    }
}

/// Structured progress payload, every field optional
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub stage: Option<Stage>,
    pub percent: Option<f32>,
    pub eta: Option<String>,
    pub speed: Option<String>,
    pub size: Option<String>,
    pub path: Option<PathBuf>,
    pub filename: Option<String>,
    pub extension: Option<String>,
    pub playlist_index: Option<u32>,
    pub playlist_size: Option<u32>,
    pub video: Option<VideoSignal>,
    /// Set only on the final event of a job
    pub result: Option<ResultCode>,
}

impl ProgressEvent {
    /// True if the line carried nothing worth reporting
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Final event of a job: transient fields blank so no stale progress remains
    pub fn finished(result: ResultCode, playlist_size: Option<u32>) -> Self {
        Self {
            playlist_size,
            result: Some(result),
            ..Self::default()
        }
    }
}

/// Severity of a user-facing notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Receiver of everything the engine wants to display
pub trait ProgressSink: Send + Sync {
    fn report_line(&self, worker_id: WorkerId, text: &str);

    fn report_progress(&self, item_id: ItemId, event: &ProgressEvent);

    fn report_worker_summary(&self, available: usize, total: usize);

    fn report_operation_finished(&self, stats: &OperationStats);

    fn report_notice(&self, level: NoticeLevel, text: &str) {
        match level {
            NoticeLevel::Info => tracing::info!("{}", text),
            NoticeLevel::Warning => tracing::warn!("{}", text),
            NoticeLevel::Error => tracing::error!("{}", text),
        }
    }
}

/// Sink that only writes to the tracing log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn report_line(&self, worker_id: WorkerId, text: &str) {
        tracing::debug!(worker_id, "{}", text);
    }

    fn report_progress(&self, item_id: ItemId, event: &ProgressEvent) {
        tracing::trace!(item_id, ?event, "progress");
    }

    fn report_worker_summary(&self, available: usize, total: usize) {
        tracing::debug!("Workers available: {}/{}", available, total);
    }

    fn report_operation_finished(&self, stats: &OperationStats) {
        tracing::info!(
            "Operation finished: {} videos ({} new, {} simulated), {} bytes",
            stats.videos_total,
            stats.new_videos,
            stats.simulated_videos,
            stats.bytes_downloaded
        );
    }
}

/// Everything reported to a [`ChannelSink`]
#[derive(Debug, Clone)]
pub enum SinkEvent {
    Line { worker_id: WorkerId, text: String },
    Progress { item_id: ItemId, event: ProgressEvent },
    WorkerSummary { available: usize, total: usize },
    Finished(OperationStats),
    Notice { level: NoticeLevel, text: String },
}

/// Sink forwarding every report over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SinkEvent) {
        // Receiver gone means nobody is watching anymore
        let _ = self.tx.send(event);
    }
}

impl ProgressSink for ChannelSink {
    fn report_line(&self, worker_id: WorkerId, text: &str) {
        self.send(SinkEvent::Line {
            worker_id,
            text: text.to_string(),
        });
    }

    fn report_progress(&self, item_id: ItemId, event: &ProgressEvent) {
        self.send(SinkEvent::Progress {
            item_id,
            event: event.clone(),
        });
    }

    fn report_worker_summary(&self, available: usize, total: usize) {
        self.send(SinkEvent::WorkerSummary { available, total });
    }

    fn report_operation_finished(&self, stats: &OperationStats) {
        self.send(SinkEvent::Finished(stats.clone()));
    }

    fn report_notice(&self, level: NoticeLevel, text: &str) {
        self.send(SinkEvent::Notice {
            level,
            text: text.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finished_event_blanks_transient_fields() {
        let event = ProgressEvent::finished(ResultCode::Warning, Some(3));
        assert_eq!(event.result, Some(ResultCode::Warning));
        assert_eq!(event.playlist_size, Some(3));
        assert!(event.percent.is_none());
        assert!(event.eta.is_none());
        assert!(event.speed.is_none());
        assert!(event.stage.is_none());
    }

    #[test]
    fn test_default_event_is_empty() {
        assert!(ProgressEvent::default().is_empty());
        let event = ProgressEvent {
            percent: Some(1.0),
            ..ProgressEvent::default()
        };
        assert!(!event.is_empty());
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::new();
        sink.report_line(1, "hello");
        sink.report_worker_summary(2, 3);

        match rx.recv().await {
            Some(SinkEvent::Line { worker_id, text }) => {
                assert_eq!(worker_id, 1);
                assert_eq!(text, "hello");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            rx.recv().await,
            Some(SinkEvent::WorkerSummary { available: 2, total: 3 })
        ));
    }
}
