#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vidherd::download::item::{ItemId, WorkItem};
use vidherd::download::options::{CommandSpec, JobOptions, OptionTranslator};
use vidherd::download::progress::{NoticeLevel, ProgressEvent, ProgressSink};
use vidherd::download::result::ResultCode;
use vidherd::download::settings::{OperationSettings, RestartPolicies, RestartPolicy};
use vidherd::download::stats::OperationStats;
use vidherd::download::worker::WorkerId;
use vidherd::media::memory::InMemoryRepository;
use vidherd::media::{MediaRepository, RepositoryError, TargetId, TargetInfo, VideoMetadata};

/// Route engine logs to the test output
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Settings with intervals short enough for tests
pub fn fast_settings() -> OperationSettings {
    OperationSettings {
        worker_count: 2,
        dispatch_interval: Duration::from_millis(10),
        poll_interval: Duration::from_millis(10),
        stall_timeout: Duration::from_secs(5),
        conflict_poll: Duration::from_millis(20),
        restart: RestartPolicies {
            simulate: RestartPolicy::disabled(),
            real: RestartPolicy::disabled(),
            classic: RestartPolicy::disabled(),
        },
        completion_grace: Duration::ZERO,
        drain_timeout: Duration::from_secs(1),
        ..OperationSettings::default()
    }
}

/// Sink that keeps everything it is told
#[derive(Default)]
pub struct RecordingSink {
    lines: Mutex<Vec<(WorkerId, String)>>,
    progress: Mutex<Vec<(ItemId, ProgressEvent)>>,
    summaries: Mutex<Vec<(usize, usize)>>,
    finished: Mutex<Vec<OperationStats>>,
    notices: Mutex<Vec<(NoticeLevel, String)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lines(&self) -> Vec<(WorkerId, String)> {
        self.lines.lock().unwrap().clone()
    }

    /// Final result reported for each item, in report order
    pub fn results(&self) -> Vec<(ItemId, ResultCode)> {
        self.progress
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(id, event)| event.result.map(|r| (*id, r)))
            .collect()
    }

    pub fn result_of(&self, item_id: ItemId) -> Option<ResultCode> {
        self.results()
            .into_iter()
            .find(|(id, _)| *id == item_id)
            .map(|(_, r)| r)
    }

    pub fn summaries(&self) -> Vec<(usize, usize)> {
        self.summaries.lock().unwrap().clone()
    }

    pub fn finished(&self) -> Vec<OperationStats> {
        self.finished.lock().unwrap().clone()
    }

    pub fn notices(&self) -> Vec<(NoticeLevel, String)> {
        self.notices.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn report_line(&self, worker_id: WorkerId, text: &str) {
        self.lines.lock().unwrap().push((worker_id, text.to_string()));
    }

    fn report_progress(&self, item_id: ItemId, event: &ProgressEvent) {
        self.progress.lock().unwrap().push((item_id, event.clone()));
    }

    fn report_worker_summary(&self, available: usize, total: usize) {
        self.summaries.lock().unwrap().push((available, total));
    }

    fn report_operation_finished(&self, stats: &OperationStats) {
        self.finished.lock().unwrap().push(stats.clone());
    }

    fn report_notice(&self, level: NoticeLevel, text: &str) {
        self.notices.lock().unwrap().push((level, text.to_string()));
    }
}

/// Runs a `sh -c` script per target URL instead of a real downloader
#[derive(Default)]
pub struct ScriptTranslator {
    scripts: Mutex<HashMap<String, String>>,
    invocations: Mutex<Vec<(String, JobOptions)>>,
}

impl ScriptTranslator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, url: &str, script: &str) {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), script.to_string());
    }

    /// How many attempts were started for `url`
    pub fn invocations(&self, url: &str) -> usize {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == url)
            .count()
    }

    pub fn options_for(&self, url: &str) -> Vec<JobOptions> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, o)| o.clone())
            .collect()
    }
}

impl OptionTranslator for ScriptTranslator {
    fn build_command(&self, item: &WorkItem, options: &JobOptions) -> CommandSpec {
        let url = item.url.clone().unwrap_or_default();
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&url)
            .cloned()
            .unwrap_or_else(|| "exit 0".to_string());
        self.invocations
            .lock()
            .unwrap()
            .push((url, options.clone()));
        CommandSpec::new("sh").arg("-c").arg(script)
    }
}

/// Script printing a successful yt-dlp download of `path`
pub fn download_script(path: &str, size: &str) -> String {
    format!(
        "echo '[youtube] abc: Downloading webpage'; \
         echo '[download] Destination: {path}'; \
         echo '[download]  50.0% of {size} at 1.00MiB/s ETA 00:01'; \
         echo '[download] 100% of {size} in 00:01'"
    )
}

/// In-memory repository that counts the writes it receives
#[derive(Default)]
pub struct CountingRepository {
    pub inner: InMemoryRepository,
    creates: AtomicUsize,
    new_downloads: AtomicUsize,
    old_downloads: AtomicUsize,
}

impl CountingRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn new_downloads(&self) -> usize {
        self.new_downloads.load(Ordering::SeqCst)
    }

    pub fn old_downloads(&self) -> usize {
        self.old_downloads.load(Ordering::SeqCst)
    }
}

impl MediaRepository for CountingRepository {
    fn resolve_target(&self, id: TargetId) -> Option<TargetInfo> {
        self.inner.resolve_target(id)
    }

    fn create_or_update_video(
        &self,
        container: TargetId,
        meta: &VideoMetadata,
    ) -> Result<TargetId, RepositoryError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create_or_update_video(container, meta)
    }

    fn mark_downloaded(&self, id: TargetId, is_new: bool) {
        if is_new {
            self.new_downloads.fetch_add(1, Ordering::SeqCst);
        } else {
            self.old_downloads.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.mark_downloaded(id, is_new);
    }

    fn mark_missing(&self, id: TargetId) {
        self.inner.mark_missing(id);
    }

    fn record_error(&self, id: TargetId, message: &str) {
        self.inner.record_error(id, message);
    }

    fn record_warning(&self, id: TargetId, message: &str) {
        self.inner.record_warning(id, message);
    }
}

/// Temporary destination directory for one test
pub fn destination(temp_dir: &tempfile::TempDir, name: &str) -> PathBuf {
    let path = temp_dir.path().join(name);
    std::fs::create_dir_all(&path).unwrap();
    path
}
