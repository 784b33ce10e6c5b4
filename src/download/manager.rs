//! Download operation orchestrator
//!
//! [`DownloadManager`] owns the worker pool and drives the dispatch loop:
//!
//! 1. report the worker availability summary when it changes
//! 2. enforce the elapsed-time ceiling
//! 3. every `alt_check_interval`, switch alternate limits on or off
//! 4. hand the next queued item to an available worker, or finish once the
//!    queue is empty and every worker is idle
//! 5. sleep `dispatch_interval`
//!
//! Shutdown closes every worker, joins its task, then reports the final
//! statistics after `completion_grace`.

use super::control::{OperationControl, StopLevel};
use super::item::{DownloadMode, WorkItem};
use super::job::JobContext;
use super::options::OptionTranslator;
use super::progress::{NoticeLevel, ProgressEvent, ProgressSink};
use super::queue::WorkQueue;
use super::result::ResultCode;
use super::settings::OperationSettings;
use super::stats::{OperationStats, StopReason};
use super::worker::{WorkerEvent, WorkerHandle, WorkerId, WorkerRegistry};
use crate::media::{MediaRepository, TargetId};
use chrono::{Local, NaiveDateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Lifecycle of one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Initializing,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerCommand {
    SetWorkerCount(usize),
}

/// Control surface of a running operation, cheap to clone
#[derive(Clone)]
pub struct OperationHandle {
    control: Arc<OperationControl>,
    commands: mpsc::UnboundedSender<ManagerCommand>,
    state: watch::Receiver<ManagerState>,
}

impl OperationHandle {
    /// Stop admitting work; running jobs finish
    pub async fn stop_soon(&self) {
        self.control.stop(StopLevel::Soon, StopReason::Manual).await;
    }

    /// Terminate running jobs as well
    pub async fn stop_now(&self) {
        self.control.stop(StopLevel::Now, StopReason::Manual).await;
    }

    pub fn set_worker_count(&self, count: usize) {
        let _ = self.commands.send(ManagerCommand::SetWorkerCount(count));
    }

    pub fn state(&self) -> ManagerState {
        *self.state.borrow()
    }

    /// Wait until the operation reaches `state` (or later)
    pub async fn wait_for_state(&mut self, state: ManagerState) {
        let target = state as u8;
        let _ = self.state.wait_for(|s| *s as u8 >= target).await;
    }

    /// Queue of the operation, for mid-operation appends
    pub fn queue(&self) -> &WorkQueue {
        self.control.queue()
    }

    pub fn control(&self) -> &Arc<OperationControl> {
        &self.control
    }
}

pub struct DownloadManager {
    ctx: Arc<JobContext>,
    queue: WorkQueue,
    registry: Arc<WorkerRegistry>,
    workers: Vec<WorkerHandle>,
    next_worker_id: WorkerId,
    /// Requested number of regular workers
    target_workers: usize,
    /// Worker count outside the alternate window
    base_workers: usize,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    commands_tx: mpsc::UnboundedSender<ManagerCommand>,
    commands_rx: mpsc::UnboundedReceiver<ManagerCommand>,
    state_tx: watch::Sender<ManagerState>,
    alt_active: Option<bool>,
    last_alt_check: Option<Instant>,
    last_summary: Option<(usize, usize)>,
    clock: fn() -> NaiveDateTime,
    stats: OperationStats,
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

impl DownloadManager {
    pub fn new(
        settings: OperationSettings,
        repo: Arc<dyn MediaRepository>,
        sink: Arc<dyn ProgressSink>,
        translator: Arc<dyn OptionTranslator>,
    ) -> Self {
        let queue = WorkQueue::new(repo.clone(), sink.clone());
        let control = Arc::new(OperationControl::new(
            queue.clone(),
            settings.limits,
            settings.bandwidth_limit,
        ));
        let base_workers = settings.worker_count.max(1);
        let ctx = Arc::new(JobContext {
            repo,
            sink,
            translator,
            control,
            settings: Arc::new(settings),
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ManagerState::Initializing);

        Self {
            ctx,
            queue,
            registry: Arc::new(WorkerRegistry::new()),
            workers: Vec::new(),
            next_worker_id: 1,
            target_workers: base_workers,
            base_workers,
            events_tx,
            events_rx,
            commands_tx,
            commands_rx,
            state_tx,
            alt_active: None,
            last_alt_check: None,
            last_summary: None,
            clock: local_now,
            stats: OperationStats {
                operation_id: Uuid::new_v4(),
                ..OperationStats::default()
            },
        }
    }

    /// Replace the wall clock used for alternate limits
    pub fn with_clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn operation_id(&self) -> Uuid {
        self.stats.operation_id
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn control(&self) -> &Arc<OperationControl> {
        &self.ctx.control
    }

    pub fn handle(&self) -> OperationHandle {
        OperationHandle {
            control: self.ctx.control.clone(),
            commands: self.commands_tx.clone(),
            state: self.state_tx.subscribe(),
        }
    }

    /// Admit targets into the queue; returns the number of items created
    pub async fn admit(
        &mut self,
        targets: &[TargetId],
        mode: DownloadMode,
        ignore_limits: bool,
    ) -> usize {
        self.stats.mode.get_or_insert(mode);
        let before = self.queue.len().await;
        for target in targets {
            self.queue.create_item(*target, mode, false, ignore_limits).await;
        }
        let created = self.queue.len().await.saturating_sub(before);
        tracing::info!("Admitted {} items from {} targets", created, targets.len());
        created
    }

    /// Workers that are not retired
    pub fn worker_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| !w.slot().is_retired())
            .count()
    }

    /// Regular workers that will stay in the pool
    fn committed_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| {
                let slot = w.slot();
                !slot.is_broadcast_only() && !slot.is_doomed() && !slot.is_retired()
            })
            .count()
    }

    fn spawn_worker(&mut self, broadcast_only: bool) -> usize {
        let id = self.next_worker_id;
        self.next_worker_id += 1;
        self.workers.push(WorkerHandle::start(
            id,
            broadcast_only,
            self.ctx.clone(),
            self.registry.clone(),
            self.events_tx.clone(),
        ));
        self.workers.len() - 1
    }

    /// Resize the regular pool to `count` workers
    ///
    /// Growing un-dooms doomed workers before creating new ones. Shrinking
    /// dooms workers, which retire once their current job is done.
    pub fn change_worker_count(&mut self, count: usize) {
        let count = count.max(1);
        self.target_workers = count;
        let committed = self.committed_workers();

        if count > committed {
            let mut needed = count - committed;
            for worker in &self.workers {
                if needed == 0 {
                    break;
                }
                let slot = worker.slot();
                if !slot.is_broadcast_only() && slot.is_doomed() && slot.undoom() {
                    tracing::debug!("Un-doomed worker {}", slot.id());
                    needed -= 1;
                }
            }
            for _ in 0..needed {
                self.spawn_worker(false);
            }
        } else if count < committed {
            let mut excess = committed - count;
            for worker in &self.workers {
                if excess == 0 {
                    break;
                }
                let slot = worker.slot();
                if !slot.is_broadcast_only() && !slot.is_doomed() && !slot.is_retired() {
                    slot.doom();
                    tracing::debug!("Doomed worker {}", slot.id());
                    excess -= 1;
                }
            }
        }
    }

    /// Remove retired workers and top the pool up to its target
    async fn reconcile_pool(&mut self) {
        let (retired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.workers)
            .into_iter()
            .partition(|w| w.slot().is_retired());
        self.workers = live;
        for worker in retired {
            worker.shutdown().await;
        }
        if self.committed_workers() < self.target_workers {
            self.change_worker_count(self.target_workers);
        }
    }

    fn process_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                WorkerEvent::JobStarted { worker_id, item_id } => {
                    tracing::debug!(worker_id, item_id, "Job started");
                }
                WorkerEvent::JobFinished {
                    worker_id,
                    item_id,
                    result,
                } => {
                    tracing::debug!(worker_id, item_id, "Job finished: {}", result);
                }
                WorkerEvent::Retired { worker_id } => {
                    tracing::debug!(worker_id, "Worker retired");
                }
            }
        }
    }

    fn process_commands(&mut self) {
        while let Ok(command) = self.commands_rx.try_recv() {
            match command {
                ManagerCommand::SetWorkerCount(count) => {
                    tracing::info!("Worker count set to {}", count);
                    if self.alt_active != Some(true) {
                        self.base_workers = count.max(1);
                    }
                    self.change_worker_count(count);
                }
            }
        }
    }

    fn report_summary(&mut self) {
        let live: Vec<_> = self
            .workers
            .iter()
            .filter(|w| !w.slot().is_retired())
            .collect();
        let available = live.iter().filter(|w| w.slot().is_available()).count();
        let summary = (available, live.len());
        if self.last_summary != Some(summary) {
            self.last_summary = Some(summary);
            self.ctx.sink.report_worker_summary(summary.0, summary.1);
        }
    }

    /// Switch alternate limits when the window opens or closes
    fn check_alternate_limits(&mut self) {
        self.last_alt_check = Some(Instant::now());
        let Some(alt) = self.ctx.settings.alternate.clone() else {
            return;
        };
        let active = alt.is_active_at((self.clock)());
        if self.alt_active == Some(active) {
            return;
        }
        let was_known = self.alt_active.is_some();
        self.alt_active = Some(active);
        if !active && !was_known {
            return;
        }

        let (workers, bandwidth) = if active {
            (alt.workers, alt.bandwidth)
        } else {
            (self.base_workers, self.ctx.settings.bandwidth_limit)
        };
        let text = if active {
            format!(
                "Alternate limits on: {} workers, bandwidth {}",
                workers,
                bandwidth.map_or("unlimited".to_string(), |b| format!("{} KiB/s", b))
            )
        } else {
            "Alternate limits off".to_string()
        };
        tracing::info!("{}", text);
        self.ctx.sink.report_notice(NoticeLevel::Info, &text);
        self.ctx.control.set_bandwidth_limit(bandwidth);
        self.change_worker_count(workers);
    }

    fn alt_check_due(&self) -> bool {
        self.last_alt_check
            .is_none_or(|t| t.elapsed() >= self.ctx.settings.alt_check_interval)
    }

    fn any_busy(&self) -> bool {
        self.workers.iter().any(|w| w.slot().is_busy())
    }

    /// Pick a worker for `item`, creating a broadcast worker if allowed
    fn select_worker(&mut self, item: &WorkItem) -> Option<usize> {
        let regular = || {
            self.workers
                .iter()
                .position(|w| !w.slot().is_broadcast_only() && w.slot().is_available())
        };
        if !item.broadcast {
            return regular();
        }
        let dedicated = self
            .workers
            .iter()
            .position(|w| w.slot().is_broadcast_only() && w.slot().is_available());
        if let Some(index) = dedicated.or_else(regular) {
            return Some(index);
        }
        if self.ctx.settings.allow_broadcast_workers {
            return Some(self.spawn_worker(true));
        }
        None
    }

    /// Reserve a worker, activate the item and hand it over
    async fn dispatch(&mut self, item: WorkItem) -> bool {
        let Some(index) = self.select_worker(&item) else {
            return false;
        };
        let worker = &self.workers[index];
        if !worker.slot().try_reserve() {
            return false;
        }
        let Some(item) = self.queue.activate(item.id).await else {
            // Abandoned or taken between fetch and activation
            worker.slot().cancel_reservation();
            return false;
        };

        let worker_id = worker.id();
        tracing::debug!(worker_id, item_id = item.id, "Assigning {}", item.name);
        if let Err(item) = worker.send(item) {
            tracing::error!(worker_id, item_id = item.id, "Worker refused assignment");
            self.ctx
                .sink
                .report_progress(item.id, &ProgressEvent::finished(ResultCode::Error, None));
            self.ctx.control.counters().register_result(ResultCode::Error);
            return false;
        }
        true
    }

    /// Run the operation to completion
    pub async fn run(mut self) -> OperationStats {
        self.stats.started_at = Utc::now();
        self.state_tx.send_replace(ManagerState::Running);
        tracing::info!("Operation {} started", self.stats.operation_id);

        self.queue.reorder_master_slave().await;
        self.check_alternate_limits();
        self.change_worker_count(self.target_workers);

        loop {
            self.process_commands();
            self.process_events();
            self.reconcile_pool().await;
            self.report_summary();

            self.ctx.control.check_time_limit().await;
            if self.alt_check_due() {
                self.check_alternate_limits();
            }
            if !self.ctx.control.is_running() {
                break;
            }

            match self.queue.fetch_next_queued().await {
                Some(item) => {
                    self.dispatch(item).await;
                }
                None if !self.any_busy() => {
                    self.ctx.control.mark_finished();
                    break;
                }
                None => {}
            }

            tokio::time::sleep(self.ctx.settings.dispatch_interval).await;
        }

        self.shutdown().await
    }

    async fn shutdown(mut self) -> OperationStats {
        self.state_tx.send_replace(ManagerState::Stopping);
        tracing::info!("Operation {} stopping", self.stats.operation_id);

        for worker in std::mem::take(&mut self.workers) {
            worker.shutdown().await;
        }
        self.process_events();
        self.ctx.sink.report_worker_summary(0, 0);

        let mut stats = self.stats.clone();
        self.ctx.control.counters().fill(&mut stats);
        stats.stop_reason = self.ctx.control.stop_reason();
        stats.stopped_at = Some(Utc::now());

        tokio::time::sleep(self.ctx.settings.completion_grace).await;
        self.ctx.sink.report_operation_finished(&stats);
        self.state_tx.send_replace(ManagerState::Stopped);
        tracing::info!(
            "Operation {} finished: {} videos, {} bytes",
            stats.operation_id,
            stats.videos_total,
            stats.bytes_downloaded
        );
        stats
    }

    /// Launch the dispatch loop as a task
    pub fn start(self) -> (OperationHandle, JoinHandle<OperationStats>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::options::{CommandSpec, JobOptions};
    use crate::download::progress::TracingSink;
    use crate::download::schedule::{AlternateLimits, DaySpec, parse_clock};
    use crate::media::memory::InMemoryRepository;
    use chrono::NaiveDate;

    struct NoopTranslator;

    impl OptionTranslator for NoopTranslator {
        fn build_command(&self, _item: &WorkItem, _options: &JobOptions) -> CommandSpec {
            CommandSpec::new("true")
        }
    }

    fn manager(settings: OperationSettings) -> DownloadManager {
        DownloadManager::new(
            settings,
            Arc::new(InMemoryRepository::new()),
            Arc::new(TracingSink),
            Arc::new(NoopTranslator),
        )
    }

    #[tokio::test]
    async fn test_change_worker_count_grows_and_shrinks() {
        let mut manager = manager(OperationSettings::default());
        manager.change_worker_count(3);
        assert_eq!(manager.worker_count(), 3);
        assert_eq!(manager.committed_workers(), 3);

        manager.change_worker_count(1);
        assert_eq!(manager.committed_workers(), 1);
        let doomed = manager
            .workers
            .iter()
            .filter(|w| w.slot().is_doomed())
            .count();
        assert_eq!(doomed, 2);

        // Growing again prefers the doomed workers that have not retired yet
        manager.change_worker_count(3);
        let live = manager
            .workers
            .iter()
            .filter(|w| !w.slot().is_retired())
            .count();
        assert!(live >= 3);
        assert_eq!(manager.committed_workers(), 3);
    }

    #[tokio::test]
    async fn test_reconcile_removes_retired_workers() {
        let mut manager = manager(OperationSettings::default());
        manager.change_worker_count(4);
        manager.change_worker_count(2);

        for _ in 0..100 {
            manager.reconcile_pool().await;
            if manager.workers.len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(manager.workers.len(), 2);
        assert!(manager.workers.iter().all(|w| w.slot().is_available()));
    }

    fn monday_night() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(22, 0, 0)
            .unwrap()
    }

    fn monday_noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn night_limits() -> AlternateLimits {
        AlternateLimits {
            enabled: true,
            start: parse_clock("21:00").unwrap(),
            stop: parse_clock("07:00").unwrap(),
            days: DaySpec::Every,
            workers: 1,
            bandwidth: Some(64),
        }
    }

    #[tokio::test]
    async fn test_alternate_limits_applied_inside_window() {
        let settings = OperationSettings {
            worker_count: 3,
            bandwidth_limit: Some(1000),
            alternate: Some(night_limits()),
            ..OperationSettings::default()
        };
        let mut manager = manager(settings).with_clock(monday_night);
        manager.check_alternate_limits();
        assert_eq!(manager.target_workers, 1);
        assert_eq!(manager.control().bandwidth_limit(), Some(64));

        // Window closes: back to the regular limits
        manager.clock = monday_noon;
        manager.check_alternate_limits();
        assert_eq!(manager.target_workers, 3);
        assert_eq!(manager.control().bandwidth_limit(), Some(1000));
    }

    #[tokio::test]
    async fn test_alternate_limits_outside_window_leave_settings() {
        let settings = OperationSettings {
            worker_count: 2,
            bandwidth_limit: Some(1000),
            alternate: Some(night_limits()),
            ..OperationSettings::default()
        };
        let mut manager = manager(settings).with_clock(monday_noon);
        manager.check_alternate_limits();
        assert_eq!(manager.target_workers, 2);
        assert_eq!(manager.control().bandwidth_limit(), Some(1000));
        assert!(manager.workers.is_empty());
    }

    #[tokio::test]
    async fn test_empty_operation_finishes() {
        let mut settings = OperationSettings::default();
        settings.dispatch_interval = std::time::Duration::from_millis(5);
        settings.completion_grace = std::time::Duration::ZERO;
        let manager = manager(settings);
        let (mut handle, join) = manager.start();
        let stats = join.await.unwrap();
        handle.wait_for_state(ManagerState::Stopped).await;
        assert_eq!(stats.videos_total, 0);
        assert!(stats.stopped_at.is_some());
        assert_eq!(handle.state(), ManagerState::Stopped);
    }
}
