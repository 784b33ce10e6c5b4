//! Long-lived workers, one per concurrency slot
//!
//! A worker is started with [`WorkerHandle::start`] and then receives items
//! over a one-slot channel. Its state lives in a [`WorkerSlot`] shared with
//! the dispatch loop:
//!
//! ```text
//! available -> busy -> available
//!     |          |
//!     +-- doomed-+-> retired   (never while a job is running)
//! ```
//!
//! The dispatch loop reserves a slot with a compare-and-swap before handing
//! over an item, and the worker retires only through the same CAS, so a
//! reserved worker can never disappear with an item in flight.

use super::control::StopLevel;
use super::item::{ItemId, WorkItem};
use super::job::{JobContext, JobRunner};
use super::progress::ProgressEvent;
use super::result::{JobOutcome, ResultCode};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

pub type WorkerId = usize;

const IDLE: u8 = 0;
const BUSY: u8 = 1;
const RETIRED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Available,
    Busy,
    /// Will retire once its current job (if any) is done
    Doomed,
    Retired,
}

/// State shared between a worker task and the dispatch loop
#[derive(Debug)]
pub struct WorkerSlot {
    id: WorkerId,
    broadcast_only: bool,
    state: AtomicU8,
    doomed: AtomicBool,
    wake: Notify,
}

impl WorkerSlot {
    fn new(id: WorkerId, broadcast_only: bool) -> Self {
        Self {
            id,
            broadcast_only,
            state: AtomicU8::new(IDLE),
            doomed: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Created beyond the normal ceiling to serve a live broadcast
    pub fn is_broadcast_only(&self) -> bool {
        self.broadcast_only
    }

    pub fn status(&self) -> WorkerStatus {
        match self.state.load(Ordering::SeqCst) {
            RETIRED => WorkerStatus::Retired,
            _ if self.doomed.load(Ordering::SeqCst) => WorkerStatus::Doomed,
            BUSY => WorkerStatus::Busy,
            _ => WorkerStatus::Available,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status() == WorkerStatus::Available
    }

    pub fn is_busy(&self) -> bool {
        self.state.load(Ordering::SeqCst) == BUSY
    }

    pub fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::SeqCst)
    }

    pub fn is_retired(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RETIRED
    }

    /// Mark for retirement after the current job
    pub fn doom(&self) {
        self.doomed.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Cancel a pending retirement; false if the worker already retired
    pub fn undoom(&self) -> bool {
        self.doomed.store(false, Ordering::SeqCst);
        !self.is_retired()
    }

    /// Reserve an available worker for an assignment
    pub(crate) fn try_reserve(&self) -> bool {
        !self.is_doomed()
            && self
                .state
                .compare_exchange(IDLE, BUSY, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    /// Undo a reservation that was not followed by an assignment
    pub(crate) fn cancel_reservation(&self) {
        let _ = self
            .state
            .compare_exchange(BUSY, IDLE, Ordering::SeqCst, Ordering::SeqCst);
    }

    fn finish_job(&self) {
        self.state.store(IDLE, Ordering::SeqCst);
    }

    fn try_retire(&self) -> bool {
        self.is_doomed()
            && self
                .state
                .compare_exchange(IDLE, RETIRED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }
}

/// State changes reported by workers to the dispatch loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    JobStarted {
        worker_id: WorkerId,
        item_id: ItemId,
    },
    JobFinished {
        worker_id: WorkerId,
        item_id: ItemId,
        result: ResultCode,
    },
    Retired {
        worker_id: WorkerId,
    },
}

/// Destination directories currently written by a worker
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    claims: Mutex<HashMap<PathBuf, WorkerId>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `destination` for `worker_id`
    ///
    /// Fails only if another worker holds it.
    pub fn try_claim(&self, worker_id: WorkerId, destination: &Path) -> bool {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        match claims.get(destination) {
            Some(holder) if *holder != worker_id => false,
            _ => {
                claims.insert(destination.to_path_buf(), worker_id);
                true
            }
        }
    }

    /// Drop every claim held by `worker_id`
    pub fn release(&self, worker_id: WorkerId) {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, holder| *holder != worker_id);
    }

    pub fn holder(&self, destination: &Path) -> Option<WorkerId> {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(destination)
            .copied()
    }
}

/// Dispatch-loop side of a running worker
pub struct WorkerHandle {
    slot: Arc<WorkerSlot>,
    tx: mpsc::Sender<WorkItem>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Launch a worker task
    pub fn start(
        id: WorkerId,
        broadcast_only: bool,
        ctx: Arc<JobContext>,
        registry: Arc<WorkerRegistry>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        let slot = Arc::new(WorkerSlot::new(id, broadcast_only));
        let (tx, rx) = mpsc::channel(1);
        let worker = Worker {
            slot: slot.clone(),
            ctx,
            registry,
            events,
        };
        let join = tokio::spawn(worker.run(rx));
        tracing::debug!(
            "Started worker {}{}",
            id,
            if broadcast_only { " (broadcast)" } else { "" }
        );
        Self { slot, tx, join }
    }

    pub fn slot(&self) -> &Arc<WorkerSlot> {
        &self.slot
    }

    pub fn id(&self) -> WorkerId {
        self.slot.id
    }

    /// Hand an item to a worker previously reserved with `try_reserve`
    pub fn send(&self, item: WorkItem) -> Result<(), WorkItem> {
        self.tx.try_send(item).map_err(|e| {
            self.slot.cancel_reservation();
            match e {
                mpsc::error::TrySendError::Full(item) | mpsc::error::TrySendError::Closed(item) => {
                    item
                }
            }
        })
    }

    /// Close the assignment channel and wait for the task to end
    ///
    /// A running job finishes first.
    pub async fn shutdown(self) {
        let id = self.slot.id;
        drop(self.tx);
        if let Err(e) = self.join.await {
            tracing::error!("Worker {} ended abnormally: {}", id, e);
        }
    }
}

struct Worker {
    slot: Arc<WorkerSlot>,
    ctx: Arc<JobContext>,
    registry: Arc<WorkerRegistry>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl Worker {
    fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }

    async fn run(self, mut rx: mpsc::Receiver<WorkItem>) {
        let worker_id = self.slot.id;
        loop {
            if self.slot.try_retire() {
                tracing::debug!("Worker {} retired", worker_id);
                self.emit(WorkerEvent::Retired { worker_id });
                break;
            }

            let item = tokio::select! {
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
                _ = self.slot.wake.notified() => continue,
            };

            let item_id = item.id;
            self.emit(WorkerEvent::JobStarted { worker_id, item_id });
            let result = self.run_item(item).await;
            if self.slot.broadcast_only {
                self.slot.doom();
            }
            self.slot.finish_job();
            self.emit(WorkerEvent::JobFinished {
                worker_id,
                item_id,
                result,
            });
        }
        tracing::trace!("Worker {} task ended", worker_id);
    }

    /// Run an item to completion, restarting stalled attempts per policy
    async fn run_item(&self, item: WorkItem) -> ResultCode {
        let worker_id = self.slot.id;
        let sink = &self.ctx.sink;

        if item.needs_destination_lock() && !self.claim_destination(&item).await {
            let result = ResultCode::Stopped;
            sink.report_progress(item.id, &ProgressEvent::finished(result, None));
            self.ctx.control.counters().register_result(result);
            return result;
        }

        let policy = self.ctx.settings.restart.for_mode(item.mode);
        let mut restarts = 0;
        let mut last_non_ok: Option<ResultCode> = None;
        let result = loop {
            let report = JobRunner::new(self.ctx.clone(), worker_id, item.clone())
                .run()
                .await;
            match report.outcome {
                JobOutcome::Finished(code) => break code,
                JobOutcome::Stalled => {
                    if report.severity > ResultCode::Ok {
                        last_non_ok = Some(report.severity);
                    }
                    let stopping_now = self.ctx.control.stop_level() == Some(StopLevel::Now);
                    if !stopping_now && policy.allows(restarts) {
                        restarts += 1;
                        self.ctx.control.counters().register_restart();
                        sink.report_line(
                            worker_id,
                            &format!(
                                "Restarting {} ({} of {})",
                                item.name, restarts, policy.max_restarts
                            ),
                        );
                        continue;
                    }
                    let code = last_non_ok.unwrap_or(if self.ctx.control.is_running() {
                        ResultCode::Error
                    } else {
                        ResultCode::Stopped
                    });
                    tracing::info!(
                        worker_id,
                        item_id = item.id,
                        "Giving up on {} after {} restarts: {}",
                        item.name,
                        restarts,
                        code
                    );
                    sink.report_progress(
                        item.id,
                        &ProgressEvent::finished(code, report.playlist_size),
                    );
                    break code;
                }
            }
        };

        self.registry.release(worker_id);
        self.ctx.control.counters().register_result(result);

        if item.mode.wants_inter_job_delay() {
            self.inter_job_delay().await;
        }
        result
    }

    /// Wait until no other worker writes into the item's destination
    ///
    /// Returns false if the operation stops while waiting; the job never started.
    async fn claim_destination(&self, item: &WorkItem) -> bool {
        let worker_id = self.slot.id;
        let mut announced = false;
        loop {
            if self.registry.try_claim(worker_id, &item.destination) {
                return true;
            }
            if self.ctx.control.stop_level().is_some() {
                return false;
            }
            if !announced {
                let holder = self.registry.holder(&item.destination);
                tracing::debug!(
                    worker_id,
                    "Destination {} in use by worker {:?}",
                    item.destination.display(),
                    holder
                );
                self.ctx.sink.report_line(
                    worker_id,
                    &format!(
                        "Waiting for {} (destination in use)",
                        item.destination.display()
                    ),
                );
                announced = true;
            }
            tokio::time::sleep(self.ctx.settings.conflict_poll).await;
        }
    }

    async fn inter_job_delay(&self) {
        let Some(delay) = self.ctx.settings.inter_job_delay else {
            return;
        };
        let pause = delay.sample();
        tracing::debug!(worker_id = self.slot.id, "Pausing {:?} before next job", pause);
        let mut stop_rx = self.ctx.control.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = stop_rx.wait_for(|level| *level == Some(StopLevel::Now)) => {}
        }
    }
}
