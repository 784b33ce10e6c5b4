//! Ordered, shared queue of work items for one operation
//!
//! Every mutating operation and every fetch goes through one mutex. Workers,
//! running jobs (a channel may admit more videos mid-operation) and the
//! dispatch loop all touch the queue concurrently.

use super::item::{DownloadMode, ItemId, ItemState, WorkItem};
use super::progress::{ProgressEvent, ProgressSink};
use crate::media::{MediaKind, MediaRepository, TargetId, TargetInfo};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct QueueState {
    next_id: ItemId,
    order: VecDeque<ItemId>,
    /// Priority and broadcast items waiting to be merged in front of `order`
    staged: Vec<ItemId>,
    items: HashMap<ItemId, WorkItem>,
    admitted: HashSet<TargetId>,
    dispatched: HashSet<ItemId>,
    abandoned: HashSet<ItemId>,
}

impl QueueState {
    /// Move staged items behind the priority run already at the front
    ///
    /// Priority and broadcast items therefore dispatch in admission order, no
    /// matter how many fetches happened between their admissions.
    fn merge_staged(&mut self) {
        if self.staged.is_empty() {
            return;
        }
        let mut at = self
            .order
            .iter()
            .take_while(|id| {
                self.items
                    .get(id)
                    .is_some_and(|item| item.priority || item.broadcast)
            })
            .count();
        for id in std::mem::take(&mut self.staged) {
            self.order.insert(at, id);
            at += 1;
        }
    }

    fn enqueue(&mut self, item: WorkItem) -> WorkItem {
        if item.priority || item.broadcast {
            self.staged.push(item.id);
        } else {
            self.order.push_back(item.id);
        }
        self.items.insert(item.id, item.clone());
        item
    }

    fn activate(&mut self, id: ItemId) -> Option<WorkItem> {
        if self.items.get(&id)?.state != ItemState::Queued {
            return None;
        }
        let mut item = self.items.remove(&id)?;
        self.order.retain(|i| *i != id);
        self.staged.retain(|i| *i != id);
        item.state = ItemState::Active;
        self.dispatched.insert(id);
        Some(item)
    }

    /// Admission filters; `through_parent` is set while recursing into a folder
    fn admit(
        &mut self,
        repo: &dyn MediaRepository,
        target: &TargetInfo,
        mode: DownloadMode,
        priority: bool,
        ignore_limits: bool,
        through_parent: bool,
    ) -> Option<WorkItem> {
        if self.admitted.contains(&target.id) {
            tracing::trace!("Skipping {}: already queued", target.id);
            return None;
        }
        if target.flags.disabled {
            tracing::trace!("Skipping {}: downloads disabled", target.id);
            return None;
        }
        if through_parent && target.kind == MediaKind::Folder && target.flags.private {
            tracing::trace!("Skipping {}: private folder", target.id);
            return None;
        }

        if target.kind == MediaKind::Folder {
            self.admitted.insert(target.id);
            for child_id in &target.children {
                match repo.resolve_target(*child_id) {
                    Some(child) => {
                        self.admit(repo, &child, mode, priority, ignore_limits, true);
                    }
                    None => tracing::debug!("Child {} of {} not found", child_id, target.id),
                }
            }
            return None;
        }

        if target.kind == MediaKind::Video {
            if mode.is_simulated() && target.flags.checked {
                tracing::trace!("Skipping {}: already checked", target.id);
                return None;
            }
            if !mode.is_simulated() && target.flags.downloaded {
                tracing::trace!("Skipping {}: already downloaded", target.id);
                return None;
            }
        }
        if target.flags.external_dir_missing {
            tracing::debug!(
                "Skipping {}: destination {} unavailable",
                target.id,
                target.destination.display()
            );
            return None;
        }
        if target.kind == MediaKind::Video && target.url.is_none() {
            tracing::trace!("Skipping {}: no URL", target.id);
            return None;
        }

        self.admitted.insert(target.id);
        let id = self.next_id;
        self.next_id += 1;
        let item = WorkItem::new(id, target, mode, priority, ignore_limits);
        tracing::debug!("Queued item {} for {} ({})", id, target.name, target.id);
        Some(self.enqueue(item))
    }
}

#[derive(Clone)]
pub struct WorkQueue {
    state: Arc<Mutex<QueueState>>,
    repo: Arc<dyn MediaRepository>,
    sink: Arc<dyn ProgressSink>,
}

impl WorkQueue {
    pub fn new(repo: Arc<dyn MediaRepository>, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            repo,
            sink,
        }
    }

    /// Admit a target, recursing into folders
    ///
    /// Returns the item created for the target itself. Folders never get an
    /// item of their own, so they always return `None` (their children are
    /// queued). Rejected targets also return `None`.
    ///
    /// Priority and broadcast items go ahead of every ordinary item but
    /// behind earlier priority and broadcast items (first admitted, first
    /// dispatched).
    pub async fn create_item(
        &self,
        target: TargetId,
        mode: DownloadMode,
        priority: bool,
        ignore_limits: bool,
    ) -> Option<WorkItem> {
        let Some(info) = self.repo.resolve_target(target) else {
            tracing::debug!("Skipping {}: unknown target", target);
            return None;
        };
        let mut state = self.state.lock().await;
        state.admit(self.repo.as_ref(), &info, mode, priority, ignore_limits, false)
    }

    /// First queued item, without changing its state
    ///
    /// Merges the staged front buffer first.
    pub async fn fetch_next_queued(&self) -> Option<WorkItem> {
        let mut state = self.state.lock().await;
        state.merge_staged();
        let id = *state.order.front()?;
        state.items.get(&id).cloned()
    }

    /// First queued broadcast item, without changing its state
    pub async fn fetch_next_broadcast(&self) -> Option<WorkItem> {
        let mut state = self.state.lock().await;
        state.merge_staged();
        state
            .order
            .iter()
            .filter_map(|id| state.items.get(id))
            .find(|item| item.broadcast)
            .cloned()
    }

    /// Move a queued item to `active`
    ///
    /// Succeeds for exactly one caller per item; the item leaves the queue.
    pub async fn activate(&self, id: ItemId) -> Option<WorkItem> {
        self.state.lock().await.activate(id)
    }

    /// Fetch and activate the first queued item in one critical section
    pub async fn take_next_queued(&self) -> Option<WorkItem> {
        let mut state = self.state.lock().await;
        state.merge_staged();
        let id = *state.order.front()?;
        state.activate(id)
    }

    pub async fn merge_staged(&self) {
        self.state.lock().await.merge_staged();
    }

    pub async fn move_to_front(&self, id: ItemId) -> bool {
        let mut state = self.state.lock().await;
        state.merge_staged();
        let Some(pos) = state.order.iter().position(|i| *i == id) else {
            return false;
        };
        state.order.remove(pos);
        state.order.push_front(id);
        true
    }

    pub async fn move_to_back(&self, id: ItemId) -> bool {
        let mut state = self.state.lock().await;
        state.merge_staged();
        let Some(pos) = state.order.iter().position(|i| *i == id) else {
            return false;
        };
        state.order.remove(pos);
        state.order.push_back(id);
        true
    }

    /// Mark every queued item `not-started` and drop it from the queue
    ///
    /// Sends one blank progress event per item. Returns the abandoned ids.
    pub async fn abandon_remaining(&self) -> Vec<ItemId> {
        let abandoned: Vec<ItemId> = {
            let mut state = self.state.lock().await;
            state.merge_staged();
            let ids: Vec<ItemId> = state.order.drain(..).collect();
            for id in &ids {
                state.items.remove(id);
                state.abandoned.insert(*id);
            }
            ids
        };

        if !abandoned.is_empty() {
            tracing::info!("Abandoned {} queued items", abandoned.len());
        }
        for id in &abandoned {
            self.sink.report_progress(*id, &ProgressEvent::default());
        }
        abandoned
    }

    /// Stable partition: destination masters before everything else
    pub async fn reorder_master_slave(&self) {
        let mut state = self.state.lock().await;
        state.merge_staged();
        let masters: HashSet<TargetId> = state
            .items
            .values()
            .filter_map(|item| item.dest_master.filter(|m| *m != item.target))
            .collect();
        if masters.is_empty() {
            return;
        }

        let (first, rest): (Vec<ItemId>, Vec<ItemId>) = state.order.iter().copied().partition(|id| {
            state
                .items
                .get(id)
                .is_some_and(|item| masters.contains(&item.target))
        });
        state.order = first.into_iter().chain(rest).collect();
    }

    /// Current state of an item; `None` if the id was never issued
    pub async fn state_of(&self, id: ItemId) -> Option<ItemState> {
        let state = self.state.lock().await;
        if let Some(item) = state.items.get(&id) {
            Some(item.state)
        } else if state.dispatched.contains(&id) {
            Some(ItemState::Active)
        } else if state.abandoned.contains(&id) {
            Some(ItemState::NotStarted)
        } else {
            None
        }
    }

    /// Number of items still queued
    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Queued items in dispatch order
    pub async fn snapshot(&self) -> Vec<WorkItem> {
        let mut state = self.state.lock().await;
        state.merge_staged();
        state
            .order
            .iter()
            .filter_map(|id| state.items.get(id).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::progress::{ChannelSink, SinkEvent, TracingSink};
    use crate::media::memory::InMemoryRepository;
    use pretty_assertions::assert_eq;

    fn setup() -> (Arc<InMemoryRepository>, WorkQueue) {
        let repo = Arc::new(InMemoryRepository::new());
        let queue = WorkQueue::new(repo.clone(), Arc::new(TracingSink));
        (repo, queue)
    }

    fn video(repo: &InMemoryRepository, name: &str) -> TargetId {
        repo.add_video(name, Some(&format!("https://v/{}", name)), None, "/dl")
    }

    async fn names(queue: &WorkQueue) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(item) = queue.take_next_queued().await {
            out.push(item.name);
        }
        out
    }

    #[tokio::test]
    async fn test_fetch_in_insertion_order() {
        let (repo, queue) = setup();
        for name in ["a", "b", "c"] {
            let id = video(&repo, name);
            assert!(queue.create_item(id, DownloadMode::Real, false, false).await.is_some());
        }

        let mut fetched = Vec::new();
        for _ in 0..3 {
            let item = queue.fetch_next_queued().await.unwrap();
            fetched.push(item.name.clone());
            queue.activate(item.id).await.unwrap();
        }
        assert_eq!(fetched, vec!["a", "b", "c"]);
        assert!(queue.fetch_next_queued().await.is_none());
    }

    #[tokio::test]
    async fn test_priority_item_goes_first_after_merge() {
        let (repo, queue) = setup();
        let a = video(&repo, "a");
        let b = video(&repo, "b");
        let c = video(&repo, "c");
        queue.create_item(a, DownloadMode::Real, false, false).await;
        queue.create_item(b, DownloadMode::Real, false, false).await;
        queue.create_item(c, DownloadMode::Real, true, false).await;
        queue.merge_staged().await;

        assert_eq!(names(&queue).await, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_staged_items_keep_their_order() {
        let (repo, queue) = setup();
        let a = video(&repo, "a");
        let live = video(&repo, "live");
        repo.set_flags(live, |f| f.live = true);
        let p = video(&repo, "p");

        queue.create_item(a, DownloadMode::Real, false, false).await;
        let item = queue.create_item(live, DownloadMode::Real, false, false).await.unwrap();
        assert!(item.broadcast);
        queue.create_item(p, DownloadMode::Real, true, false).await;

        assert_eq!(names(&queue).await, vec!["live", "p", "a"]);
    }

    #[tokio::test]
    async fn test_priority_order_does_not_depend_on_fetches() {
        let (repo, queue) = setup();
        let a = video(&repo, "a");
        let c = video(&repo, "c");
        let d = video(&repo, "d");
        queue.create_item(a, DownloadMode::Real, false, false).await;
        queue.create_item(c, DownloadMode::Real, true, false).await;
        assert_eq!(queue.fetch_next_queued().await.unwrap().name, "c");
        queue.create_item(d, DownloadMode::Real, true, false).await;
        assert_eq!(names(&queue).await, vec!["c", "d", "a"]);

        let (repo, queue) = setup();
        let a = video(&repo, "a");
        let c = video(&repo, "c");
        let d = video(&repo, "d");
        queue.create_item(a, DownloadMode::Real, false, false).await;
        queue.create_item(c, DownloadMode::Real, true, false).await;
        queue.create_item(d, DownloadMode::Real, true, false).await;
        assert_eq!(names(&queue).await, vec!["c", "d", "a"]);
    }

    #[tokio::test]
    async fn test_admission_filters() {
        let (repo, queue) = setup();
        let disabled = video(&repo, "disabled");
        repo.set_flags(disabled, |f| f.disabled = true);
        let checked = video(&repo, "checked");
        repo.set_flags(checked, |f| f.checked = true);
        let downloaded = video(&repo, "downloaded");
        repo.set_flags(downloaded, |f| f.downloaded = true);
        let external = video(&repo, "external");
        repo.set_flags(external, |f| f.external_dir_missing = true);
        let no_url = repo.add_video("no-url", None, None, "/dl");
        let plain = video(&repo, "plain");

        assert!(queue.create_item(TargetId(999), DownloadMode::Real, false, false).await.is_none());
        assert!(queue.create_item(disabled, DownloadMode::Real, false, false).await.is_none());
        assert!(queue.create_item(external, DownloadMode::Real, false, false).await.is_none());
        assert!(queue.create_item(no_url, DownloadMode::Real, false, false).await.is_none());

        // checked only matters when simulating, downloaded only for real downloads
        assert!(queue.create_item(checked, DownloadMode::Simulate, false, false).await.is_none());
        assert!(queue.create_item(downloaded, DownloadMode::Real, false, false).await.is_none());
        assert!(queue.create_item(checked, DownloadMode::Real, false, false).await.is_some());

        assert!(queue.create_item(plain, DownloadMode::Real, false, false).await.is_some());
        assert!(queue.create_item(plain, DownloadMode::Real, false, false).await.is_none());
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_folder_recursion_skips_private_subfolders() {
        let (repo, queue) = setup();
        let root = repo.add_folder("root", None, "/dl");
        repo.add_channel("chan", "https://c", Some(root), "/dl/chan");
        let sub = repo.add_folder("sub", Some(root), "/dl/sub");
        let private = repo.add_folder("private", Some(root), "/dl/private");
        repo.set_flags(private, |f| f.private = true);
        repo.add_video("v1", Some("https://v1"), Some(sub), "/dl/sub");
        repo.add_video("hidden", Some("https://hidden"), Some(private), "/dl/private");

        assert!(queue.create_item(root, DownloadMode::Simulate, false, false).await.is_none());
        assert_eq!(names(&queue).await, vec!["chan", "v1"]);

        // A private folder requested directly is still admitted
        let direct = WorkQueue::new(repo.clone(), Arc::new(TracingSink));
        assert!(direct.create_item(private, DownloadMode::Simulate, false, false).await.is_none());
        assert_eq!(names(&direct).await, vec!["hidden"]);
    }

    #[tokio::test]
    async fn test_abandon_remaining_is_idempotent() {
        let repo = Arc::new(InMemoryRepository::new());
        let (sink, mut rx) = ChannelSink::new();
        let queue = WorkQueue::new(repo.clone(), Arc::new(sink));
        let a = video(&repo, "a");
        let b = video(&repo, "b");
        let c = video(&repo, "c");
        let item_a = queue.create_item(a, DownloadMode::Real, false, false).await.unwrap();
        let item_b = queue.create_item(b, DownloadMode::Real, false, false).await.unwrap();
        let item_c = queue.create_item(c, DownloadMode::Real, false, false).await.unwrap();
        queue.activate(item_a.id).await.unwrap();

        let first = queue.abandon_remaining().await;
        assert_eq!(first, vec![item_b.id, item_c.id]);
        let second = queue.abandon_remaining().await;
        assert!(second.is_empty());

        assert_eq!(queue.state_of(item_a.id).await, Some(ItemState::Active));
        assert_eq!(queue.state_of(item_b.id).await, Some(ItemState::NotStarted));
        assert_eq!(queue.state_of(item_c.id).await, Some(ItemState::NotStarted));
        assert_eq!(queue.state_of(42).await, None);
        assert!(queue.activate(item_b.id).await.is_none());

        let mut blanks = Vec::new();
        while let Ok(SinkEvent::Progress { item_id, event }) = rx.try_recv() {
            assert!(event.is_empty());
            blanks.push(item_id);
        }
        assert_eq!(blanks, vec![item_b.id, item_c.id]);
    }

    #[tokio::test]
    async fn test_activate_succeeds_once() {
        let (repo, queue) = setup();
        let a = video(&repo, "a");
        let item = queue.create_item(a, DownloadMode::Real, false, false).await.unwrap();
        assert!(queue.activate(item.id).await.is_some());
        assert!(queue.activate(item.id).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_double_assignment_under_concurrency() {
        let (repo, queue) = setup();
        for i in 0..200 {
            let id = video(&repo, &format!("v{}", i));
            queue.create_item(id, DownloadMode::Real, false, false).await;
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                loop {
                    // Half the workers race on fetch + activate, half on take
                    match queue.fetch_next_queued().await {
                        Some(item) => {
                            if let Some(item) = queue.activate(item.id).await {
                                got.push(item.id);
                            }
                        }
                        None => break,
                    }
                    if let Some(item) = queue.take_next_queued().await {
                        got.push(item.id);
                    }
                }
                got
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        let expected: Vec<ItemId> = (0..200).collect();
        assert_eq!(all, expected);
    }

    #[tokio::test]
    async fn test_reorder_master_slave() {
        let (repo, queue) = setup();
        let slave = repo.add_channel("slave", "https://s", None, "/dl/shared");
        let other = repo.add_channel("other", "https://o", None, "/dl/other");
        let master = repo.add_channel("master", "https://m", None, "/dl/shared");
        repo.share_destination(master, slave);

        for id in [slave, other, master] {
            queue.create_item(id, DownloadMode::Real, false, false).await;
        }
        queue.reorder_master_slave().await;
        assert_eq!(names(&queue).await, vec!["master", "slave", "other"]);
    }

    #[tokio::test]
    async fn test_move_to_front_and_back() {
        let (repo, queue) = setup();
        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            let t = video(&repo, name);
            ids.push(queue.create_item(t, DownloadMode::Real, false, false).await.unwrap().id);
        }
        assert!(queue.move_to_front(ids[2]).await);
        assert!(queue.move_to_back(ids[0]).await);
        assert!(!queue.move_to_back(99).await);

        let order: Vec<String> = queue.snapshot().await.into_iter().map(|i| i.name).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }
}
