use crate::media::{MediaKind, TargetId, TargetInfo};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identifier of a work item, unique within one [`super::queue::WorkQueue`]
pub type ItemId = u64;

/// How the external downloader is asked to treat a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadMode {
    /// Fetch metadata only
    Simulate,
    Real,
    CustomSimulate,
    CustomReal,
    ClassicSimulate,
    ClassicReal,
    ClassicCustom,
}

/// Group of modes sharing a restart policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModeFamily {
    Simulate,
    Real,
    Classic,
}

impl DownloadMode {
    pub fn is_simulated(self) -> bool {
        matches!(
            self,
            DownloadMode::Simulate | DownloadMode::CustomSimulate | DownloadMode::ClassicSimulate
        )
    }

    pub fn is_custom(self) -> bool {
        matches!(
            self,
            DownloadMode::CustomSimulate | DownloadMode::CustomReal | DownloadMode::ClassicCustom
        )
    }

    pub fn is_classic(self) -> bool {
        matches!(
            self,
            DownloadMode::ClassicSimulate | DownloadMode::ClassicReal | DownloadMode::ClassicCustom
        )
    }

    /// Real custom downloads are followed by the politeness delay
    pub fn wants_inter_job_delay(self) -> bool {
        self.is_custom() && !self.is_simulated()
    }

    /// Downloaded bytes only accumulate toward the size ceiling for real downloads
    pub fn counts_bytes(self) -> bool {
        !self.is_simulated()
    }

    pub fn family(self) -> ModeFamily {
        if self.is_classic() {
            ModeFamily::Classic
        } else if self.is_simulated() {
            ModeFamily::Simulate
        } else {
            ModeFamily::Real
        }
    }
}

/// Lifecycle state of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemState {
    Queued,
    Active,
    /// Abandoned before it was assigned (e.g. operation stopped)
    NotStarted,
}

/// One schedulable unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: ItemId,
    pub target: TargetId,
    pub kind: MediaKind,
    pub name: String,
    pub url: Option<String>,
    pub mode: DownloadMode,
    pub state: ItemState,
    /// Bypasses the global video/size/time ceilings
    pub ignore_limits: bool,
    pub priority: bool,
    /// Currently-live stream, eligible for a dedicated worker
    pub broadcast: bool,
    pub destination: PathBuf,
    /// Container owning `destination` when it is shared
    pub dest_master: Option<TargetId>,
}

impl WorkItem {
    pub(crate) fn new(
        id: ItemId,
        target: &TargetInfo,
        mode: DownloadMode,
        priority: bool,
        ignore_limits: bool,
    ) -> Self {
        let broadcast = target.kind == MediaKind::Video && target.flags.live;
        Self {
            id,
            target: target.id,
            kind: target.kind,
            name: target.name.clone(),
            url: target.url.clone(),
            mode,
            state: ItemState::Queued,
            ignore_limits,
            priority,
            broadcast,
            destination: target.destination.clone(),
            dest_master: target.dest_master,
        }
    }

    /// Container jobs are serialized per destination directory
    pub fn needs_destination_lock(&self) -> bool {
        self.kind.is_container()
    }
}
