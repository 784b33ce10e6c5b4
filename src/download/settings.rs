use super::item::{DownloadMode, ModeFamily};
use super::parser::StderrFilters;
use super::schedule::AlternateLimits;
use std::sync::Arc;
use std::time::Duration;

/// Whether a stalled job is restarted, and how often
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub enabled: bool,
    pub max_restarts: u32,
}

impl RestartPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_restarts: 0,
        }
    }

    /// Whether another attempt is allowed after `restarts` restarts
    pub fn allows(&self, restarts: u32) -> bool {
        self.enabled && restarts < self.max_restarts
    }
}

/// Restart policy per mode family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicies {
    pub simulate: RestartPolicy,
    pub real: RestartPolicy,
    pub classic: RestartPolicy,
}

impl RestartPolicies {
    pub fn for_mode(&self, mode: DownloadMode) -> RestartPolicy {
        match mode.family() {
            ModeFamily::Simulate => self.simulate,
            ModeFamily::Real => self.real,
            ModeFamily::Classic => self.classic,
        }
    }
}

impl Default for RestartPolicies {
    fn default() -> Self {
        let enabled = RestartPolicy {
            enabled: true,
            max_restarts: 5,
        };
        Self {
            simulate: enabled,
            real: enabled,
            classic: RestartPolicy::disabled(),
        }
    }
}

/// Global ceilings; reaching any of them stops the operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationLimits {
    pub max_videos: Option<u64>,
    pub max_bytes: Option<u64>,
    pub max_elapsed: Option<Duration>,
}

/// Randomised pause after a real custom download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterJobDelay {
    pub min: Duration,
    pub max: Duration,
}

impl InterJobDelay {
    /// Pick a duration in `[min, max]`
    pub fn sample(&self) -> Duration {
        let (lo, hi) = if self.min <= self.max {
            (self.min, self.max)
        } else {
            (self.max, self.min)
        };
        if lo == hi {
            return lo;
        }
        let millis = rand::random_range(lo.as_millis() as u64..=hi.as_millis() as u64);
        Duration::from_millis(millis)
    }
}

/// Everything one download operation needs to know, fixed at start
#[derive(Debug, Clone)]
pub struct OperationSettings {
    pub worker_count: usize,
    /// Create extra workers beyond `worker_count` for live broadcasts
    pub allow_broadcast_workers: bool,
    pub dispatch_interval: Duration,
    /// How often a job checks its subprocess
    pub poll_interval: Duration,
    pub stall_timeout: Duration,
    /// Sleep between destination conflict checks
    pub conflict_poll: Duration,
    pub restart: RestartPolicies,
    pub inter_job_delay: Option<InterJobDelay>,
    pub limits: OperationLimits,
    /// KiB/s, `None` for unlimited
    pub bandwidth_limit: Option<u64>,
    pub alternate: Option<AlternateLimits>,
    pub alt_check_interval: Duration,
    /// Wait before reporting the operation finished
    pub completion_grace: Duration,
    /// Bound on waiting for output readers after a process exits
    pub drain_timeout: Duration,
    pub filters: Arc<StderrFilters>,
}

impl Default for OperationSettings {
    fn default() -> Self {
        Self {
            worker_count: 2,
            allow_broadcast_workers: true,
            dispatch_interval: Duration::from_millis(250),
            poll_interval: Duration::from_millis(100),
            stall_timeout: Duration::from_secs(90),
            conflict_poll: Duration::from_secs(5),
            restart: RestartPolicies::default(),
            inter_job_delay: None,
            limits: OperationLimits::default(),
            bandwidth_limit: None,
            alternate: None,
            alt_check_interval: Duration::from_secs(300),
            completion_grace: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(2),
            filters: Arc::new(StderrFilters::default()),
        }
    }
}
