//! Download engine: queue, workers, subprocess supervision and output parsing
//!
//! A [`DownloadManager`] owns one operation. It fills a [`WorkQueue`] from
//! media targets, hands items to a pool of workers and stops when the queue
//! drains, a ceiling is hit or the caller asks it to.

pub mod completion_log;
pub mod control;
pub mod error;
pub mod item;
pub mod job;
pub mod manager;
pub mod options;
pub mod parser;
pub mod process;
pub mod progress;
pub mod queue;
pub mod result;
pub mod schedule;
pub mod settings;
pub mod stats;
pub mod worker;

pub use control::{OperationControl, StopLevel};
pub use error::DownloadError;
pub use item::{DownloadMode, ItemId, ItemState, WorkItem};
pub use manager::{DownloadManager, ManagerState, OperationHandle};
pub use options::{CommandSpec, JobOptions, OptionTranslator, YtdlpTranslator};
pub use progress::{ChannelSink, NoticeLevel, ProgressEvent, ProgressSink, SinkEvent, TracingSink};
pub use queue::WorkQueue;
pub use result::{JobOutcome, ResultCode};
pub use schedule::{AlternateLimits, DaySpec};
pub use settings::{OperationLimits, OperationSettings, RestartPolicies, RestartPolicy};
pub use stats::{OperationStats, StopReason, VideoKind};
