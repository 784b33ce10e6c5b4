//! Job result severities
//!
//! Severity only ever escalates within one job: the most severe outcome wins.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Final severity of a job, ordered from least to most severe
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ResultCode {
    #[default]
    Ok = 0,
    Warning = 1,
    Error = 2,
    SizeLimitAbort = 3,
    AlreadyDone = 4,
    Stopped = 5,
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultCode::Ok => "ok",
            ResultCode::Warning => "warning",
            ResultCode::Error => "error",
            ResultCode::SizeLimitAbort => "size limit abort",
            ResultCode::AlreadyDone => "already done",
            ResultCode::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// How a single job attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Finished(ResultCode),
    /// No output for too long, or a network failure: eligible for restart
    Stalled,
}

/// Monotonic severity accumulator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Severity {
    current: ResultCode,
}

impl Severity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the severity; lower codes are ignored
    pub fn set_result(&mut self, code: ResultCode) {
        if code > self.current {
            self.current = code;
        }
    }

    pub fn get(&self) -> ResultCode {
        self.current
    }
}
