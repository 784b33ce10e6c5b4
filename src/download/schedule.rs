//! Alternate performance limits
//!
//! A time-of-day window (optionally restricted to certain days) during which
//! the operation uses a different worker count and bandwidth cap. Windows may
//! cross midnight: `21:00`-`07:00` on weekdays covers Monday 21:00 through
//! Tuesday 07:00, and Friday 21:00 through Saturday 07:00.

use chrono::{Datelike, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Days on which an alternate window may start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DaySpec {
    Every,
    Weekdays,
    Weekends,
    Day(Weekday),
}

impl DaySpec {
    pub fn matches(self, day: Weekday) -> bool {
        match self {
            DaySpec::Every => true,
            DaySpec::Weekdays => !matches!(day, Weekday::Sat | Weekday::Sun),
            DaySpec::Weekends => matches!(day, Weekday::Sat | Weekday::Sun),
            DaySpec::Day(d) => d == day,
        }
    }
}

impl FromStr for DaySpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "every" | "daily" | "all" => Ok(DaySpec::Every),
            "weekdays" => Ok(DaySpec::Weekdays),
            "weekends" => Ok(DaySpec::Weekends),
            other => other
                .parse::<Weekday>()
                .map(DaySpec::Day)
                .map_err(|_| format!("Unknown day specification: {}", s)),
        }
    }
}

impl TryFrom<String> for DaySpec {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DaySpec> for String {
    fn from(value: DaySpec) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DaySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaySpec::Every => f.write_str("every"),
            DaySpec::Weekdays => f.write_str("weekdays"),
            DaySpec::Weekends => f.write_str("weekends"),
            DaySpec::Day(d) => write!(f, "{}", d.to_string().to_lowercase()),
        }
    }
}

/// Parse an `HH:MM` clock time
pub fn parse_clock(s: &str) -> Result<NaiveTime, chrono::ParseError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
}

/// Scheduled override of worker count and bandwidth
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlternateLimits {
    pub enabled: bool,
    pub start: NaiveTime,
    pub stop: NaiveTime,
    pub days: DaySpec,
    pub workers: usize,
    /// KiB/s, `None` for unlimited
    pub bandwidth: Option<u64>,
}

impl AlternateLimits {
    /// Whether the window covers the given local time
    ///
    /// A window whose start equals its stop is empty.
    pub fn is_active_at(&self, at: NaiveDateTime) -> bool {
        if !self.enabled || self.start == self.stop {
            return false;
        }
        let time = at.time();
        let day = at.weekday();

        if self.start < self.stop {
            self.days.matches(day) && time >= self.start && time < self.stop
        } else {
            // Crosses midnight: the early-morning part belongs to the previous day
            (time >= self.start && self.days.matches(day))
                || (time < self.stop && self.days.matches(day.pred()))
        }
    }
}
