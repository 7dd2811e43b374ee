//! Calendar-shaped eligibility masks and the `is_due` predicate.
//!
//! A [`Timeplan`] is three independent masks: day-of-week, hour-of-day and
//! minute-of-hour. Minutes are quantized to `minute_step` (10 by default), so
//! a plan that allows minute `0` is open from `:00` to `:09`. All matching is
//! done in UTC.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::types::JobRecord;

pub const DEFAULT_MINUTE_STEP: u32 = 10;

pub const ALL_DAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

const DAY_NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// Immutable day × hour × minute-bucket eligibility mask.
///
/// Persisted as the JSON document described on [`TimeplanDoc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TimeplanDoc", into = "TimeplanDoc")]
pub struct Timeplan {
    /// Bit `n` set = weekday `n` (0 = Monday) allowed.
    days: u8,
    /// Bit `n` set = hour `n` allowed.
    hours: u32,
    /// Bit `n` set = minute bucket starting at minute `n` allowed.
    minutes: u64,
    minute_step: u32,
}

impl Timeplan {
    /// An empty plan (nothing allowed) with the given minute granularity.
    ///
    /// `minute_step` must be between 1 and 60 and divide 60.
    pub fn new(minute_step: u32) -> Result<Self> {
        if minute_step == 0 || minute_step > 60 || 60 % minute_step != 0 {
            return Err(SchedulerError::InvalidTimeplan(format!(
                "minute_step must divide 60, got {minute_step}"
            )));
        }
        Ok(Self {
            days: 0,
            hours: 0,
            minutes: 0,
            minute_step,
        })
    }

    pub fn with_days(mut self, days: &[Weekday]) -> Self {
        for day in days {
            self.days |= 1u8 << day.num_days_from_monday();
        }
        self
    }

    pub fn with_hours(mut self, hours: &[u32]) -> Result<Self> {
        for &hour in hours {
            if hour >= 24 {
                return Err(SchedulerError::InvalidTimeplan(format!(
                    "hour out of range: {hour}"
                )));
            }
            self.hours |= 1u32 << hour;
        }
        Ok(self)
    }

    /// Allow the buckets starting at each of `minutes`.
    ///
    /// Every entry must be a multiple of `minute_step`.
    pub fn with_minutes(mut self, minutes: &[u32]) -> Result<Self> {
        for &minute in minutes {
            if minute >= 60 || minute % self.minute_step != 0 {
                return Err(SchedulerError::InvalidTimeplan(format!(
                    "minute {minute} is not a bucket start for step {}",
                    self.minute_step
                )));
            }
            self.minutes |= 1u64 << minute;
        }
        Ok(self)
    }

    pub fn minute_step(&self) -> u32 {
        self.minute_step
    }

    /// Start minute of the bucket `minute` falls into.
    pub fn minute_bucket(&self, minute: u32) -> u32 {
        minute - minute % self.minute_step
    }

    /// True iff the day, hour and minute bucket of `at` are all allowed.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        let day = at.weekday().num_days_from_monday();
        let bucket = self.minute_bucket(at.minute());
        self.days & (1u8 << day) != 0
            && self.hours & (1u32 << at.hour()) != 0
            && self.minutes & (1u64 << bucket) != 0
    }

    /// True iff `a` and `b` fall into the same dated minute bucket.
    pub fn same_bucket(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        a.date_naive() == b.date_naive()
            && a.hour() == b.hour()
            && self.minute_bucket(a.minute()) == self.minute_bucket(b.minute())
    }
}

/// Decide whether `job` should be dispatched at `now`.
///
/// - inactive jobs are never due;
/// - without a timeplan, a job is due once `period` has elapsed since
///   `last_run` (or immediately if it never ran);
/// - with a timeplan, a job is due when `now` matches the plan and the job has
///   not already run inside the current minute bucket. How long ago the last
///   run was does not matter otherwise.
pub fn is_due(job: &JobRecord, now: DateTime<Utc>) -> bool {
    if !job.active {
        return false;
    }
    match (&job.timeplan, job.last_run) {
        (None, None) => true,
        (None, Some(last)) => now - last >= job.period(),
        (Some(plan), last) => {
            plan.matches(now) && last.map_or(true, |last| !plan.same_bucket(last, now))
        }
    }
}

/// Wire/storage shape of a [`Timeplan`].
///
/// ```json
/// {
///   "days":    {"Mon": true, "Tue": false, ...},
///   "hours":   {"0": true, "1": false, ...},
///   "minutes": {"0": true, "10": false, ...},
///   "minute_step": 10
/// }
/// ```
///
/// Missing keys mean `false`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeplanDoc {
    #[serde(default)]
    pub days: BTreeMap<String, bool>,
    #[serde(default)]
    pub hours: BTreeMap<String, bool>,
    #[serde(default)]
    pub minutes: BTreeMap<String, bool>,
    #[serde(default = "default_minute_step")]
    pub minute_step: u32,
}

fn default_minute_step() -> u32 {
    DEFAULT_MINUTE_STEP
}

impl TryFrom<TimeplanDoc> for Timeplan {
    type Error = SchedulerError;

    fn try_from(doc: TimeplanDoc) -> Result<Self> {
        let mut plan = Timeplan::new(doc.minute_step)?;

        for (name, _) in doc.days.iter().filter(|(_, on)| **on) {
            let idx = DAY_NAMES
                .iter()
                .position(|d| *d == name.as_str())
                .ok_or_else(|| SchedulerError::InvalidTimeplan(format!("unknown day: {name}")))?;
            plan = plan.with_days(&[ALL_DAYS[idx]]);
        }

        let hours = parse_keys(&doc.hours, "hour")?;
        let minutes = parse_keys(&doc.minutes, "minute")?;
        plan.with_hours(&hours)?.with_minutes(&minutes)
    }
}

fn parse_keys(map: &BTreeMap<String, bool>, what: &str) -> Result<Vec<u32>> {
    map.iter()
        .filter(|(_, on)| **on)
        .map(|(key, _)| {
            key.parse::<u32>()
                .map_err(|_| SchedulerError::InvalidTimeplan(format!("bad {what} key: {key}")))
        })
        .collect()
}

impl From<Timeplan> for TimeplanDoc {
    fn from(plan: Timeplan) -> Self {
        let days = DAY_NAMES
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), plan.days & (1u8 << i) != 0))
            .collect();
        let hours = (0..24)
            .map(|h| (h.to_string(), plan.hours & (1u32 << h) != 0))
            .collect();
        let minutes = (0..60)
            .step_by(plan.minute_step as usize)
            .map(|m| (m.to_string(), plan.minutes & (1u64 << m) != 0))
            .collect();
        Self {
            days,
            hours,
            minutes,
            minute_step: plan.minute_step,
        }
    }
}
