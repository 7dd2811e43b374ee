use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::timeplan::Timeplan;

/// Outcome of the most recent dispatch of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Never ran since it was created.
    #[default]
    Waiting,
    /// Last run returned normally.
    Ok,
    /// Last run raised a fault; the job is out of rotation until restarted.
    Error,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Ok => "ok",
            JobStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobStatus::Waiting),
            "ok" => Ok(JobStatus::Ok),
            "error" => Ok(JobStatus::Error),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// The administrator-supplied part of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Unique human-readable label; seeding upserts by this name.
    pub name: String,
    /// Key into the backend registry. Not interpreted by the scheduler.
    pub method: String,
    /// Minimum spacing between dispatches when no timeplan is set.
    pub period_secs: u64,
    /// Higher values are dispatched first within a tick.
    pub priority: i32,
    pub active: bool,
    /// When set, supersedes `period_secs` for eligibility.
    pub timeplan: Option<Timeplan>,
}

/// A persisted periodic job: its definition plus runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// UUIDv7 string — primary key.
    pub id: String,
    pub name: String,
    pub method: String,
    pub period_secs: u64,
    pub priority: i32,
    /// Inactive records are never evaluated by the tick loop.
    pub active: bool,
    pub timeplan: Option<Timeplan>,
    /// Start of the last dispatch attempt, whatever its outcome.
    pub last_run: Option<DateTime<Utc>>,
    pub status: JobStatus,
    /// Set only while `status` is `Error`.
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Build a fresh record (status `waiting`, never run) from a definition.
    pub fn from_definition(def: JobDefinition, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            name: def.name,
            method: def.method,
            period_secs: def.period_secs,
            priority: def.priority,
            active: def.active,
            timeplan: def.timeplan,
            last_run: None,
            status: JobStatus::Waiting,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn period(&self) -> Duration {
        i64::try_from(self.period_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX)
    }

    /// Record a run that started at `started` and returned normally.
    ///
    /// `active` is left as it was.
    pub fn mark_succeeded(&mut self, started: DateTime<Utc>) {
        self.status = JobStatus::Ok;
        self.error_message = None;
        self.last_run = Some(started);
        self.updated_at = started;
    }

    /// Record a run that started at `started` and raised a fault.
    ///
    /// Failed jobs leave the rotation until explicitly restarted.
    pub fn mark_failed(&mut self, started: DateTime<Utc>, message: impl Into<String>) {
        let mut message = message.into();
        if message.trim().is_empty() {
            message = "job failed without an error message".to_string();
        }
        self.status = JobStatus::Error;
        self.active = false;
        self.error_message = Some(message);
        self.last_run = Some(started);
        self.updated_at = started;
    }
}

/// A unit of work in the queue, optionally claimed by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    /// The job this item was dispatched for; `None` for raw backend calls.
    pub job_id: Option<String>,
    /// Backend to run.
    pub method: String,
    pub priority: i32,
    /// How many times the item was put back after its worker died.
    pub attempts: u32,
    /// Not claimable before this instant.
    pub run_at: DateTime<Utc>,
    /// Claim timestamp; `None` while waiting for a worker.
    pub locked_at: Option<DateTime<Utc>>,
    /// Worker id that holds the claim.
    pub locked_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }
}

/// A self-reporting task (bulk import and the like) that records its own start
/// and finish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongRunningTask {
    pub id: String,
    pub name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Free-form JSON object written by the task.
    pub result: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> JobRecord {
        let def = JobDefinition {
            name: "import".into(),
            method: "import.poll".into(),
            period_secs: 600,
            priority: 1,
            active: true,
            timeplan: None,
        };
        JobRecord::from_definition(def, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn new_record_is_waiting() {
        let job = record();
        assert_eq!(job.status, JobStatus::Waiting);
        assert!(job.last_run.is_none());
        assert!(job.error_message.is_none());
        assert_eq!(job.period(), Duration::minutes(10));
    }

    #[test]
    fn failure_then_success_restores_invariants() {
        let mut job = record();
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();

        job.mark_failed(t, "boom");
        assert_eq!(job.status, JobStatus::Error);
        assert!(!job.active);
        assert_eq!(job.error_message.as_deref(), Some("boom"));
        assert_eq!(job.last_run, Some(t));

        job.active = true;
        job.mark_succeeded(t + Duration::minutes(10));
        assert_eq!(job.status, JobStatus::Ok);
        assert!(job.active);
        assert!(job.error_message.is_none());
    }

    #[test]
    fn empty_fault_message_is_replaced() {
        let mut job = record();
        job.mark_failed(Utc::now(), "  ");
        assert!(!job.error_message.unwrap().trim().is_empty());
    }

    #[test]
    fn status_parses_its_display_form() {
        for status in [JobStatus::Waiting, JobStatus::Ok, JobStatus::Error] {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert!("running".parse::<JobStatus>().is_err());
    }
}
