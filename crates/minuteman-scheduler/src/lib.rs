//! `minuteman-scheduler` — periodic job scheduler with SQLite persistence.
//!
//! # Overview
//!
//! Jobs are persisted to the `scheduler_jobs` table. Every few seconds the
//! [`engine::SchedulerEngine`] runs a tick: a recovery pass first, then every
//! active job is checked for eligibility in priority order and due jobs are
//! queued. A pool of worker tasks claims queue items, runs the job's backend
//! and records the outcome on the job.
//!
//! # Eligibility
//!
//! | Job shape      | Due when                                                     |
//! |----------------|--------------------------------------------------------------|
//! | No timeplan    | never ran, or `period_secs` have elapsed since `last_run`    |
//! | With timeplan  | day, hour and minute bucket all allowed, not run this bucket |
//! | Inactive       | never                                                        |
//!
//! A failing job is switched off and stays off until
//! [`engine::SchedulerEngine::restart_failed_jobs`] re-enables it.
//!
//! Several processes may share one database. Each beats into
//! `scheduler_instances` on every tick, and the recovery pass leaves claims
//! of a beating peer alone.

pub mod backend;
pub mod builtin;
pub mod clock;
pub mod db;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod instances;
pub mod jobs;
pub mod queue;
pub mod recovery;
pub mod tasks;
pub mod timeplan;
pub mod types;
pub mod worker;

pub use backend::{Backend, BackendRegistry};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{SchedulerEngine, TickReport};
pub use error::{Result, SchedulerError};
pub use instances::InstanceRegistry;
pub use recovery::{CleanupReport, RecoveryTimeouts};
pub use timeplan::{is_due, Timeplan, TimeplanDoc};
pub use types::{JobDefinition, JobRecord, JobStatus, LongRunningTask, QueueItem};
