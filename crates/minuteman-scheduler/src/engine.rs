use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use minuteman_core::{JobSeedConfig, SchedulerConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    backend::BackendRegistry,
    builtin,
    clock::Clock,
    db::{self, SharedConnection},
    dispatcher::Dispatcher,
    error::{Result, SchedulerError},
    instances::InstanceRegistry,
    jobs::JobRegistry,
    queue::{JobQueue, WorkerSet},
    recovery::{CleanupReport, RecoveryCoordinator, RecoveryTimeouts, TickToken},
    tasks::LongRunningTaskStore,
    timeplan::{is_due, Timeplan},
    types::{JobDefinition, JobRecord},
    worker::{self, WorkerContext},
};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub cleanup: CleanupReport,
    /// Active jobs checked for eligibility.
    pub evaluated: usize,
    pub dispatched: usize,
    /// Due jobs left alone because a queue item for them already exists.
    pub skipped_in_flight: usize,
    /// Rows or steps that failed while loading or evaluating.
    pub load_errors: usize,
}

/// The scheduler instance: owns the stores, the backend registry and the tick loop.
///
/// Construct one per process and hand it to [`SchedulerEngine::run`].
pub struct SchedulerEngine {
    jobs: JobRegistry,
    queue: JobQueue,
    tasks: LongRunningTaskStore,
    workers: WorkerSet,
    instances: InstanceRegistry,
    backends: Arc<BackendRegistry>,
    dispatcher: Arc<Dispatcher>,
    recovery: RecoveryCoordinator,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl SchedulerEngine {
    /// Create an engine over `conn`, initialising the schema if needed.
    ///
    /// Built-in backends are added to `backends` before it is frozen.
    pub fn new(
        conn: SharedConnection,
        mut backends: BackendRegistry,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        {
            let guard = db::lock(&conn)?;
            db::init_db(&guard)?;
        }
        builtin::register_builtins(&mut backends, &conn);
        let backends = Arc::new(backends);

        let jobs = JobRegistry::new(conn.clone());
        let queue = JobQueue::new(conn.clone());
        let tasks = LongRunningTaskStore::new(conn.clone());
        let instances = InstanceRegistry::new(conn);
        let workers = WorkerSet::new();

        let dispatcher = Arc::new(Dispatcher::new(
            jobs.clone(),
            queue.clone(),
            backends.clone(),
            clock.clone(),
        ));
        let recovery = RecoveryCoordinator::new(
            queue.clone(),
            workers.clone(),
            tasks.clone(),
            instances.clone(),
            backends.clone(),
            clock.clone(),
            RecoveryTimeouts {
                stale_task_after: seconds(config.stale_task_after_secs),
                // a peer misses at most a couple of ticks before it is given up on
                instance_timeout: seconds(
                    config
                        .instance_timeout_secs
                        .max(config.tick_interval_secs.saturating_mul(3)),
                ),
            },
        );
        info!(instance_id = workers.instance_id(), "scheduler instance created");

        Ok(Self {
            jobs,
            queue,
            tasks,
            workers,
            instances,
            backends,
            dispatcher,
            recovery,
            clock,
            config,
        })
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn tasks(&self) -> &LongRunningTaskStore {
        &self.tasks
    }

    pub fn workers(&self) -> &WorkerSet {
        &self.workers
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn instances(&self) -> &InstanceRegistry {
        &self.instances
    }

    // --- administrative operations ------------------------------------------

    pub fn failed_jobs(&self) -> Result<Vec<JobRecord>> {
        self.jobs.failed_jobs()
    }

    pub fn restart_failed_jobs(&self) -> Result<usize> {
        self.jobs.restart_failed_jobs(self.clock.now())
    }

    /// Cleanup pass requested from outside the tick loop.
    ///
    /// Returns [`SchedulerError::CleanupOutsideTick`] unless `force` is set.
    pub fn cleanup(&self, force: bool) -> Result<CleanupReport> {
        self.recovery.cleanup(None, force)
    }

    /// Distinct methods of stored jobs that no backend is registered for.
    ///
    /// Such jobs fail with `UnknownMethod` on their first run.
    pub fn unbound_methods(&self) -> Result<Vec<String>> {
        let methods: BTreeSet<String> = self
            .jobs
            .list_jobs()?
            .into_iter()
            .map(|job| job.method)
            .filter(|method| !self.backends.contains(method))
            .collect();
        Ok(methods.into_iter().collect())
    }

    /// Upsert the built-in jobs (when enabled) and every configured job by name.
    ///
    /// An invalid seed aborts seeding: configuration errors are not skipped.
    /// Seeds whose method has no backend are stored anyway, with a warning.
    #[instrument(skip(self, seeds), fields(count = seeds.len()))]
    pub fn seed_jobs(&self, seeds: &[JobSeedConfig]) -> Result<usize> {
        let mut defs = if self.config.seed_builtin_jobs {
            builtin::builtin_definitions()?
        } else {
            Vec::new()
        };
        for seed in seeds {
            defs.push(definition_from_seed(seed)?);
        }

        let now = self.clock.now();
        let count = defs.len();
        for def in defs {
            if !self.backends.contains(&def.method) {
                warn!(job = %def.name, method = %def.method, "no backend registered for seeded job");
            }
            self.jobs.upsert_definition(def, now)?;
        }
        info!(count, "jobs seeded");
        Ok(count)
    }

    // --- tick loop ----------------------------------------------------------

    /// One scheduling pass: cleanup first, then dispatch every due job in
    /// priority order. Never fails; problems are logged and counted.
    pub fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        if let Err(e) = self.heartbeat() {
            error!(error = %e, "heartbeat failed");
            report.load_errors += 1;
        }

        let token = TickToken::new();
        report.cleanup = match self.recovery.cleanup(Some(&token), false) {
            Ok(cleanup) => cleanup,
            Err(e) => {
                error!(error = %e, "cleanup pass failed");
                CleanupReport::default()
            }
        };

        let (jobs, bad_rows) = match self.jobs.active_jobs() {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(error = %e, "failed to load active jobs");
                report.load_errors += 1;
                return report;
            }
        };
        report.load_errors += bad_rows;

        let now = self.clock.now();
        for job in jobs {
            report.evaluated += 1;
            if !is_due(&job, now) {
                continue;
            }

            match self.queue.has_item_for_job(&job.id) {
                Ok(true) => {
                    debug!(job_id = %job.id, "previous run still queued, skipping");
                    report.skipped_in_flight += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "in-flight check failed");
                    report.load_errors += 1;
                    continue;
                }
            }

            match self.dispatcher.dispatch(&job) {
                Ok(_) => report.dispatched += 1,
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "dispatch failed");
                    report.load_errors += 1;
                }
            }
        }

        report
    }

    fn heartbeat(&self) -> Result<()> {
        self.instances
            .heartbeat(self.workers.instance_id(), self.clock.now())
    }

    /// Start the worker pool; workers stop once `shutdown` broadcasts `true`.
    pub fn spawn_workers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        // claims must be backed by a heartbeat before the first tick
        if let Err(e) = self.heartbeat() {
            error!(error = %e, "heartbeat failed");
        }
        let ctx = WorkerContext {
            queue: self.queue.clone(),
            dispatcher: self.dispatcher.clone(),
            workers: self.workers.clone(),
            clock: self.clock.clone(),
            poll: StdDuration::from_millis(self.config.worker_poll_ms.max(1)),
        };
        worker::spawn_workers(ctx, self.config.workers, shutdown)
    }

    /// Main event loop. Ticks every `tick_interval_secs` until `shutdown`
    /// broadcasts `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_interval_secs = self.config.tick_interval_secs,
            "scheduler engine started"
        );

        let period = StdDuration::from_secs(self.config.tick_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick();
                    if report.dispatched > 0 || report.load_errors > 0 {
                        info!(?report, "tick");
                    } else {
                        debug!(?report, "tick");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.instances.retire(self.workers.instance_id()) {
            warn!(error = %e, "failed to retire scheduler instance");
        }
    }
}

fn definition_from_seed(seed: &JobSeedConfig) -> Result<JobDefinition> {
    let timeplan = seed
        .timeplan
        .clone()
        .map(serde_json::from_value::<Timeplan>)
        .transpose()
        .map_err(|e| SchedulerError::InvalidTimeplan(format!("job {}: {e}", seed.name)))?;

    Ok(JobDefinition {
        name: seed.name.clone(),
        method: seed.method.clone(),
        period_secs: seed.period_secs,
        priority: seed.priority,
        active: seed.active,
        timeplan,
    })
}

fn seconds(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn engine(seed_builtin_jobs: bool) -> (SchedulerEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
        ));
        let config = SchedulerConfig {
            seed_builtin_jobs,
            ..SchedulerConfig::default()
        };
        let engine =
            SchedulerEngine::new(db::memory(), BackendRegistry::new(), clock.clone(), config)
                .unwrap();
        (engine, clock)
    }

    fn seed(name: &str, timeplan: Option<serde_json::Value>) -> JobSeedConfig {
        JobSeedConfig {
            name: name.into(),
            method: "setting.reload".into(),
            period_secs: 600,
            priority: 0,
            active: true,
            timeplan,
        }
    }

    #[test]
    fn seeding_includes_builtins_when_enabled() {
        let (engine, _) = engine(true);
        assert_eq!(engine.seed_jobs(&[seed("reload", None)]).unwrap(), 2);
        let methods: Vec<String> = engine
            .jobs()
            .list_jobs()
            .unwrap()
            .into_iter()
            .map(|j| j.method)
            .collect();
        assert!(methods.contains(&builtin::OPTIMIZE_DATABASE.to_string()));
    }

    #[test]
    fn seeding_twice_keeps_one_record_per_name() {
        let (engine, _) = engine(false);
        engine.seed_jobs(&[seed("reload", None)]).unwrap();
        engine.seed_jobs(&[seed("reload", None)]).unwrap();
        assert_eq!(engine.jobs().list_jobs().unwrap().len(), 1);
    }

    #[test]
    fn seed_timeplan_is_parsed() {
        let (engine, _) = engine(false);
        let plan = json!({"days": {"Wed": true}, "hours": {"8": true}, "minutes": {"0": true}});
        engine.seed_jobs(&[seed("morning", Some(plan))]).unwrap();
        let job = engine.jobs().list_jobs().unwrap().remove(0);
        assert!(job.timeplan.is_some());
    }

    #[test]
    fn bad_seed_timeplan_is_rejected() {
        let (engine, _) = engine(false);
        let plan = json!({"hours": {"25": true}});
        let err = engine.seed_jobs(&[seed("broken", Some(plan))]).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTimeplan(_)));
        assert!(engine.jobs().list_jobs().unwrap().is_empty());
    }

    #[test]
    fn tick_dispatches_due_jobs_once() {
        let (engine, _) = engine(false);
        engine.seed_jobs(&[seed("reload", None)]).unwrap();

        let first = engine.tick();
        assert_eq!(first.evaluated, 1);
        assert_eq!(first.dispatched, 1);

        let second = engine.tick();
        assert_eq!(second.dispatched, 0);
        assert_eq!(second.skipped_in_flight, 1);
        assert_eq!(engine.queue().count().unwrap(), 1);
    }

    #[test]
    fn tick_reports_cleanup() {
        let (engine, clock) = engine(false);
        engine
            .queue()
            .enqueue(None, builtin::OPTIMIZE_DATABASE, 0, clock.now())
            .unwrap();
        assert_eq!(engine.tick().cleanup.untouched, 1);
    }

    #[test]
    fn huge_timeouts_do_not_overflow() {
        assert_eq!(seconds(u64::MAX), Duration::MAX);
        assert_eq!(seconds(60), Duration::minutes(1));
    }

    #[test]
    fn tick_beats_for_this_process() {
        let (engine, clock) = engine(false);
        engine.tick();
        assert_eq!(
            engine
                .instances()
                .last_heartbeat(engine.workers().instance_id())
                .unwrap(),
            Some(clock.now())
        );
    }

    #[test]
    fn jobs_without_a_backend_are_reported() {
        let (engine, _) = engine(true);
        let mut other = seed("purge", None);
        other.method = "cache.purge".into();
        engine
            .seed_jobs(&[seed("reload", None), seed("reload again", None), other])
            .unwrap();

        assert_eq!(
            engine.unbound_methods().unwrap(),
            vec!["cache.purge".to_string(), "setting.reload".to_string()]
        );
    }

    #[test]
    fn undecodable_job_row_does_not_block_the_others() {
        let conn = db::memory();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
        ));
        let config = SchedulerConfig {
            seed_builtin_jobs: false,
            ..SchedulerConfig::default()
        };
        let engine =
            SchedulerEngine::new(conn.clone(), BackendRegistry::new(), clock, config).unwrap();
        engine
            .seed_jobs(&[seed("healthy", None), seed("corrupted", None)])
            .unwrap();
        db::lock(&conn)
            .unwrap()
            .execute(
                "UPDATE scheduler_jobs SET status = 'bogus' WHERE name = 'corrupted'",
                [],
            )
            .unwrap();

        let report = engine.tick();
        assert_eq!(report.load_errors, 1);
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.dispatched, 1);
        let healthy: String = db::lock(&conn)
            .unwrap()
            .query_row(
                "SELECT id FROM scheduler_jobs WHERE name = 'healthy'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        let queued = engine.queue().list_unlocked_items().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].job_id.as_deref(), Some(healthy.as_str()));
    }
}
