//! Turns due jobs into queue items and records how their runs ended.

use std::any::Any;
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::backend::BackendRegistry;
use crate::clock::Clock;
use crate::error::Result;
use crate::jobs::JobRegistry;
use crate::queue::JobQueue;
use crate::types::{JobRecord, QueueItem};

pub struct Dispatcher {
    jobs: JobRegistry,
    queue: JobQueue,
    backends: Arc<BackendRegistry>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    pub fn new(
        jobs: JobRegistry,
        queue: JobQueue,
        backends: Arc<BackendRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobs,
            queue,
            backends,
            clock,
        }
    }

    /// Queue one unit of work for `job`. Called from the tick loop; never
    /// waits for the job to run.
    pub fn dispatch(&self, job: &JobRecord) -> Result<QueueItem> {
        let item = self
            .queue
            .enqueue(Some(&job.id), &job.method, job.priority, self.clock.now())?;
        info!(job_id = %job.id, name = %job.name, item_id = item.id, "job dispatched");
        Ok(item)
    }

    /// Run `job`'s backend and persist the outcome.
    ///
    /// Never fails: a fault raised by the job body (error or panic), or an
    /// unresolvable method, is recorded as `status = error` and the job is
    /// taken out of rotation. Returns the updated record.
    #[instrument(skip(self, job), fields(job_id = %job.id, method = %job.method))]
    pub async fn start_job(&self, mut job: JobRecord) -> JobRecord {
        let started = self.clock.now();

        match invoke(&self.backends, &job.method).await {
            Ok(()) => {
                job.mark_succeeded(started);
                info!("job finished");
            }
            Err(message) => {
                error!(error = %message, "job failed, deactivating");
                job.mark_failed(started, message);
            }
        }

        if let Err(e) = self.jobs.save_outcome(&job) {
            error!(error = %e, "failed to persist job outcome");
        }
        job
    }

    /// Execute one claimed queue item on behalf of a worker.
    ///
    /// Job-bound items go through [`Dispatcher::start_job`]; raw backend items
    /// just run, with faults logged.
    pub async fn run_item(&self, item: &QueueItem) {
        let Some(job_id) = item.job_id.as_deref() else {
            if let Err(message) = invoke(&self.backends, &item.method).await {
                error!(item_id = item.id, method = %item.method, error = %message, "queued call failed");
            }
            return;
        };

        match self.jobs.get(job_id) {
            Ok(Some(job)) if job.active => {
                self.start_job(job).await;
            }
            Ok(Some(_)) => debug!(job_id, "job deactivated since dispatch, skipping"),
            Ok(None) => warn!(job_id, item_id = item.id, "queued job no longer exists"),
            Err(e) => error!(job_id, error = %e, "failed to load queued job"),
        }
    }
}

/// Resolve and run a backend on its own task so a panic stays contained.
async fn invoke(backends: &BackendRegistry, method: &str) -> std::result::Result<(), String> {
    let backend = backends.resolve(method).map_err(|e| e.to_string())?;
    match tokio::spawn(async move { backend.start().await }).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(join) if join.is_panic() => Err(panic_message(join.into_panic())),
        Err(join) => Err(format!("job task aborted: {join}")),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("job panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("job panicked: {s}")
    } else {
        "job panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::clock::ManualClock;
    use crate::db;
    use crate::types::{JobDefinition, JobStatus};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting(AtomicUsize);

    #[async_trait]
    impl Backend for Arc<Counting> {
        async fn start(&self) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Backend for Failing {
        async fn start(&self) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
    }

    struct Panicking;

    #[async_trait]
    impl Backend for Panicking {
        async fn start(&self) -> anyhow::Result<()> {
            panic!("unexpected state")
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        jobs: JobRegistry,
        queue: JobQueue,
        clock: Arc<ManualClock>,
        counter: Arc<Counting>,
    }

    fn fixture() -> Fixture {
        let conn = db::memory();
        let jobs = JobRegistry::new(conn.clone());
        let queue = JobQueue::new(conn);
        let counter = Arc::new(Counting::default());
        let mut backends = BackendRegistry::new();
        backends.register("setting.reload", Arc::clone(&counter));
        backends.register("disk.fill", Failing);
        backends.register("state.explode", Panicking);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
        ));
        let dispatcher = Dispatcher::new(
            jobs.clone(),
            queue.clone(),
            Arc::new(backends),
            clock.clone(),
        );
        Fixture {
            dispatcher,
            jobs,
            queue,
            clock,
            counter,
        }
    }

    fn add(f: &Fixture, method: &str) -> JobRecord {
        let def = JobDefinition {
            name: method.into(),
            method: method.into(),
            period_secs: 600,
            priority: 0,
            active: true,
            timeplan: None,
        };
        f.jobs.add_job(def, f.clock.now()).unwrap()
    }

    #[tokio::test]
    async fn successful_run_sets_ok() {
        let f = fixture();
        let job = add(&f, "setting.reload");

        let done = f.dispatcher.start_job(job.clone()).await;
        assert_eq!(done.status, JobStatus::Ok);
        assert!(done.active);
        assert!(done.error_message.is_none());
        assert_eq!(done.last_run, Some(f.clock.now()));
        assert_eq!(f.counter.0.load(Ordering::SeqCst), 1);

        let stored = f.jobs.get(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Ok);
        assert_eq!(stored.last_run, Some(f.clock.now()));
    }

    #[tokio::test]
    async fn failing_run_sets_error_and_deactivates() {
        let f = fixture();
        let job = add(&f, "disk.fill");

        let done = f.dispatcher.start_job(job.clone()).await;
        assert_eq!(done.status, JobStatus::Error);
        assert!(!done.active);
        assert!(done.error_message.as_deref().unwrap().contains("disk full"));

        let stored = f.jobs.get(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert!(!stored.active);
        assert_eq!(stored.last_run, Some(f.clock.now()));
    }

    #[tokio::test]
    async fn panicking_run_is_contained() {
        let f = fixture();
        let job = add(&f, "state.explode");

        let done = f.dispatcher.start_job(job).await;
        assert_eq!(done.status, JobStatus::Error);
        assert!(done
            .error_message
            .as_deref()
            .unwrap()
            .contains("unexpected state"));
    }

    #[tokio::test]
    async fn unknown_method_is_a_job_fault() {
        let f = fixture();
        let job = add(&f, "no.such.method");

        let done = f.dispatcher.start_job(job).await;
        assert_eq!(done.status, JobStatus::Error);
        assert!(!done.active);
        assert!(done.error_message.unwrap().contains("no.such.method"));
    }

    #[tokio::test]
    async fn dispatch_enqueues_and_run_item_executes() {
        let f = fixture();
        let job = add(&f, "setting.reload");

        let item = f.dispatcher.dispatch(&job).unwrap();
        assert_eq!(item.job_id.as_deref(), Some(job.id.as_str()));
        assert!(f.queue.has_item_for_job(&job.id).unwrap());
        assert_eq!(f.counter.0.load(Ordering::SeqCst), 0);

        f.dispatcher.run_item(&item).await;
        assert_eq!(f.counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(
            f.jobs.get(&job.id).unwrap().unwrap().status,
            JobStatus::Ok
        );
    }

    #[tokio::test]
    async fn raw_items_do_not_touch_jobs() {
        let f = fixture();
        let item = f.queue.enqueue(None, "setting.reload", 0, f.clock.now()).unwrap();
        f.dispatcher.run_item(&item).await;
        assert_eq!(f.counter.0.load(Ordering::SeqCst), 1);

        // a failing raw call is only logged
        let item = f.queue.enqueue(None, "disk.fill", 0, f.clock.now()).unwrap();
        f.dispatcher.run_item(&item).await;
        assert!(f.jobs.failed_jobs().unwrap().is_empty());
    }
}
