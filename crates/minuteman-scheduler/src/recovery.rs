//! Cleanup pass: reclaims claims left by dead workers and finishes stuck
//! long-running tasks.
//!
//! The pass runs as the first step of every tick. Calling it from anywhere
//! else requires `force`.
//!
//! A claim is live when its worker is registered in this process, or when it
//! belongs to another scheduler process whose heartbeat is recent.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use crate::backend::BackendRegistry;
use crate::clock::Clock;
use crate::error::{Result, SchedulerError};
use crate::instances::InstanceRegistry;
use crate::queue::{JobQueue, WorkerSet};
use crate::tasks::LongRunningTaskStore;
use crate::types::QueueItem;

/// Proof that the caller is the tick loop. Only this crate can mint one.
#[derive(Debug)]
pub struct TickToken {
    _private: (),
}

impl TickToken {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

/// What one cleanup pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Unclaimed items, left waiting for a worker.
    pub untouched: usize,
    /// Claimed items whose worker is still alive, here or in a live peer process.
    pub alive: usize,
    /// Orphaned items released back into the queue.
    pub rescheduled: usize,
    /// Orphaned items deleted.
    pub discarded: usize,
    /// Items (or sweep steps) that could not be reconciled this time.
    pub failed: usize,
    /// Stuck long-running tasks finished with an error annotation.
    pub force_finished: usize,
}

enum Reconciled {
    Rescheduled,
    Discarded,
}

/// How long before stuck work is given up on.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryTimeouts {
    /// Long-running tasks started longer ago than this are force-finished.
    pub stale_task_after: Duration,
    /// Peer processes with an older heartbeat are dead.
    pub instance_timeout: Duration,
}

pub struct RecoveryCoordinator {
    queue: JobQueue,
    workers: WorkerSet,
    tasks: LongRunningTaskStore,
    instances: InstanceRegistry,
    backends: Arc<BackendRegistry>,
    clock: Arc<dyn Clock>,
    timeouts: RecoveryTimeouts,
}

impl RecoveryCoordinator {
    pub fn new(
        queue: JobQueue,
        workers: WorkerSet,
        tasks: LongRunningTaskStore,
        instances: InstanceRegistry,
        backends: Arc<BackendRegistry>,
        clock: Arc<dyn Clock>,
        timeouts: RecoveryTimeouts,
    ) -> Self {
        Self {
            queue,
            workers,
            tasks,
            instances,
            backends,
            clock,
            timeouts,
        }
    }

    /// Run a cleanup pass.
    ///
    /// Without a [`TickToken`] the call is rejected with
    /// [`SchedulerError::CleanupOutsideTick`] unless `force` is set. That
    /// error is a usage bug; everything that goes wrong *during* the sweep is
    /// logged, counted in the report and never returned.
    pub fn cleanup(&self, token: Option<&TickToken>, force: bool) -> Result<CleanupReport> {
        if token.is_none() {
            if !force {
                return Err(SchedulerError::CleanupOutsideTick);
            }
            warn!("forced cleanup outside the tick loop");
        }
        Ok(self.sweep())
    }

    #[instrument(skip(self))]
    fn sweep(&self) -> CleanupReport {
        let started = self.clock.now();
        let mut report = CleanupReport::default();

        match self.queue.list_unlocked_items() {
            Ok(items) => report.untouched = items.len(),
            Err(e) => {
                error!(error = %e, "failed to list unlocked queue items");
                report.failed += 1;
            }
        }

        let locked = match self.queue.list_locked_items() {
            Ok(items) => items,
            Err(e) => {
                error!(error = %e, "failed to list locked queue items");
                report.failed += 1;
                Vec::new()
            }
        };

        let mut peers = HashMap::new();
        for item in locked {
            match self.owner_alive(&item, started, &mut peers) {
                Ok(true) => {
                    report.alive += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(item_id = item.id, error = %e, "owner liveness check failed");
                    report.failed += 1;
                    continue;
                }
            }
            match self.reconcile(&item, started) {
                Ok(Reconciled::Rescheduled) => report.rescheduled += 1,
                Ok(Reconciled::Discarded) => report.discarded += 1,
                Err(e) => {
                    warn!(item_id = item.id, method = %item.method, error = %e, "orphan reconciliation failed");
                    report.failed += 1;
                }
            }
        }

        // Strictly before the pass began: work started during the sweep is never touched.
        let stale_before = cutoff(started, self.timeouts.stale_task_after);
        match self.tasks.force_finish_stale(stale_before, started) {
            Ok(n) => report.force_finished = n,
            Err(e) => {
                error!(error = %e, "failed to finish stale long-running tasks");
                report.failed += 1;
            }
        }

        if let Err(e) = self
            .instances
            .prune(cutoff(started, self.timeouts.instance_timeout))
        {
            error!(error = %e, "failed to prune dead scheduler instances");
            report.failed += 1;
        }

        debug!(?report, "cleanup pass done");
        report
    }

    /// Whether the worker holding `item` may still be running it.
    ///
    /// `peers` caches the verdict per foreign instance for one sweep.
    fn owner_alive(
        &self,
        item: &QueueItem,
        now: DateTime<Utc>,
        peers: &mut HashMap<String, bool>,
    ) -> Result<bool> {
        if self.workers.is_owner_alive(item) {
            return Ok(true);
        }
        let Some(instance) = item.locked_by.as_deref().and_then(WorkerSet::owner_instance) else {
            return Ok(false);
        };
        if instance == self.workers.instance_id() {
            return Ok(false);
        }
        if let Some(&alive) = peers.get(instance) {
            return Ok(alive);
        }

        let alive = self
            .instances
            .last_heartbeat(instance)?
            .is_some_and(|beat| now - beat < self.timeouts.instance_timeout);
        if alive {
            debug!(item_id = item.id, instance, "claim held by a live peer process");
        }
        peers.insert(instance.to_string(), alive);
        Ok(alive)
    }

    fn reconcile(&self, item: &QueueItem, now: DateTime<Utc>) -> Result<Reconciled> {
        let backend = self.backends.resolve(&item.method)?;
        let reschedule = catch_unwind(AssertUnwindSafe(|| backend.reschedule(item)))
            .map_err(|_| SchedulerError::ReschedulePanicked {
                method: item.method.clone(),
            })?;

        if reschedule {
            self.queue.release_lock(item.id, now)?;
            warn!(item_id = item.id, owner = ?item.locked_by, "orphaned queue item put back");
            Ok(Reconciled::Rescheduled)
        } else {
            self.queue.delete_item(item.id)?;
            warn!(item_id = item.id, owner = ?item.locked_by, "orphaned queue item discarded");
            Ok(Reconciled::Discarded)
        }
    }
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC)
}
