use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::dispatcher::Dispatcher;
use crate::queue::{JobQueue, WorkerGuard, WorkerSet};

/// Everything a worker task needs; cloned once per worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: JobQueue,
    pub dispatcher: Arc<Dispatcher>,
    pub workers: WorkerSet,
    pub clock: Arc<dyn Clock>,
    /// Idle wait between two empty claims.
    pub poll: Duration,
}

/// Spawn `count` workers draining the queue until `shutdown` broadcasts `true`.
///
/// Each worker is registered as alive before this returns, so its claims are
/// never mistaken for orphans. A worker finishes the item it is running
/// before it exits.
pub fn spawn_workers(
    ctx: WorkerContext,
    count: usize,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|n| {
            let guard = ctx.workers.register(&format!("worker{n}"));
            let ctx = ctx.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker_loop(guard, ctx, shutdown).await })
        })
        .collect()
}

async fn worker_loop(guard: WorkerGuard, ctx: WorkerContext, mut shutdown: watch::Receiver<bool>) {
    info!(worker_id = %guard.id(), "worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        match ctx.queue.claim_next(guard.id(), ctx.clock.now()) {
            Ok(Some(item)) => {
                debug!(worker_id = %guard.id(), item_id = item.id, method = %item.method, "claimed queue item");
                ctx.dispatcher.run_item(&item).await;
                if let Err(e) = ctx.queue.complete(item.id) {
                    error!(item_id = item.id, error = %e, "failed to remove finished queue item");
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => error!(worker_id = %guard.id(), error = %e, "claim failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(ctx.poll) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    info!(worker_id = %guard.id(), "worker stopped");
}
