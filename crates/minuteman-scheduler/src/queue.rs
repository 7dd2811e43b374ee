//! SQLite-backed work queue and in-process worker liveness.
//!
//! A worker claims an item by stamping `locked_at`/`locked_by`. Worker ids
//! are `<instance>/<name>-<uuid>`, so a claim also names the process that
//! holds it. A claim of this process whose worker is not in the
//! [`WorkerSet`] belongs to a dead worker and is an orphan for the recovery
//! pass to reconcile.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::OptionalExtension;
use tracing::debug;
use uuid::Uuid;

use crate::db::{self, from_db_time, opt_from_db_time, to_db_time, SharedConnection};
use crate::error::Result;
use crate::types::QueueItem;

const ITEM_COLUMNS: &str =
    "id, job_id, method, priority, attempts, run_at, locked_at, locked_by, created_at";

/// The shared queue feeding the worker pool.
#[derive(Clone)]
pub struct JobQueue {
    conn: SharedConnection,
}

impl JobQueue {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Add an unclaimed item, runnable from `now`.
    pub fn enqueue(
        &self,
        job_id: Option<&str>,
        method: &str,
        priority: i32,
        now: DateTime<Utc>,
    ) -> Result<QueueItem> {
        let conn = db::lock(&self.conn)?;
        let sql = format!(
            "INSERT INTO queue_items (job_id, method, priority, attempts, run_at, created_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?4)
             RETURNING {ITEM_COLUMNS}"
        );
        let item = conn.query_row(
            &sql,
            rusqlite::params![job_id, method, priority, to_db_time(now)],
            row_to_item,
        )?;
        debug!(item_id = item.id, method, "queue item enqueued");
        Ok(item)
    }

    /// Atomically claim the next runnable item for `worker_id`.
    ///
    /// The select and the stamp happen in one statement, so exactly one
    /// claimant observes the unclaimed → claimed transition, even across
    /// processes sharing the database file.
    pub fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<QueueItem>> {
        let conn = db::lock(&self.conn)?;
        let sql = format!(
            "UPDATE queue_items SET locked_at = ?1, locked_by = ?2
             WHERE locked_at IS NULL AND id = (
                 SELECT id FROM queue_items
                 WHERE locked_at IS NULL AND run_at <= ?1
                 ORDER BY priority DESC, run_at, id
                 LIMIT 1)
             RETURNING {ITEM_COLUMNS}"
        );
        let item = conn
            .query_row(
                &sql,
                rusqlite::params![to_db_time(now), worker_id],
                row_to_item,
            )
            .optional()?;
        Ok(item)
    }

    /// Remove an item after its worker finished it. Returns whether it existed.
    pub fn complete(&self, item_id: i64) -> Result<bool> {
        self.delete_item(item_id)
    }

    /// Delete an item outright, releasing any claim with it.
    pub fn delete_item(&self, item_id: i64) -> Result<bool> {
        let conn = db::lock(&self.conn)?;
        let n = conn.execute("DELETE FROM queue_items WHERE id = ?1", [item_id])?;
        Ok(n > 0)
    }

    /// Drop the claim but keep the item, so a future worker picks it up fresh.
    pub fn release_lock(&self, item_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let conn = db::lock(&self.conn)?;
        let n = conn.execute(
            "UPDATE queue_items
             SET locked_at = NULL, locked_by = NULL, attempts = attempts + 1, run_at = ?2
             WHERE id = ?1",
            rusqlite::params![item_id, to_db_time(now)],
        )?;
        Ok(n > 0)
    }

    pub fn get(&self, item_id: i64) -> Result<Option<QueueItem>> {
        let conn = db::lock(&self.conn)?;
        let sql = format!("SELECT {ITEM_COLUMNS} FROM queue_items WHERE id = ?1");
        Ok(conn.query_row(&sql, [item_id], row_to_item).optional()?)
    }

    pub fn list_locked_items(&self) -> Result<Vec<QueueItem>> {
        self.query_items("locked_at IS NOT NULL")
    }

    pub fn list_unlocked_items(&self) -> Result<Vec<QueueItem>> {
        self.query_items("locked_at IS NULL")
    }

    /// Whether an item for `job_id` is queued or in flight.
    pub fn has_item_for_job(&self, job_id: &str) -> Result<bool> {
        let conn = db::lock(&self.conn)?;
        let found = conn
            .query_row(
                "SELECT 1 FROM queue_items WHERE job_id = ?1 LIMIT 1",
                [job_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn count(&self) -> Result<usize> {
        let conn = db::lock(&self.conn)?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM queue_items", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    fn query_items(&self, filter: &str) -> Result<Vec<QueueItem>> {
        let conn = db::lock(&self.conn)?;
        let sql = format!("SELECT {ITEM_COLUMNS} FROM queue_items WHERE {filter} ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map([], row_to_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueItem> {
    Ok(QueueItem {
        id: row.get(0)?,
        job_id: row.get(1)?,
        method: row.get(2)?,
        priority: row.get(3)?,
        attempts: row.get::<_, i64>(4)?.max(0) as u32,
        run_at: from_db_time(5, &row.get::<_, String>(5)?)?,
        locked_at: opt_from_db_time(6, row.get(6)?)?,
        locked_by: row.get(7)?,
        created_at: from_db_time(8, &row.get::<_, String>(8)?)?,
    })
}

const OWNER_SEPARATOR: char = '/';

/// Ids of the workers alive in this process.
///
/// Cheap to clone; all clones share the same set and instance id.
#[derive(Clone)]
pub struct WorkerSet {
    instance_id: Arc<str>,
    live: Arc<DashMap<String, DateTime<Utc>>>,
}

impl Default for WorkerSet {
    fn default() -> Self {
        Self {
            instance_id: Uuid::now_v7().to_string().into(),
            live: Arc::default(),
        }
    }
}

impl WorkerSet {
    /// A set for a new scheduler process, with a fresh instance id.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Instance part of a worker id, if it has one.
    pub fn owner_instance(worker_id: &str) -> Option<&str> {
        worker_id
            .split_once(OWNER_SEPARATOR)
            .map(|(instance, _)| instance)
    }

    /// Register a new worker. It stays alive until the guard is dropped.
    pub fn register(&self, name: &str) -> WorkerGuard {
        let id = format!(
            "{}{OWNER_SEPARATOR}{name}-{}",
            self.instance_id,
            Uuid::now_v7()
        );
        self.live.insert(id.clone(), Utc::now());
        debug!(worker_id = %id, "worker registered");
        WorkerGuard {
            id,
            live: Arc::clone(&self.live),
        }
    }

    pub fn is_alive(&self, worker_id: &str) -> bool {
        self.live.contains_key(worker_id)
    }

    /// True iff the worker holding `item`'s claim is alive in this process.
    ///
    /// Claims of other processes are never alive here; see
    /// [`crate::instances`] for those.
    pub fn is_owner_alive(&self, item: &QueueItem) -> bool {
        item.locked_by
            .as_deref()
            .is_some_and(|owner| self.is_alive(owner))
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

/// Liveness token of one worker; deregisters it on drop (including unwinding).
pub struct WorkerGuard {
    id: String,
    live: Arc<DashMap<String, DateTime<Utc>>>,
}

impl WorkerGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.live.remove(&self.id);
        debug!(worker_id = %self.id, "worker deregistered");
    }
}
