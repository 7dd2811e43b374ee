use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::OptionalExtension;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{self, from_db_time, opt_from_db_time, to_db_time, SharedConnection};
use crate::error::Result;
use crate::types::LongRunningTask;

/// Result annotation written onto tasks the recovery pass had to finish.
pub const FORCE_FINISHED_ERROR: &str =
    "interrupted: force-finished by recovery after exceeding the staleness threshold";

const TASK_COLUMNS: &str = "id, name, started_at, finished_at, result, created_at";

/// Store for self-reporting long-running tasks (bulk imports and the like).
#[derive(Clone)]
pub struct LongRunningTaskStore {
    conn: SharedConnection,
}

impl LongRunningTaskStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Record a task that has not started yet.
    pub fn create(&self, name: &str, now: DateTime<Utc>) -> Result<LongRunningTask> {
        self.insert(name, None, now)
    }

    /// Record a task that starts at `now`.
    pub fn start(&self, name: &str, now: DateTime<Utc>) -> Result<LongRunningTask> {
        self.insert(name, Some(now), now)
    }

    fn insert(
        &self,
        name: &str,
        started_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<LongRunningTask> {
        let task = LongRunningTask {
            id: Uuid::now_v7().to_string(),
            name: name.to_string(),
            started_at,
            finished_at: None,
            result: serde_json::json!({}),
            created_at: now,
        };
        let conn = db::lock(&self.conn)?;
        conn.execute(
            "INSERT INTO long_running_tasks (id, name, started_at, finished_at, result, created_at)
             VALUES (?1, ?2, ?3, NULL, '{}', ?4)",
            rusqlite::params![task.id, task.name, started_at.map(to_db_time), to_db_time(now)],
        )?;
        Ok(task)
    }

    /// Mark a task finished with the given result object.
    pub fn finish(&self, id: &str, result: serde_json::Value, now: DateTime<Utc>) -> Result<bool> {
        let conn = db::lock(&self.conn)?;
        let n = conn.execute(
            "UPDATE long_running_tasks SET finished_at = ?2, result = ?3 WHERE id = ?1",
            rusqlite::params![id, to_db_time(now), serde_json::to_string(&result)?],
        )?;
        Ok(n > 0)
    }

    pub fn get(&self, id: &str) -> Result<Option<LongRunningTask>> {
        let conn = db::lock(&self.conn)?;
        let sql = format!("SELECT {TASK_COLUMNS} FROM long_running_tasks WHERE id = ?1");
        Ok(conn.query_row(&sql, [id], row_to_task).optional()?)
    }

    /// Finish every task started before `cutoff` that never reported back.
    ///
    /// The result object of each one gains an `error` entry. Tasks that never
    /// started, or started at/after `cutoff`, are left alone. Returns the
    /// number of tasks finished.
    pub fn force_finish_stale(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize> {
        let conn = db::lock(&self.conn)?;
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM long_running_tasks
             WHERE finished_at IS NULL AND started_at IS NOT NULL AND started_at < ?1"
        );
        let stale = {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([to_db_time(cutoff)], row_to_task)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut finished = 0;
        for task in stale {
            let mut result = match task.result {
                serde_json::Value::Object(map) => map,
                other => {
                    let mut map = serde_json::Map::new();
                    if !other.is_null() {
                        map.insert("previous".to_string(), other);
                    }
                    map
                }
            };
            result.insert(
                "error".to_string(),
                serde_json::Value::String(FORCE_FINISHED_ERROR.to_string()),
            );

            // guarded on finished_at so a task that reports back meanwhile wins
            let n = conn.execute(
                "UPDATE long_running_tasks SET finished_at = ?2, result = ?3
                 WHERE id = ?1 AND finished_at IS NULL",
                rusqlite::params![
                    task.id,
                    to_db_time(now),
                    serde_json::to_string(&serde_json::Value::Object(result))?
                ],
            )?;
            if n > 0 {
                warn!(task_id = %task.id, name = %task.name, "stuck long-running task force-finished");
                finished += 1;
            }
        }
        if finished > 0 {
            info!(count = finished, "stale long-running tasks finished");
        }
        Ok(finished)
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<LongRunningTask> {
    let result = serde_json::from_str(&row.get::<_, String>(4)?)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    Ok(LongRunningTask {
        id: row.get(0)?,
        name: row.get(1)?,
        started_at: opt_from_db_time(2, row.get(2)?)?,
        finished_at: opt_from_db_time(3, row.get(3)?)?,
        result,
        created_at: from_db_time(5, &row.get::<_, String>(5)?)?,
    })
}
