use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::{Result, SchedulerError};

/// Connection handle shared by the job registry, the queue and the task store.
///
/// Every component locks the same connection, so an in-memory database is
/// visible to all of them and claims are serialized in-process.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Wrap an already-open connection for sharing.
pub fn share(conn: Connection) -> SharedConnection {
    Arc::new(Mutex::new(conn))
}

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `scheduler_jobs`, `queue_items`, `long_running_tasks` and
/// `scheduler_instances` tables (idempotent) plus the indexes the tick and
/// claim queries rely on.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS scheduler_jobs (
            id             TEXT    NOT NULL PRIMARY KEY,
            name           TEXT    NOT NULL UNIQUE,
            method         TEXT    NOT NULL,
            period_secs    INTEGER NOT NULL,
            priority       INTEGER NOT NULL DEFAULT 0,
            active         INTEGER NOT NULL DEFAULT 1,
            timeplan       TEXT,               -- JSON-encoded Timeplan or NULL
            last_run       TEXT,               -- RFC 3339 or NULL
            status         TEXT    NOT NULL DEFAULT 'waiting',
            error_message  TEXT,
            created_at     TEXT    NOT NULL,
            updated_at     TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_scheduler_jobs_active
            ON scheduler_jobs (active, priority DESC);

        CREATE TABLE IF NOT EXISTS queue_items (
            id          INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
            job_id      TEXT,                  -- NULL for raw backend invocations
            method      TEXT    NOT NULL,
            priority    INTEGER NOT NULL DEFAULT 0,
            attempts    INTEGER NOT NULL DEFAULT 0,
            run_at      TEXT    NOT NULL,
            locked_at   TEXT,
            locked_by   TEXT,
            created_at  TEXT    NOT NULL
        ) STRICT;

        -- Claim query: oldest runnable unlocked item with the highest priority
        CREATE INDEX IF NOT EXISTS idx_queue_items_claim
            ON queue_items (locked_at, priority DESC, run_at);
        CREATE INDEX IF NOT EXISTS idx_queue_items_job ON queue_items (job_id);

        CREATE TABLE IF NOT EXISTS long_running_tasks (
            id           TEXT NOT NULL PRIMARY KEY,
            name         TEXT NOT NULL,
            started_at   TEXT,
            finished_at  TEXT,
            result       TEXT NOT NULL DEFAULT '{}',   -- JSON object
            created_at   TEXT NOT NULL
        ) STRICT;

        -- One row per running scheduler process; workers' claims carry its id
        CREATE TABLE IF NOT EXISTS scheduler_instances (
            id            TEXT NOT NULL PRIMARY KEY,
            heartbeat_at  TEXT NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// Lock the shared connection, mapping poisoning to a scheduler error.
pub(crate) fn lock(conn: &SharedConnection) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|_| SchedulerError::LockPoisoned)
}

/// Fixed-width RFC 3339 so that text ordering in SQL equals time ordering.
pub(crate) fn to_db_time(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn from_db_time(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn opt_from_db_time(
    idx: usize,
    s: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| from_db_time(idx, &s)).transpose()
}

#[cfg(test)]
pub(crate) fn memory() -> SharedConnection {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    init_db(&conn).expect("init schema");
    share(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }

    #[test]
    fn db_time_sorts_lexicographically() {
        let early = Utc.with_ymd_and_hms(2024, 1, 2, 9, 5, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap();
        assert!(to_db_time(early) < to_db_time(late));
        assert_eq!(from_db_time(0, &to_db_time(early)).unwrap(), early);
    }
}
