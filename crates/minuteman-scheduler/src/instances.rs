//! Heartbeats of the scheduler processes sharing one database.
//!
//! A worker's claim names the process it runs in. Another process treats
//! that claim as alive for as long as the owning process keeps beating.

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use tracing::{debug, info};

use crate::db::{self, from_db_time, to_db_time, SharedConnection};
use crate::error::Result;

#[derive(Clone)]
pub struct InstanceRegistry {
    conn: SharedConnection,
}

impl InstanceRegistry {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Record that `instance_id` is alive at `now`.
    pub fn heartbeat(&self, instance_id: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = db::lock(&self.conn)?;
        conn.execute(
            "INSERT INTO scheduler_instances (id, heartbeat_at) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET heartbeat_at = excluded.heartbeat_at",
            rusqlite::params![instance_id, to_db_time(now)],
        )?;
        debug!(instance_id, "heartbeat");
        Ok(())
    }

    pub fn last_heartbeat(&self, instance_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = db::lock(&self.conn)?;
        let beat = conn
            .query_row(
                "SELECT heartbeat_at FROM scheduler_instances WHERE id = ?1",
                [instance_id],
                |row| from_db_time(0, &row.get::<_, String>(0)?),
            )
            .optional()?;
        Ok(beat)
    }

    /// Remove the row of a process that shut down cleanly.
    pub fn retire(&self, instance_id: &str) -> Result<bool> {
        let conn = db::lock(&self.conn)?;
        let n = conn.execute("DELETE FROM scheduler_instances WHERE id = ?1", [instance_id])?;
        Ok(n > 0)
    }

    /// Drop instances whose last heartbeat is older than `cutoff`.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = db::lock(&self.conn)?;
        let n = conn.execute(
            "DELETE FROM scheduler_instances WHERE heartbeat_at < ?1",
            [to_db_time(cutoff)],
        )?;
        if n > 0 {
            info!(count = n, "dead scheduler instances pruned");
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn heartbeat_upserts_and_retire_removes() {
        let instances = InstanceRegistry::new(db::memory());
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();

        assert!(instances.last_heartbeat("a").unwrap().is_none());
        instances.heartbeat("a", t0).unwrap();
        instances.heartbeat("a", t0 + Duration::seconds(5)).unwrap();
        assert_eq!(
            instances.last_heartbeat("a").unwrap(),
            Some(t0 + Duration::seconds(5))
        );

        assert!(instances.retire("a").unwrap());
        assert!(!instances.retire("a").unwrap());
    }

    #[test]
    fn prune_keeps_recent_instances() {
        let instances = InstanceRegistry::new(db::memory());
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        instances.heartbeat("old", t0).unwrap();
        instances.heartbeat("new", t0 + Duration::minutes(5)).unwrap();

        assert_eq!(instances.prune(t0 + Duration::minutes(1)).unwrap(), 1);
        assert!(instances.last_heartbeat("old").unwrap().is_none());
        assert!(instances.last_heartbeat("new").unwrap().is_some());
    }
}
