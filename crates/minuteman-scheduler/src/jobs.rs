use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use tracing::{error, info, instrument};

use crate::db::{self, from_db_time, opt_from_db_time, to_db_time, SharedConnection};
use crate::error::{Result, SchedulerError};
use crate::timeplan::Timeplan;
use crate::types::{JobDefinition, JobRecord, JobStatus};

const JOB_COLUMNS: &str = "id, name, method, period_secs, priority, active, timeplan,
     last_run, status, error_message, created_at, updated_at";

/// Read/write access to persisted [`JobRecord`]s.
///
/// The tick loop reads active jobs, workers write run outcomes, and
/// operators list or restart failed jobs.
#[derive(Clone)]
pub struct JobRegistry {
    conn: SharedConnection,
}

impl JobRegistry {
    /// Wrap a shared, `init_db`-initialised connection.
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Insert a new job. Fails if the name is already taken.
    #[instrument(skip(self, def), fields(name = %def.name, method = %def.method))]
    pub fn add_job(&self, def: JobDefinition, now: DateTime<Utc>) -> Result<JobRecord> {
        let job = JobRecord::from_definition(def, now);
        let timeplan = encode_timeplan(job.timeplan.as_ref())?;
        let now_str = to_db_time(now);

        let conn = db::lock(&self.conn)?;
        conn.execute(
            "INSERT INTO scheduler_jobs
             (id, name, method, period_secs, priority, active, timeplan,
              last_run, status, error_message, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,NULL,'waiting',NULL,?8,?8)",
            rusqlite::params![
                job.id,
                job.name,
                job.method,
                period_to_db(job.period_secs),
                job.priority,
                job.active,
                timeplan,
                now_str
            ],
        )?;
        info!(job_id = %job.id, "job added");
        Ok(job)
    }

    /// Insert or update a job definition, matched by name.
    ///
    /// Runtime state (`last_run`, `status`, `error_message`) is kept. A job
    /// that is currently failed stays inactive; only a restart re-enables it.
    #[instrument(skip(self, def), fields(name = %def.name))]
    pub fn upsert_definition(&self, def: JobDefinition, now: DateTime<Utc>) -> Result<JobRecord> {
        let fresh = JobRecord::from_definition(def, now);
        let timeplan = encode_timeplan(fresh.timeplan.as_ref())?;
        let now_str = to_db_time(now);

        let conn = db::lock(&self.conn)?;
        conn.execute(
            "INSERT INTO scheduler_jobs
             (id, name, method, period_secs, priority, active, timeplan,
              last_run, status, error_message, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,NULL,'waiting',NULL,?8,?8)
             ON CONFLICT(name) DO UPDATE SET
                method      = excluded.method,
                period_secs = excluded.period_secs,
                priority    = excluded.priority,
                active      = CASE WHEN scheduler_jobs.status = 'error'
                                   THEN 0 ELSE excluded.active END,
                timeplan    = excluded.timeplan,
                updated_at  = excluded.updated_at",
            rusqlite::params![
                fresh.id,
                fresh.name,
                fresh.method,
                period_to_db(fresh.period_secs),
                fresh.priority,
                fresh.active,
                timeplan,
                now_str
            ],
        )?;

        let sql = format!("SELECT {JOB_COLUMNS} FROM scheduler_jobs WHERE name = ?1");
        let job = conn.query_row(&sql, [&fresh.name], row_to_job)?;
        info!(job_id = %job.id, "job definition upserted");
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Result<Option<JobRecord>> {
        let conn = db::lock(&self.conn)?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM scheduler_jobs WHERE id = ?1");
        match conn.query_row(&sql, [id], row_to_job) {
            Ok(job) => Ok(Some(job)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SchedulerError::Database(e)),
        }
    }

    /// All jobs, highest priority first.
    pub fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        self.query_all("1 = 1")
    }

    /// Active jobs in dispatch order (priority descending).
    ///
    /// Rows that fail to decode are logged and skipped so that one bad record
    /// cannot stall the tick; the second element counts them.
    pub fn active_jobs(&self) -> Result<(Vec<JobRecord>, usize)> {
        let conn = db::lock(&self.conn)?;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM scheduler_jobs
             WHERE active = 1 ORDER BY priority DESC, name"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut jobs = Vec::new();
        let mut errors = 0;
        for row in stmt.query_map([], row_to_job)? {
            match row {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    errors += 1;
                    error!("skipping undecodable job row: {e}");
                }
            }
        }
        Ok((jobs, errors))
    }

    /// Every job whose last run failed, active or not.
    pub fn failed_jobs(&self) -> Result<Vec<JobRecord>> {
        self.query_all("status = 'error'")
    }

    /// Put every failed job back into rotation.
    ///
    /// `status` and `error_message` stay as a record of the failure until the
    /// next run overwrites them. Returns how many jobs were re-activated;
    /// jobs that are already active are left alone.
    #[instrument(skip(self))]
    pub fn restart_failed_jobs(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = db::lock(&self.conn)?;
        let n = conn.execute(
            "UPDATE scheduler_jobs SET active = 1, updated_at = ?1
             WHERE status = 'error' AND active = 0",
            [to_db_time(now)],
        )?;
        if n > 0 {
            info!(count = n, "failed jobs restarted");
        }
        Ok(n)
    }

    /// Persist the outcome fields written by the dispatcher.
    pub fn save_outcome(&self, job: &JobRecord) -> Result<()> {
        let conn = db::lock(&self.conn)?;
        let n = conn.execute(
            "UPDATE scheduler_jobs
             SET active = ?1, last_run = ?2, status = ?3, error_message = ?4, updated_at = ?5
             WHERE id = ?6",
            rusqlite::params![
                job.active,
                job.last_run.map(to_db_time),
                job.status.to_string(),
                job.error_message,
                to_db_time(job.updated_at),
                job.id
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: job.id.clone() });
        }
        Ok(())
    }

    fn query_all(&self, filter: &str) -> Result<Vec<JobRecord>> {
        let conn = db::lock(&self.conn)?;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM scheduler_jobs
             WHERE {filter} ORDER BY priority DESC, name"
        );
        let mut stmt = conn.prepare(&sql)?;
        let jobs = stmt
            .query_map([], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }
}

fn encode_timeplan(plan: Option<&Timeplan>) -> Result<Option<String>> {
    Ok(plan.map(serde_json::to_string).transpose()?)
}

fn period_to_db(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

/// Map a row (column order from `JOB_COLUMNS`) to a `JobRecord`.
fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRecord> {
    let timeplan = row
        .get::<_, Option<String>>(6)?
        .map(|s| serde_json::from_str::<Timeplan>(&s))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
    let status = row
        .get::<_, String>(8)?
        .parse::<JobStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, e.into()))?;

    Ok(JobRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        method: row.get(2)?,
        period_secs: row.get::<_, i64>(3)?.max(0) as u64,
        priority: row.get(4)?,
        active: row.get(5)?,
        timeplan,
        last_run: opt_from_db_time(7, row.get(7)?)?,
        status,
        error_message: row.get(9)?,
        created_at: from_db_time(10, &row.get::<_, String>(10)?)?,
        updated_at: from_db_time(11, &row.get::<_, String>(11)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeplan::ALL_DAYS;

    fn def(name: &str) -> JobDefinition {
        JobDefinition {
            name: name.into(),
            method: format!("{name}.run"),
            period_secs: 600,
            priority: 0,
            active: true,
            timeplan: None,
        }
    }

    fn registry() -> JobRegistry {
        JobRegistry::new(db::memory())
    }

    #[test]
    fn add_and_get_roundtrip_with_timeplan() {
        let jobs = registry();
        let plan = Timeplan::new(10)
            .unwrap()
            .with_days(&ALL_DAYS)
            .with_hours(&[23])
            .unwrap()
            .with_minutes(&[0])
            .unwrap();
        let mut d = def("nightly");
        d.timeplan = Some(plan);

        let added = jobs.add_job(d, Utc::now()).unwrap();
        let loaded = jobs.get(&added.id).unwrap().expect("job present");
        assert_eq!(loaded.timeplan, Some(plan));
        assert_eq!(loaded.status, JobStatus::Waiting);
        assert!(jobs.get("nope").unwrap().is_none());
    }

    #[test]
    fn active_jobs_are_ordered_by_priority() {
        let jobs = registry();
        for (name, prio, active) in [("low", 1, true), ("high", 9, true), ("off", 5, false)] {
            let mut d = def(name);
            d.priority = prio;
            d.active = active;
            jobs.add_job(d, Utc::now()).unwrap();
        }
        let (active, errors) = jobs.active_jobs().unwrap();
        assert_eq!(errors, 0);
        let names: Vec<_> = active.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["high", "low"]);
    }

    #[test]
    fn undecodable_rows_are_skipped_not_fatal() {
        let jobs = registry();
        jobs.add_job(def("good"), Utc::now()).unwrap();
        let bad = jobs.add_job(def("bad"), Utc::now()).unwrap();
        db::lock(&jobs.conn)
            .unwrap()
            .execute(
                "UPDATE scheduler_jobs SET timeplan = '{\"hours\":{\"99\":true}}' WHERE id = ?1",
                [&bad.id],
            )
            .unwrap();

        let (active, errors) = jobs.active_jobs().unwrap();
        assert_eq!(errors, 1);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "good");
    }

    #[test]
    fn failed_jobs_and_restart() {
        let jobs = registry();
        let mut failed = jobs.add_job(def("failing"), Utc::now()).unwrap();
        let healthy = jobs.add_job(def("healthy"), Utc::now()).unwrap();

        failed.mark_failed(Utc::now(), "boom");
        jobs.save_outcome(&failed).unwrap();

        let listed = jobs.failed_jobs().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, failed.id);
        assert!(!listed[0].active);

        assert_eq!(jobs.restart_failed_jobs(Utc::now()).unwrap(), 1);
        let restarted = jobs.get(&failed.id).unwrap().unwrap();
        assert!(restarted.active);
        assert_eq!(restarted.status, JobStatus::Error);
        assert_eq!(restarted.error_message.as_deref(), Some("boom"));

        // idempotent
        assert_eq!(jobs.restart_failed_jobs(Utc::now()).unwrap(), 0);
        assert!(jobs.get(&healthy.id).unwrap().unwrap().active);
    }

    #[test]
    fn upsert_keeps_runtime_state_and_failed_jobs_inactive() {
        let jobs = registry();
        let mut job = jobs.upsert_definition(def("seeded"), Utc::now()).unwrap();
        job.mark_failed(Utc::now(), "boom");
        jobs.save_outcome(&job).unwrap();

        let mut changed = def("seeded");
        changed.priority = 7;
        let again = jobs.upsert_definition(changed, Utc::now()).unwrap();

        assert_eq!(again.id, job.id);
        assert_eq!(again.priority, 7);
        assert!(!again.active);
        assert_eq!(again.status, JobStatus::Error);
        assert_eq!(jobs.list_jobs().unwrap().len(), 1);
    }

    #[test]
    fn save_outcome_for_missing_job_errors() {
        let jobs = registry();
        let ghost = JobRecord::from_definition(def("ghost"), Utc::now());
        assert!(matches!(
            jobs.save_outcome(&ghost),
            Err(SchedulerError::JobNotFound { .. })
        ));
    }
}
