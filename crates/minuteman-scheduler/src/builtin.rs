//! Maintenance backends that ship with the scheduler.

use async_trait::async_trait;
use tracing::info;

use crate::backend::{Backend, BackendRegistry};
use crate::db::{self, SharedConnection};
use crate::error::Result;
use crate::timeplan::{Timeplan, ALL_DAYS};
use crate::types::{JobDefinition, QueueItem};

pub const OPTIMIZE_DATABASE: &str = "database.optimize";

/// Runs `PRAGMA optimize` on the scheduler database.
pub struct OptimizeDatabase {
    conn: SharedConnection,
}

impl OptimizeDatabase {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Backend for OptimizeDatabase {
    async fn start(&self) -> anyhow::Result<()> {
        let conn = db::lock(&self.conn)?;
        conn.execute_batch("PRAGMA optimize;")?;
        info!("database optimized");
        Ok(())
    }

    /// Idempotent, so an interrupted run is simply retried.
    fn reschedule(&self, _item: &QueueItem) -> bool {
        true
    }
}

/// Register every built-in backend under its method name.
pub fn register_builtins(backends: &mut BackendRegistry, conn: &SharedConnection) {
    backends.register(OPTIMIZE_DATABASE, OptimizeDatabase::new(conn.clone()));
}

/// Definitions of the built-in jobs: a nightly optimize in the 23:00 bucket (UTC).
pub fn builtin_definitions() -> Result<Vec<JobDefinition>> {
    let nightly = Timeplan::new(10)?
        .with_days(&ALL_DAYS)
        .with_hours(&[23])?
        .with_minutes(&[0])?;

    Ok(vec![JobDefinition {
        name: "Optimize scheduler database".to_string(),
        method: OPTIMIZE_DATABASE.to_string(),
        period_secs: 24 * 60 * 60,
        priority: 0,
        active: true,
        timeplan: Some(nightly),
    }])
}
