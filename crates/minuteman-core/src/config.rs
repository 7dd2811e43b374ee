use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 5; // minute-level plans need several ticks per minute
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_WORKER_POLL_MS: u64 = 500;
pub const DEFAULT_STALE_TASK_AFTER_SECS: u64 = 30 * 60;
pub const DEFAULT_INSTANCE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_JOB_PERIOD_SECS: u64 = 10 * 60;

/// Top-level config (minuteman.toml + MINUTEMAN_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MinutemanConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Declarative job definitions, upserted by name on startup.
    #[serde(default)]
    pub jobs: Vec<JobSeedConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Tick loop, worker pool and recovery tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between two ticks of the coordinating loop.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Number of worker tasks draining the queue.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// How long an idle worker waits before polling the queue again.
    #[serde(default = "default_worker_poll_ms")]
    pub worker_poll_ms: u64,
    /// Long-running tasks started longer ago than this, and still unfinished,
    /// are force-finished by the recovery pass.
    #[serde(default = "default_stale_task_after_secs")]
    pub stale_task_after_secs: u64,
    /// A scheduler process whose heartbeat is older than this is considered
    /// dead, and the queue claims of its workers become orphans. Never less
    /// than three tick intervals.
    #[serde(default = "default_instance_timeout_secs")]
    pub instance_timeout_secs: u64,
    /// Seed the built-in maintenance jobs (nightly `database.optimize`).
    #[serde(default = "bool_true")]
    pub seed_builtin_jobs: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            workers: DEFAULT_WORKERS,
            worker_poll_ms: DEFAULT_WORKER_POLL_MS,
            stale_task_after_secs: DEFAULT_STALE_TASK_AFTER_SECS,
            instance_timeout_secs: DEFAULT_INSTANCE_TIMEOUT_SECS,
            seed_builtin_jobs: true,
        }
    }
}

/// One `[[jobs]]` entry.
///
/// `timeplan` is kept as raw JSON here; the scheduler crate validates it when
/// the definition is upserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSeedConfig {
    pub name: String,
    pub method: String,
    #[serde(default = "default_job_period_secs")]
    pub period_secs: u64,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "bool_true")]
    pub active: bool,
    #[serde(default)]
    pub timeplan: Option<serde_json::Value>,
}

fn bool_true() -> bool {
    true
}
fn default_tick_interval_secs() -> u64 {
    DEFAULT_TICK_INTERVAL_SECS
}
fn default_workers() -> usize {
    DEFAULT_WORKERS
}
fn default_worker_poll_ms() -> u64 {
    DEFAULT_WORKER_POLL_MS
}
fn default_stale_task_after_secs() -> u64 {
    DEFAULT_STALE_TASK_AFTER_SECS
}
fn default_instance_timeout_secs() -> u64 {
    DEFAULT_INSTANCE_TIMEOUT_SECS
}
fn default_job_period_secs() -> u64 {
    DEFAULT_JOB_PERIOD_SECS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.minuteman/minuteman.db", home)
}

impl MinutemanConfig {
    /// Load config from a TOML file with MINUTEMAN_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `MINUTEMAN_SCHEDULER__TICK_INTERVAL_SECS=2`.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.minuteman/minuteman.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("MINUTEMAN_").split("__")),
        )
    }

    fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        figment
            .extract()
            .map_err(|e| crate::error::MinutemanError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.minuteman/minuteman.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = MinutemanConfig::from_figment(Figment::new().merge(Toml::string("")))
            .expect("empty config should extract");
        assert_eq!(config.scheduler.tick_interval_secs, DEFAULT_TICK_INTERVAL_SECS);
        assert_eq!(config.scheduler.workers, DEFAULT_WORKERS);
        assert_eq!(config.scheduler.stale_task_after_secs, 1800);
        assert_eq!(config.scheduler.instance_timeout_secs, DEFAULT_INSTANCE_TIMEOUT_SECS);
        assert!(config.scheduler.seed_builtin_jobs);
        assert!(config.jobs.is_empty());
    }

    #[test]
    fn job_entries_pick_up_defaults() {
        let toml = r#"
            [scheduler]
            tick_interval_secs = 2

            [[jobs]]
            name = "import.poll"
            method = "import.poll"

            [[jobs]]
            name = "nightly"
            method = "database.optimize"
            priority = 3
            active = false
            timeplan = { hours = { "23" = true }, minutes = { "0" = true } }
        "#;
        let config = MinutemanConfig::from_figment(Figment::new().merge(Toml::string(toml)))
            .expect("config should extract");

        assert_eq!(config.scheduler.tick_interval_secs, 2);
        assert_eq!(config.jobs.len(), 2);
        assert_eq!(config.jobs[0].period_secs, DEFAULT_JOB_PERIOD_SECS);
        assert!(config.jobs[0].active);
        assert!(config.jobs[0].timeplan.is_none());
        assert_eq!(config.jobs[1].priority, 3);
        assert!(!config.jobs[1].active);
        assert_eq!(config.jobs[1].timeplan.as_ref().unwrap()["hours"]["23"], true);
    }
}
