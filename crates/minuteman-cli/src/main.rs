use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use minuteman_core::{MinutemanConfig, MinutemanError};
use minuteman_scheduler::{db, BackendRegistry, JobRecord, SchedulerEngine, SystemClock};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "minuteman")]
#[command(about = "Periodic job scheduler backed by SQLite")]
#[command(
    long_about = "Periodic job scheduler backed by SQLite.\n\nThis binary only binds the built-in backends (database.optimize). \
Configured jobs with any other method are stored but fail with an unknown-method error \
when run; embed minuteman-scheduler and register their backends to run them."
)]
#[command(version)]
struct Cli {
    /// Config file (defaults to MINUTEMAN_CONFIG, then ~/.minuteman/minuteman.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tick loop and the worker pool until Ctrl-C
    Run,
    /// List all jobs
    Jobs,
    /// List jobs whose last run failed
    Failed,
    /// Re-activate every failed job
    RestartFailed,
    /// Run one cleanup pass outside the tick loop
    Cleanup {
        /// Allow the pass outside the tick loop
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "minuteman=info,minuteman_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // explicit flag > MINUTEMAN_CONFIG env > ~/.minuteman/minuteman.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("MINUTEMAN_CONFIG").ok());
    let config = MinutemanConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        MinutemanConfig::default()
    });

    let engine = match open_engine(&config) {
        Ok(engine) => engine,
        Err(e) => {
            error!(code = e.code(), error = %e, "failed to open the scheduler");
            return Err(e.into());
        }
    };

    match cli.command {
        Commands::Run => run(engine, &config).await?,
        Commands::Jobs => print_jobs(&engine.jobs().list_jobs()?),
        Commands::Failed => print_jobs(&engine.failed_jobs()?),
        Commands::RestartFailed => {
            let n = engine.restart_failed_jobs()?;
            println!("restarted {n} job(s)");
        }
        Commands::Cleanup { force } => {
            let report = engine.cleanup(force)?;
            let json = serde_json::to_string_pretty(&report).map_err(MinutemanError::from)?;
            println!("{json}");
        }
    }
    Ok(())
}

fn open_engine(config: &MinutemanConfig) -> minuteman_core::Result<SchedulerEngine> {
    let db_path = &config.database.path;
    ensure_parent_dir(db_path)?;
    info!(path = %db_path, "opening SQLite database");

    let conn = rusqlite::Connection::open(db_path).map_err(database)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
        .map_err(database)?;

    SchedulerEngine::new(
        db::share(conn),
        BackendRegistry::new(),
        Arc::new(SystemClock),
        config.scheduler.clone(),
    )
    .map_err(database)
}

fn database(e: impl std::fmt::Display) -> MinutemanError {
    MinutemanError::Database(e.to_string())
}

async fn run(engine: SchedulerEngine, config: &MinutemanConfig) -> Result<()> {
    engine.seed_jobs(&config.jobs)?;
    let unbound = engine.unbound_methods()?;
    if !unbound.is_empty() {
        warn!(methods = ?unbound, "jobs with these methods will fail: this binary has no backend for them");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let workers = engine.spawn_workers(shutdown_rx.clone());
    info!(workers = workers.len(), "worker pool started");

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl-C: {e}");
            return;
        }
        info!("Ctrl-C received, shutting down");
        let _ = shutdown_tx.send(true);
    });

    engine.run(shutdown_rx).await;

    // workers finish the item in hand before exiting
    for handle in workers {
        if let Err(e) = handle.await {
            warn!("worker task ended abnormally: {e}");
        }
    }
    info!("minuteman stopped");
    Ok(())
}

fn print_jobs(jobs: &[JobRecord]) {
    if jobs.is_empty() {
        println!("no jobs");
        return;
    }
    for job in jobs {
        let last_run = job
            .last_run
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{}  {:<32} {:<24} {:<8} active={:<5} last_run={}",
            job.id,
            job.name,
            job.method,
            job.status.to_string(),
            job.active,
            last_run
        );
        if let Some(message) = &job.error_message {
            println!("    error: {message}");
        }
    }
}

fn ensure_parent_dir(path: &str) -> std::io::Result<()> {
    match std::path::Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwritable_database_path_reports_io_error() {
        let dir = std::env::temp_dir().join(format!("minuteman-cli-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let blocker = dir.join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let mut config = MinutemanConfig::default();
        config.database.path = blocker.join("minuteman.db").to_string_lossy().into_owned();
        let err = open_engine(&config).err().unwrap();
        assert_eq!(err.code(), "IO_ERROR");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn cli_parses_forced_cleanup() {
        let cli = Cli::try_parse_from(["minuteman", "cleanup", "--force"]).unwrap();
        assert!(matches!(cli.command, Commands::Cleanup { force: true }));
    }
}
