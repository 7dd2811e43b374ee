//! Shared configuration and error types for the minuteman workspace.

pub mod config;
pub mod error;

pub use config::{DatabaseConfig, JobSeedConfig, MinutemanConfig, SchedulerConfig};
pub use error::{MinutemanError, Result};
