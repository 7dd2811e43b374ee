use thiserror::Error;

#[derive(Debug, Error)]
pub enum MinutemanError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MinutemanError {
    /// Short, stable error code for CLI output and log correlation.
    pub fn code(&self) -> &'static str {
        match self {
            MinutemanError::Config(_) => "CONFIG_ERROR",
            MinutemanError::Database(_) => "DATABASE_ERROR",
            MinutemanError::Serialization(_) => "SERIALIZATION_ERROR",
            MinutemanError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, MinutemanError>;
