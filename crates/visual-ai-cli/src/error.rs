//! Errors raised by the command-line front end.

use visual_ai::VisionError;

#[derive(thiserror::Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Vision(#[from] VisionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid image source {source_ref}: {reason}")]
    ImageSource { source_ref: String, reason: String },

    #[error("Worker pool error: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Machine-readable error class for JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            CliError::Vision(e) => e.kind(),
            CliError::Config(_) => "config_error",
            CliError::ImageSource { .. } | CliError::Json(_) => "invalid_input",
            CliError::Worker(_) | CliError::Io(_) => "internal_error",
        }
    }
}

pub type CliResult<T> = Result<T, CliError>;
