//! Error types for the CLI.

use kiln_core::KilnError;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("no record stored for key {0}")]
    UnknownKey(String),
    #[error("failed to initialise logging: {0}")]
    Telemetry(String),
    #[error("failed to render output: {0}")]
    Render(String),
    #[error(transparent)]
    Kiln(#[from] KilnError),
}

impl CliError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            _ => 1,
        }
    }
}

pub type CliResult<T> = Result<T, CliError>;
