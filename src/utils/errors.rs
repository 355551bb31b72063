//! Custom error types for the backup agent.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A job order is missing or carries a malformed parameter. Detected
    /// before any process is spawned.
    #[error("Invalid job order: {0}")]
    Validation(String),

    /// The host is not in a state where the job can run (lock held,
    /// non-empty restore target, missing privileges). Detected before any
    /// process is spawned.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// A pipeline stage exited nonzero. Carries the stage identity and its
    /// captured diagnostic output.
    #[error("Stage '{stage}' exited with code {code}")]
    Stage {
        stage: &'static str,
        code: i32,
        stderr: String,
    },

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job failed: {0}")]
    Job(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
