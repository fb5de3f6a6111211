//! Error types for the supervisor.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Spawning a worker process failed.
    #[error("Failed to spawn worker for slot {slot}: {source}")]
    SpawnFailed {
        slot: u32,
        #[source]
        source: std::io::Error,
    },

    /// A slot crashed too often inside its error window; the supervisor
    /// shut everything down.
    #[error("Worker slot {slot} exceeded {max_errors} crashes within {period_secs}s")]
    CircuitBreaker {
        slot: u32,
        max_errors: u32,
        period_secs: u64,
    },

    /// Dropping privileges in the worker failed.
    #[error("Privilege drop failed: {0}")]
    PrivilegeDrop(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
