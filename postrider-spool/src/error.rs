use thiserror::Error;

/// Errors that can occur when writing to or inspecting a mail queue.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// The named queue does not exist.
    #[error("No such queue: {0}")]
    NoSuchQueue(String),

    /// The backing store failed to persist the message.
    #[error("Failed to store message: {0}")]
    StoreFailed(String),

    /// I/O error from a file-backed store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
