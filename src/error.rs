//! Error types for the companion pipeline.

/// Top-level error type for the conversational pipeline.
#[derive(Debug, thiserror::Error)]
pub enum CompanionError {
    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bounded executor rejected or lost a task.
    #[error("executor error: {0}")]
    Executor(String),

    /// Worker lifecycle error (spawn failure, top-level loop failure).
    #[error("worker error: {0}")]
    Worker(String),

    /// An external collaborator (generator, synthesizer, renderer, ...) failed.
    #[error("collaborator error: {0}")]
    Collaborator(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, CompanionError>;
