/// Error types for the Formic workflow engine.
use thiserror::Error;

/// Core error type for task store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Task not found: {0}")]
    TaskNotFound(i64),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for task store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Core error type for subtask ledger operations.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("No subtask ledger exists for docs path: {0}")]
    LedgerNotFound(String),

    #[error("Subtask not found: {0}")]
    SubtaskNotFound(String),

    #[error("Malformed ledger document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Core error type for agent invocation.
#[derive(Error, Debug)]
pub enum InvokerError {
    /// The agent binary is missing or not executable. This is a configuration
    /// problem the user must fix, not a transient failure.
    #[error("Agent command '{command}' not found. Install it or set agent_command in the config.")]
    BinaryMissing { command: String },

    #[error("Agent spawn failed: {0}")]
    SpawnFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for invoker operations.
pub type InvokerResult<T> = Result<T, InvokerError>;

/// Error type for the workflow sequencer and queue scheduler.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A workflow run is already attached to this task. Raised synchronously
    /// to the caller; never recorded as a task failure.
    #[error("A workflow step is already running for task {task_id}")]
    ConcurrentStepConflict { task_id: i64 },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("Ledger error: {0}")]
    LedgerError(#[from] LedgerError),

    #[error("Invoker error: {0}")]
    InvokerError(#[from] InvokerError),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
