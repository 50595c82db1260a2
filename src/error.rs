//! Error types for attachment intake.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by a message source while polling.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    /// Credentials were rejected. Polling stays halted until an operator fixes them.
    #[error("Authentication failed for source {source_name}: {reason}")]
    Auth { source_name: String, reason: String },

    /// Network or upstream hiccup. Retried on the next scheduled tick.
    #[error("Transient failure on source {source_name}: {reason}")]
    Transient { source_name: String, reason: String },
}

impl SourceError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

/// Reasons a single attachment is dropped by the filter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{filename}: extension {extension:?} is not in the allow-set")]
    ExtensionNotAllowed { filename: String, extension: String },

    #[error("{filename}: {size} bytes exceeds the {max} byte limit")]
    TooLarge { filename: String, size: u64, max: u64 },

    #[error("attachment has an empty filename")]
    EmptyFilename,

    #[error("{filename}: attachment content is empty")]
    EmptyContent { filename: String },
}

/// Queue-level failures. `Full` and `Unavailable` are the producer's rejection reasons.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("Queue {queue} is full ({length}/{capacity})")]
    Full {
        queue: String,
        length: usize,
        capacity: usize,
    },

    #[error("Queue {queue} unavailable: {reason}")]
    Unavailable { queue: String, reason: String },

    #[error("Task record could not be encoded: {0}")]
    Encode(String),

    #[error("Task record could not be decoded: {0}")]
    Decode(String),
}

impl QueueError {
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full { .. })
    }
}

/// Errors from the processing collaborator and the dispatch around it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("Processing timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Processing failed: {0}")]
    Failed(String),

    #[error("No processor registered for MIME type {mime_type}")]
    NoProcessor { mime_type: String },
}

/// Worker pool errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker pool is already running")]
    AlreadyRunning,

    #[error("Worker pool is not running")]
    NotRunning,

    #[error("Worker {worker_id} not found")]
    NotFound { worker_id: String },

    #[error("Worker {worker_id} exited unexpectedly: {reason}")]
    Crashed { worker_id: String, reason: String },

    #[error("Maximum restart attempts ({max}) exhausted for worker {worker_id}")]
    RestartsExhausted { worker_id: String, max: u32 },
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
