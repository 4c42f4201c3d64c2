use thiserror::Error;

use crate::trial::TrialId;

/// Main error type for benchrun
#[derive(Error, Debug)]
pub enum BrError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Trial store errors. All of them are fatal to the worker loop.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid store URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("Database connection failed: {message}")]
    DatabaseConnection { message: String },

    #[error("Query execution failed: {query}, error: {error}")]
    QueryFailed { query: String, error: String },

    #[error("Corrupt trial record {trial_id}: {message}")]
    Corruption { trial_id: TrialId, message: String },
}

/// Payload codec errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Unrecognized payload mimetype: {mimetype}")]
    UnknownMimetype { mimetype: String },

    #[error("Expected mimetype {expected}, got {actual}")]
    WrongKind { expected: String, actual: String },

    #[error("Corrupt {mimetype} payload: {message}")]
    Corrupt { mimetype: String, message: String },

    #[error("Run function not registered: {name}")]
    UnknownFunction { name: String },
}

/// Worker-fatal conditions raised by the trial runner loop.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("No trial found for id {trial_id}")]
    TrialNotFound { trial_id: TrialId },

    #[error("No trial run function found for trial {trial_id}")]
    MissingRunFunction { trial_id: TrialId },

    #[error("Trial {trial_id} failed: {detail}")]
    TrialFailed { trial_id: TrialId, detail: String },
}

/// Result type alias for benchrun operations
pub type BrResult<T> = Result<T, BrError>;

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::BrError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::BrError::Config(format!($($arg)*))
    };
}
