//! Error types for the migration library.

use thiserror::Error;

use crate::retry::{classify_error, RetryDisposition};

/// Process exit code for configuration problems.
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Process exit code for a run that finished with failed, blocked or mismatched tables.
pub const EXIT_INCOMPLETE: u8 = 2;
/// Process exit code for database connectivity problems.
pub const EXIT_CONNECTION_ERROR: u8 = 3;
/// Process exit code for data transfer problems.
pub const EXIT_TRANSFER_ERROR: u8 = 4;
/// Process exit code for file system problems.
pub const EXIT_IO_ERROR: u8 = 7;
/// Process exit code after SIGINT/SIGTERM.
pub const EXIT_CANCELLED: u8 = 130;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The table dependency graph contains a cycle.
    #[error("Cyclic table dependency: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    /// A table name that is not part of the recorder catalog.
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Source(#[from] sqlx::Error),

    /// Target database connection or query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Data transfer failed for a specific table
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// Source and target disagree in a way that makes continuing unsafe.
    #[error("Consistency check failed for table {table}: {message}")]
    Consistency { table: String, message: String },

    /// The run finished but not every table completed or validated.
    #[error("Migration incomplete: {0}")]
    Incomplete(String),

    /// Progress file error
    #[error("Progress file error: {0}")]
    State(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl std::fmt::Display, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Consistency error
    pub fn consistency(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Consistency {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same operation may succeed (dropped connections,
    /// pool exhaustion, deadlocks).
    pub fn is_transient(&self) -> bool {
        classify_error(self) == RetryDisposition::Retry
    }

    /// Map the error category to a process exit code.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_)
            | MigrateError::CyclicDependency(_)
            | MigrateError::UnknownTable(_)
            | MigrateError::Yaml(_) => EXIT_CONFIG_ERROR,
            MigrateError::Incomplete(_) => EXIT_INCOMPLETE,
            MigrateError::Source(_) | MigrateError::Target(_) | MigrateError::Pool { .. } => {
                EXIT_CONNECTION_ERROR
            }
            MigrateError::Transfer { .. }
            | MigrateError::Consistency { .. }
            | MigrateError::State(_)
            | MigrateError::Json(_) => EXIT_TRANSFER_ERROR,
            MigrateError::Io(_) => EXIT_IO_ERROR,
            MigrateError::Cancelled => EXIT_CANCELLED,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
