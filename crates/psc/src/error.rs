//! Error types for the chunk engine.

use thiserror::Error;

/// Main error type for copy and statement operations.
#[derive(Error, Debug)]
pub enum PscError {
    /// Configuration error (malformed service file, unknown service name,
    /// missing target table, missing directive, invalid operand).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Could not open or ping a database, after the SSL fallback.
    #[error("Connection error for service '{service}': {message}")]
    Connect { service: String, message: String },

    /// Connection pool error with context about where it occurred.
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A single chunk failed (query error, broken COPY stream, timeout).
    #[error("Chunk [{start}, {end}] failed: {message}")]
    Chunk {
        start: i64,
        end: i64,
        message: String,
    },

    /// Statement mode could not determine the table for the MAX probe.
    #[error("Cannot extract table name from statement: {0}")]
    Extraction(String),

    /// State file error (unreadable, unparsable, rename failed).
    #[error("State file error: {0}")]
    State(String),

    /// Database driver error.
    #[error("Database error: {0}")]
    Db(#[from] tokio_postgres::Error),

    /// IO error (file operations).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The operation's cancellation token fired.
    #[error("Operation cancelled")]
    Cancelled,
}

impl PscError {
    /// Create a Pool error with context about where it occurred.
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        PscError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Chunk error for the given claimed range.
    pub fn chunk(start: i64, end: i64, message: impl ToString) -> Self {
        PscError::Chunk {
            start,
            end,
            message: message.to_string(),
        }
    }

    /// Process exit code for the CLI: 1 for operand/validation errors,
    /// 2 for runtime failures.
    pub fn exit_code(&self) -> u8 {
        match self {
            PscError::Config(_) | PscError::Extraction(_) => 1,
            _ => 2,
        }
    }

    /// Format error with full details including the error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}", self);

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

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, PscError>;
