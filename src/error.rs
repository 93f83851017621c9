//! Error types for mysql-migrate.

use crate::classify::ErrorClass;
use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mysql-migrate operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
        /// Source error if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Could not establish a connection
    #[error("Connection error after {attempts} attempt(s): {message}")]
    Connection {
        /// Error message
        message: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// Raw database failure, already classified
    #[error("Database error ({class}{}): {message}", code_suffix(.code))]
    Database {
        /// Abstract class
        class: ErrorClass,
        /// Vendor error code, if the server reported one
        code: Option<u16>,
        /// Error message
        message: String,
    },

    /// DDL could not be read for an object
    #[error("Extraction failed for '{object}': {message}")]
    Extraction {
        /// Object name
        object: String,
        /// Error message
        message: String,
    },

    /// DDL could not be applied
    #[error("Apply failed for '{object}': {message}")]
    Apply {
        /// Object name
        object: String,
        /// Failure class reported by the destination
        class: ErrorClass,
        /// Error message
        message: String,
    },

    /// A batch write failed
    #[error("Batch {batch} of table '{table}' failed: {message}")]
    Batch {
        /// Table name
        table: String,
        /// Batch ordinal (1-based)
        batch: usize,
        /// Error message
        message: String,
    },

    /// The source cursor broke mid-stream
    #[error("Cursor lost on table '{table}': {message}")]
    CursorLost {
        /// Table name
        table: String,
        /// Error message
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Stopped by cancellation or the run timeout
    #[error("Cancelled {stage}")]
    Cancelled {
        /// Where the work stopped, e.g. "before schema apply"
        stage: &'static str,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with source.
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>, attempts: u32) -> Self {
        Self::Connection {
            message: message.into(),
            attempts,
        }
    }

    /// Create a classified database error.
    pub fn database(class: ErrorClass, code: Option<u16>, message: impl Into<String>) -> Self {
        Self::Database {
            class,
            code,
            message: message.into(),
        }
    }

    /// Create an extraction error.
    pub fn extraction(object: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Extraction {
            object: object.into(),
            message: message.into(),
        }
    }

    /// Create a cursor-lost error.
    pub fn cursor_lost(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CursorLost {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(stage: &'static str) -> Self {
        Self::Cancelled { stage }
    }

    /// Create a serialization error.
    pub fn serialization(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Abstract class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Database { class, .. } | Error::Apply { class, .. } => *class,
            Error::Connection { .. } | Error::CursorLost { .. } | Error::Io(_) => {
                ErrorClass::ConnectionLost
            }
            _ => ErrorClass::Other,
        }
    }

    /// Whether the connection this error came from must be abandoned.
    pub fn is_connection_fatal(&self) -> bool {
        self.class().is_connection_fatal()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::ConnectionLost | ErrorClass::Transient
        )
    }

    /// Get the error code for metrics/logging.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "CONFIG_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Connection { .. } => "CONNECTION_ERROR",
            Error::Database { .. } => "DATABASE_ERROR",
            Error::Extraction { .. } => "EXTRACTION_ERROR",
            Error::Apply { .. } => "APPLY_ERROR",
            Error::Batch { .. } => "BATCH_ERROR",
            Error::CursorLost { .. } => "CURSOR_LOST",
            Error::Serialization { .. } => "SERIALIZATION_ERROR",
            Error::Cancelled { .. } => "CANCELLED",
            Error::Io(_) => "IO_ERROR",
        }
    }
}

fn code_suffix(code: &Option<u16>) -> String {
    code.map(|c| format!(", code {}", c)).unwrap_or_default()
}

/// Error context extension trait.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation).
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ErrorContext<T>
    for std::result::Result<T, E>
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::config_with_source(message, e))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::config_with_source(f(), e))
    }
}
