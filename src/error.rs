//! Error types for db-parley.
//!
//! `ParleyError` is the crate-wide error. External database failures are
//! narrowed to `ExecutionError` before they leave the `db` layer, and every
//! error maps onto an `ErrorKind` so it can be carried by a stream event.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure classes of a single statement against the external database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// The database could not be reached or the connection broke.
    ConnectionFailure,
    /// The statement is malformed or references unknown objects.
    SyntaxError,
    /// The database (or the write gate) refused the statement.
    PermissionDenied,
    /// The statement exceeded the execution timeout.
    Timeout,
    /// Anything the driver reported that fits none of the above.
    Unknown,
}

impl ExecutionErrorKind {
    /// Returns the kind as a string for display and persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionFailure => "connection_failure",
            Self::SyntaxError => "syntax_error",
            Self::PermissionDenied => "permission_denied",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A statement failed against the external database.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
        }
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::ConnectionFailure, msg)
    }

    pub fn syntax(msg: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::SyntaxError, msg)
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::PermissionDenied, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::Timeout, msg)
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::Unknown, msg)
    }

    /// Copy safe to show when row values must stay hidden.
    ///
    /// Keeps the first line of the message only (driver DETAIL and HINT
    /// lines quote key values) and blanks every quoted literal in it.
    pub fn redacted(&self) -> Self {
        let first_line = self.message.lines().next().unwrap_or_default();
        Self::new(self.kind, blank_quoted(first_line))
    }
}

/// Replaces the contents of every '...' or "..." span with `***`.
fn blank_quoted(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut open: Option<char> = None;

    for c in text.chars() {
        match open {
            Some(quote) if c == quote => {
                out.push_str("***");
                out.push(c);
                open = None;
            }
            Some(_) => {}
            None if c == '\'' || c == '"' => {
                out.push(c);
                open = Some(c);
            }
            None => out.push(c),
        }
    }

    // Unterminated quote: hide the rest.
    if open.is_some() {
        out.push_str("***");
    }
    out
}

/// Failures of the generate→execute→observe loop itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    /// The model kept proposing work past the configured ceiling.
    #[error("Step limit of {max_steps} exceeded")]
    StepLimitExceeded { max_steps: usize },

    /// The language model could not produce a next action.
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),
}

/// Error kinds carried by terminal `Error` stream events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    ConnectionFailure,
    SyntaxError,
    PermissionDenied,
    Timeout,
    Unknown,
    StepLimitExceeded,
    ModelUnavailable,
    ConsumerDisconnected,
    Storage,
    Internal,
}

impl From<ExecutionErrorKind> for ErrorKind {
    fn from(kind: ExecutionErrorKind) -> Self {
        match kind {
            ExecutionErrorKind::ConnectionFailure => Self::ConnectionFailure,
            ExecutionErrorKind::SyntaxError => Self::SyntaxError,
            ExecutionErrorKind::PermissionDenied => Self::PermissionDenied,
            ExecutionErrorKind::Timeout => Self::Timeout,
            ExecutionErrorKind::Unknown => Self::Unknown,
        }
    }
}

/// Main error type for db-parley operations.
#[derive(Error, Debug)]
pub enum ParleyError {
    /// A conversation or connection does not exist (or was deleted).
    #[error("Not found: {0}")]
    NotFound(String),

    /// A statement failed against the external database.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// The query flow aborted.
    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    /// The stream consumer went away before the invocation finished.
    #[error("Consumer disconnected")]
    ConsumerDisconnected,

    /// LLM API errors (rate limits, auth, timeouts, etc.)
    #[error("LLM error: {0}")]
    Llm(String),

    /// Configuration errors (invalid config file, missing required fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Application state storage errors.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Internal application errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ParleyError {
    /// Creates a not-found error with the given message.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Creates an LLM error with the given message.
    pub fn llm(msg: impl Into<String>) -> Self {
        Self::Llm(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a persistence error with the given message.
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the kind reported to stream consumers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Execution(e) => e.kind.into(),
            Self::Flow(FlowError::StepLimitExceeded { .. }) => ErrorKind::StepLimitExceeded,
            Self::Flow(FlowError::ModelUnavailable(_)) | Self::Llm(_) => {
                ErrorKind::ModelUnavailable
            }
            Self::ConsumerDisconnected => ErrorKind::ConsumerDisconnected,
            Self::Persistence(_) => ErrorKind::Storage,
            Self::Config(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "Lookup Error",
            Self::Execution(_) => "Execution Error",
            Self::Flow(_) => "Flow Error",
            Self::ConsumerDisconnected => "Transport Error",
            Self::Llm(_) => "LLM Error",
            Self::Config(_) => "Configuration Error",
            Self::Persistence(_) => "Persistence Error",
            Self::Internal(_) => "Internal Error",
        }
    }
}

/// Result type alias using ParleyError.
pub type Result<T> = std::result::Result<T, ParleyError>;
