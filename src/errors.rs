//! Error types for the CDC follower
//! Provides structured error handling using thiserror, plus the exit-code
//! categories the follow supervisor uses to interpret worker failures.

use thiserror::Error;

/// Main error type for the CDC follower
#[derive(Error, Debug)]
pub enum CdcError {
    /// Configuration related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Errors talking to the source database (replication or SQL)
    #[error("Source database error: {message}")]
    Source { message: String },

    /// Errors talking to the target database
    #[error("Target database error: {message}")]
    Target { message: String },

    /// Message or file parsing errors
    #[error("Parse error: {message}")]
    Parse {
        message: String,
        context: Option<String>,
    },

    /// Replication protocol errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Network/IO related errors
    #[error("IO error")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding errors
    #[error("JSON error")]
    Json(#[from] serde_json::Error),

    /// C string conversion errors
    #[error("C string conversion error")]
    CString(#[from] std::ffi::NulError),

    /// Task execution errors for async operations
    #[error("Task execution error")]
    Task(#[from] tokio::task::JoinError),

    /// User-initiated stop observed while an operation was still in flight
    #[error("Stopped by user")]
    Stopped,

    /// Generic error for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for convenience
pub type CdcResult<T> = std::result::Result<T, CdcError>;

/// Process exit-code categories, one per error family.
///
/// Workers log once at the error site and exit with one of these; the
/// supervisor maps the code back to a decision (restart in the alternate
/// mode, or give up).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    BadArgs,
    Source,
    Target,
    Internal,
    Quit,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::BadArgs => 1,
            ExitCode::Source => 2,
            ExitCode::Target => 3,
            ExitCode::Internal => 4,
            ExitCode::Quit => 5,
        }
    }
}

impl CdcError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a source-side database error
    pub fn source<S: Into<String>>(message: S) -> Self {
        Self::Source {
            message: message.into(),
        }
    }

    /// Create a target-side database error
    pub fn target<S: Into<String>>(message: S) -> Self {
        Self::Target {
            message: message.into(),
        }
    }

    /// Create a parse error
    pub fn parse<S: Into<String>>(message: S) -> Self {
        Self::Parse {
            message: message.into(),
            context: None,
        }
    }

    /// Create a parse error with the offending input attached
    pub fn parse_with_context<S: Into<String>, C: Into<String>>(message: S, context: C) -> Self {
        Self::Parse {
            message: message.into(),
            context: Some(context.into()),
        }
    }

    /// Create a replication protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Map this error to the exit-code category a worker reports
    pub fn exit_code(&self) -> ExitCode {
        match self {
            CdcError::Config { .. } => ExitCode::BadArgs,
            CdcError::Source { .. } => ExitCode::Source,
            CdcError::Target { .. } => ExitCode::Target,
            CdcError::Stopped => ExitCode::Quit,
            _ => ExitCode::Internal,
        }
    }
}
