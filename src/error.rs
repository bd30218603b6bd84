//! # Error Handling
//!
//! Error taxonomy for the capture-encode-transmit pipeline. Every failure the
//! pipeline can hit falls into one of two groups, and the group decides how
//! far it travels:
//!
//! - **Per-tick** (`Capture`, `Encode`, `SendDropped`): logged and counted at
//!   the tick that hit them; the scheduler keeps running.
//! - **Session-level** (`Auth`, `ConnectionLost`): move the session to
//!   `Failed` and are pushed to observers.
//!
//! `Validation` and `AlreadyRunning` are returned synchronously from
//! `Orchestrator::start` and never touch the network.
//!
//! ## Error Context
//!
//! Each variant carries an [`ErrorContext`] with a timestamp, severity and an
//! optional recovery suggestion, in the same builder style used across the
//! crate:
//!
//! ```rust
//! use region_watch::error::{WatchError, HasRecoverySuggestion, Retryable};
//!
//! let error = WatchError::connect("wss://example.invalid", "connection refused")
//!     .with_context("opening live session")
//!     .with_recovery_suggestion("check network egress to the endpoint host");
//!
//! assert!(error.is_retryable());
//! assert_eq!(error.recovery_suggestion(), Some("check network egress to the endpoint host"));
//! ```

use std::{error::Error as StdError, fmt, time::SystemTime};

/// Severity levels for errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Debug-level errors that don't affect operation
    Debug,
    /// Warnings: one tick lost, pipeline continues
    Warning,
    /// Errors that affect the current operation
    Error,
    /// Fatal to the session; requires an explicit restart
    Fatal,
}

/// Metadata about when and where an error occurred
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// When the error occurred
    pub timestamp: SystemTime,
    /// The operation being performed when the error occurred
    pub operation: Option<String>,
    /// Additional context about the error
    pub context: Option<String>,
    /// Suggested recovery action
    pub recovery_suggestion: Option<String>,
    /// Error severity level
    pub severity: ErrorSeverity,
    /// Additional metadata as key-value pairs
    pub metadata: Vec<(String, String)>,
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self {
            timestamp: SystemTime::now(),
            operation: None,
            context: None,
            recovery_suggestion: None,
            severity: ErrorSeverity::Error,
            metadata: Vec::new(),
        }
    }
}

impl ErrorContext {
    /// Create a new error context
    pub fn new() -> Self {
        Self::default()
    }

    fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }
}

/// Why a capture failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFailure {
    /// Region lies (partly) outside the display
    OffScreen,
    /// Display locked, disconnected or not reachable
    DisplayUnavailable,
    /// The OS refused screen access
    PermissionDenied,
    /// Backend-specific failure
    Backend,
}

impl fmt::Display for CaptureFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CaptureFailure::OffScreen => "region off-screen",
            CaptureFailure::DisplayUnavailable => "display unavailable",
            CaptureFailure::PermissionDenied => "permission denied",
            CaptureFailure::Backend => "backend failure",
        };
        f.write_str(s)
    }
}

/// Base error type for the watcher
#[derive(Debug)]
pub enum WatchError {
    /// Invalid configuration; never touches the network
    Validation {
        field: String,
        constraint: String,
        value: String,
        context: ErrorContext,
    },
    /// Region could not be captured this tick
    Capture {
        kind: CaptureFailure,
        reason: String,
        context: ErrorContext,
    },
    /// Frame could not be encoded this tick
    Encode {
        reason: String,
        context: ErrorContext,
    },
    /// Transport could not be established
    Connect {
        endpoint: String,
        reason: String,
        context: ErrorContext,
    },
    /// Remote rejected the credentials
    Auth {
        reason: String,
        context: ErrorContext,
    },
    /// Reconnect budget exhausted
    ConnectionLost {
        attempts: u32,
        last_error: String,
        context: ErrorContext,
    },
    /// A frame was not handed to the transport
    SendDropped {
        sequence: Option<u64>,
        reason: String,
        context: ErrorContext,
    },
    /// A session is already active
    AlreadyRunning {
        state: String,
        context: ErrorContext,
    },
    /// An operation exceeded its deadline
    Timeout {
        operation: String,
        duration_ms: u64,
        context: ErrorContext,
    },
    /// Remote sent something the protocol adapter cannot use
    Protocol {
        reason: String,
        context: ErrorContext,
    },
    /// The operation was abandoned because the session was stopped
    Cancelled {
        operation: String,
        context: ErrorContext,
    },
    /// I/O errors
    Io {
        operation: String,
        source: std::io::Error,
        context: ErrorContext,
    },
    /// External library errors
    External {
        library: String,
        source: Box<dyn StdError + Send + Sync>,
        context: ErrorContext,
    },
}

impl WatchError {
    /// Create a validation error
    pub fn validation(
        field: impl Into<String>,
        constraint: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::Validation {
            field: field.into(),
            constraint: constraint.into(),
            value: value.into(),
            context: ErrorContext::new(),
        }
    }

    /// Create a capture error
    pub fn capture(kind: CaptureFailure, reason: impl Into<String>) -> Self {
        Self::Capture {
            kind,
            reason: reason.into(),
            context: ErrorContext::new().with_severity(ErrorSeverity::Warning),
        }
    }

    /// Create an encode error
    pub fn encode(reason: impl Into<String>) -> Self {
        Self::Encode {
            reason: reason.into(),
            context: ErrorContext::new().with_severity(ErrorSeverity::Warning),
        }
    }

    /// Create a connect error
    pub fn connect(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Connect {
            endpoint: endpoint.into(),
            reason: reason.into(),
            context: ErrorContext::new(),
        }
    }

    /// Create an authentication error
    pub fn auth(reason: impl Into<String>) -> Self {
        Self::Auth {
            reason: reason.into(),
            context: ErrorContext::new().with_severity(ErrorSeverity::Fatal),
        }
    }

    /// Create a connection-lost error
    pub fn connection_lost(attempts: u32, last_error: impl Into<String>) -> Self {
        Self::ConnectionLost {
            attempts,
            last_error: last_error.into(),
            context: ErrorContext::new().with_severity(ErrorSeverity::Fatal),
        }
    }

    /// Create a send-dropped error
    pub fn send_dropped(sequence: Option<u64>, reason: impl Into<String>) -> Self {
        Self::SendDropped {
            sequence,
            reason: reason.into(),
            context: ErrorContext::new().with_severity(ErrorSeverity::Warning),
        }
    }

    /// Create an already-running error
    pub fn already_running(state: impl Into<String>) -> Self {
        Self::AlreadyRunning {
            state: state.into(),
            context: ErrorContext::new(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
            context: ErrorContext::new(),
        }
    }

    /// Create a protocol error
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
            context: ErrorContext::new(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            context: ErrorContext::new().with_severity(ErrorSeverity::Debug),
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
            context: ErrorContext::new(),
        }
    }

    /// Create an external library error
    pub fn external(
        library: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            library: library.into(),
            source: Box::new(source),
            context: ErrorContext::new(),
        }
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context_mut().context = Some(context.into());
        self
    }

    /// Add operation context
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.context_mut().operation = Some(operation.into());
        self
    }

    /// Add recovery suggestion
    pub fn with_recovery_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.context_mut().recovery_suggestion = Some(suggestion.into());
        self
    }

    /// Add metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context_mut().metadata.push((key.into(), value.into()));
        self
    }

    /// Get the error context
    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::Validation { context, .. }
            | Self::Capture { context, .. }
            | Self::Encode { context, .. }
            | Self::Connect { context, .. }
            | Self::Auth { context, .. }
            | Self::ConnectionLost { context, .. }
            | Self::SendDropped { context, .. }
            | Self::AlreadyRunning { context, .. }
            | Self::Timeout { context, .. }
            | Self::Protocol { context, .. }
            | Self::Cancelled { context, .. }
            | Self::Io { context, .. }
            | Self::External { context, .. } => context,
        }
    }

    fn context_mut(&mut self) -> &mut ErrorContext {
        match self {
            Self::Validation { context, .. }
            | Self::Capture { context, .. }
            | Self::Encode { context, .. }
            | Self::Connect { context, .. }
            | Self::Auth { context, .. }
            | Self::ConnectionLost { context, .. }
            | Self::SendDropped { context, .. }
            | Self::AlreadyRunning { context, .. }
            | Self::Timeout { context, .. }
            | Self::Protocol { context, .. }
            | Self::Cancelled { context, .. }
            | Self::Io { context, .. }
            | Self::External { context, .. } => context,
        }
    }

    /// Get the error category as a string
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Capture { .. } => "capture",
            Self::Encode { .. } => "encode",
            Self::Connect { .. } => "connect",
            Self::Auth { .. } => "auth",
            Self::ConnectionLost { .. } => "connection_lost",
            Self::SendDropped { .. } => "send_dropped",
            Self::AlreadyRunning { .. } => "already_running",
            Self::Timeout { .. } => "timeout",
            Self::Protocol { .. } => "protocol",
            Self::Cancelled { .. } => "cancelled",
            Self::Io { .. } => "io",
            Self::External { .. } => "external",
        }
    }
}

impl fmt::Display for WatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchError::Validation {
                field,
                constraint,
                value,
                ..
            } => write!(
                f,
                "Validation failed for '{}': {} (value: {})",
                field, constraint, value
            ),
            WatchError::Capture { kind, reason, .. } => {
                write!(f, "Capture failed ({}): {}", kind, reason)
            }
            WatchError::Encode { reason, .. } => write!(f, "Encoding failed: {}", reason),
            WatchError::Connect {
                endpoint, reason, ..
            } => write!(f, "Could not connect to {}: {}", endpoint, reason),
            WatchError::Auth { reason, .. } => {
                write!(f, "Credentials rejected by remote service: {}", reason)
            }
            WatchError::ConnectionLost {
                attempts,
                last_error,
                ..
            } => write!(
                f,
                "Connection lost after {} attempt(s): {}",
                attempts, last_error
            ),
            WatchError::SendDropped {
                sequence, reason, ..
            } => match sequence {
                Some(seq) => write!(f, "Frame #{} dropped: {}", seq, reason),
                None => write!(f, "Frame dropped: {}", reason),
            },
            WatchError::AlreadyRunning { state, .. } => {
                write!(f, "A monitoring session is already active ({})", state)
            }
            WatchError::Timeout {
                operation,
                duration_ms,
                ..
            } => write!(f, "Timeout during {} after {}ms", operation, duration_ms),
            WatchError::Protocol { reason, .. } => write!(f, "Protocol error: {}", reason),
            WatchError::Cancelled { operation, .. } => {
                write!(f, "{} cancelled by stop()", operation)
            }
            WatchError::Io {
                operation, source, ..
            } => write!(f, "I/O error during {}: {}", operation, source),
            WatchError::External {
                library, source, ..
            } => write!(f, "External library error in {}: {}", library, source),
        }
    }
}

impl StdError for WatchError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::External { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// Result type alias using our custom error type
pub type WatchResult<T> = Result<T, WatchError>;

/// Trait for errors that can be retried
pub trait Retryable {
    /// Check if this error can be retried
    fn is_retryable(&self) -> bool;
}

impl Retryable for WatchError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Timeout { .. })
    }
}

/// Trait for errors with severity levels
pub trait HasSeverity {
    /// Get the severity level of this error
    fn severity(&self) -> ErrorSeverity;
}

impl HasSeverity for WatchError {
    fn severity(&self) -> ErrorSeverity {
        self.context().severity
    }
}

/// Trait for errors that provide recovery suggestions
pub trait HasRecoverySuggestion {
    /// Get recovery suggestion for this error
    fn recovery_suggestion(&self) -> Option<&str>;
}

impl HasRecoverySuggestion for WatchError {
    fn recovery_suggestion(&self) -> Option<&str> {
        self.context().recovery_suggestion.as_deref()
    }
}

/// Error classification utilities
pub mod classify {
    use super::*;

    /// Errors that end the session and require a new `start()`
    pub fn is_fatal(error: &WatchError) -> bool {
        matches!(
            error,
            WatchError::Auth { .. } | WatchError::ConnectionLost { .. }
        ) || error.severity() == ErrorSeverity::Fatal
    }

    /// Errors recovered locally by skipping one tick
    pub fn is_per_tick(error: &WatchError) -> bool {
        matches!(
            error,
            WatchError::Capture { .. } | WatchError::Encode { .. } | WatchError::SendDropped { .. }
        )
    }

    /// Errors the caller made before anything started
    pub fn is_rejected_start(error: &WatchError) -> bool {
        matches!(
            error,
            WatchError::Validation { .. } | WatchError::AlreadyRunning { .. }
        )
    }
}

impl From<std::io::Error> for WatchError {
    fn from(error: std::io::Error) -> Self {
        Self::io("unknown", error)
    }
}

impl From<serde_json::Error> for WatchError {
    fn from(error: serde_json::Error) -> Self {
        Self::external("serde_json", error)
    }
}

impl From<toml::de::Error> for WatchError {
    fn from(error: toml::de::Error) -> Self {
        Self::external("toml", error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = WatchError::validation("frame_rate_hz", "must be between 1 and 10", "0");
        assert_eq!(error.category(), "validation");
        assert!(!error.is_retryable());
        assert!(classify::is_rejected_start(&error));
        assert_eq!(
            error.to_string(),
            "Validation failed for 'frame_rate_hz': must be between 1 and 10 (value: 0)"
        );
    }

    #[test]
    fn test_error_with_context() {
        let error = WatchError::encode("zero-sized frame")
            .with_context("encoding tick 4")
            .with_operation("encode")
            .with_metadata("sequence", "4");

        assert_eq!(error.context().context.as_deref(), Some("encoding tick 4"));
        assert_eq!(error.context().operation.as_deref(), Some("encode"));
        assert_eq!(error.context().metadata.len(), 1);
        assert_eq!(error.severity(), ErrorSeverity::Warning);
    }

    #[test]
    fn test_error_classification() {
        assert!(classify::is_fatal(&WatchError::auth("API key not valid")));
        assert!(classify::is_fatal(&WatchError::connection_lost(5, "refused")));
        assert!(!classify::is_fatal(&WatchError::connect("wss://x", "refused")));

        assert!(classify::is_per_tick(&WatchError::capture(
            CaptureFailure::OffScreen,
            "x out of range"
        )));
        assert!(classify::is_per_tick(&WatchError::send_dropped(Some(3), "not streaming")));
        assert!(!classify::is_per_tick(&WatchError::auth("nope")));
    }

    #[test]
    fn test_retryable() {
        assert!(WatchError::connect("wss://x", "refused").is_retryable());
        assert!(WatchError::timeout("handshake", 5000).is_retryable());
        assert!(!WatchError::auth("rejected").is_retryable());
        assert!(!WatchError::connection_lost(3, "refused").is_retryable());
        assert!(!WatchError::protocol("service error 400 INVALID_ARGUMENT").is_retryable());
    }

    #[test]
    fn test_display_send_dropped() {
        let e = WatchError::send_dropped(Some(12), "queue full");
        assert_eq!(e.to_string(), "Frame #12 dropped: queue full");
    }
}
