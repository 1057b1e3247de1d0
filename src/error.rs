//! Classified errors for engine and backend operations.
//!
//! Every failure that crosses the backend boundary carries an [`ErrorKind`]
//! so the retry layer and the scheduler can decide what to do with it
//! without string matching.

use std::fmt;
use std::time::Duration;

/// Result alias used throughout the engine.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classification of a failed operation.
///
/// Drivers assign the kind when they construct an error; the retry layer
/// only ever inspects the kind, never the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Temporary failure, safe to retry (network resets, 5xx, timeouts).
    Transient,
    /// The whole run should stop (invalid credentials, misconfiguration).
    Fatal,
    /// Permanent failure for this operation, but the run may continue.
    NoRetry,
    /// The object or directory does not exist.
    NotFound,
    /// The credentials do not allow this operation.
    PermissionDenied,
    /// Rate limit or quota hit; retry after backing off.
    QuotaExceeded,
    /// Post-transfer digest comparison failed.
    Checksum,
    /// The operation was cancelled through the context token.
    Cancelled,
    /// The backend does not implement this operation.
    Unsupported,
    /// Irreconcilable pair (file vs directory, case clash).
    Conflict,
}

impl ErrorKind {
    /// Whether the low-level retry loop should re-attempt this kind.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::QuotaExceeded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
            ErrorKind::NoRetry => "no-retry",
            ErrorKind::NotFound => "not-found",
            ErrorKind::PermissionDenied => "permission-denied",
            ErrorKind::QuotaExceeded => "quota-exceeded",
            ErrorKind::Checksum => "checksum",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Conflict => "conflict",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn path_suffix(path: &Option<String>) -> String {
    match path {
        Some(p) => format!(" ({p})"),
        None => String::new(),
    }
}

/// An engine error: a kind, a human-readable message, and optionally the
/// remote path it concerns plus the driver-level cause.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}{}", path_suffix(.path))]
pub struct Error {
    kind: ErrorKind,
    message: String,
    path: Option<String>,
    directory: bool,
    #[source]
    source: Option<anyhow::Error>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            path: None,
            directory: false,
            source: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// True for a [`ErrorKind::NotFound`] raised against a directory rather
    /// than an object. Drives the exit-code distinction between the two.
    pub fn is_directory(&self) -> bool {
        self.directory
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn no_retry(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoRetry, message)
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, "object not found").with_path(path)
    }

    pub fn dir_not_found(path: impl Into<String>) -> Self {
        let mut e = Self::new(ErrorKind::NotFound, "directory not found").with_path(path);
        e.directory = true;
        e
    }

    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, "permission denied").with_path(path)
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QuotaExceeded, message)
    }

    pub fn checksum(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Checksum, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    pub fn unsupported(operation: &str) -> Self {
        Self::new(ErrorKind::Unsupported, format!("{operation} not supported by backend"))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorKind::Transient,
            format!("operation timed out after {:.1}s", after.as_secs_f64()),
        )
    }

    /// Exit code for a run that aborted with this error, per the engine's
    /// process-level contract.
    pub fn exit_code(&self) -> i32 {
        match self.kind {
            ErrorKind::NotFound if self.directory => 3,
            ErrorKind::NotFound => 4,
            ErrorKind::Transient | ErrorKind::QuotaExceeded => 5,
            ErrorKind::Fatal => 7,
            ErrorKind::Cancelled => 9,
            _ => 2,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        let kind = match err.kind() {
            Io::NotFound => ErrorKind::NotFound,
            Io::PermissionDenied => ErrorKind::PermissionDenied,
            Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::ConnectionRefused
            | Io::BrokenPipe
            | Io::TimedOut
            | Io::WouldBlock
            | Io::Interrupted => ErrorKind::Transient,
            _ => ErrorKind::NoRetry,
        };
        Self::new(kind, err.to_string()).with_source(err)
    }
}

impl From<opendal::Error> for Error {
    fn from(err: opendal::Error) -> Self {
        use opendal::ErrorKind as Od;
        let kind = match err.kind() {
            Od::NotFound => ErrorKind::NotFound,
            Od::PermissionDenied => ErrorKind::PermissionDenied,
            Od::RateLimited => ErrorKind::QuotaExceeded,
            Od::Unsupported => ErrorKind::Unsupported,
            Od::ConfigInvalid => ErrorKind::Fatal,
            Od::ConditionNotMatch => ErrorKind::Conflict,
            _ if err.is_temporary() => ErrorKind::Transient,
            _ => ErrorKind::NoRetry,
        };
        Self::new(kind, err.to_string()).with_source(err)
    }
}
