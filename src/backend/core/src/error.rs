//! Error type for the cache and batch-loading core.
//!
//! Cache layers are best-effort: store failures are normally counted and
//! swallowed at the lowest layer. A [`CoreError`] only reaches a caller when
//! a caller-supplied fetcher fails, a key pattern is malformed, a lock cannot
//! be had, or an open circuit rejects a call that has no fallback.
//!
//! Every error carries an [`ErrorCode`] naming the layer that failed, a
//! public message safe to show upstream, and optionally the raw cause for
//! logs. Constructing one bumps `technews_errors_total{code,layer}`.

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

pub type Result<T> = std::result::Result<T, CoreError>;

/// What went wrong, grouped by the layer that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Store (Redis or the in-process map)
    CacheError,
    CacheConnectionFailed,

    // Coordination between callers and processes
    LockNotAcquired,
    CircuitOpen,

    // Source of truth
    DatabaseError,
    DatabaseConnectionFailed,
    DatabaseQueryFailed,
    RecordNotFound,

    // Value encoding
    SerializationError,
    DeserializationError,

    // Caller input
    InvalidInput,
    InvalidPattern,

    TimeLimitExceeded,
    InternalError,
    UnknownError,
}

impl ErrorCode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CacheError => "cache_error",
            Self::CacheConnectionFailed => "cache_connection_failed",
            Self::LockNotAcquired => "lock_not_acquired",
            Self::CircuitOpen => "circuit_open",
            Self::DatabaseError => "database_error",
            Self::DatabaseConnectionFailed => "database_connection_failed",
            Self::DatabaseQueryFailed => "database_query_failed",
            Self::RecordNotFound => "record_not_found",
            Self::SerializationError => "serialization_error",
            Self::DeserializationError => "deserialization_error",
            Self::InvalidInput => "invalid_input",
            Self::InvalidPattern => "invalid_pattern",
            Self::TimeLimitExceeded => "time_limit_exceeded",
            Self::InternalError => "internal_error",
            Self::UnknownError => "unknown_error",
        }
    }

    /// Layer label used in logs and metrics.
    pub const fn layer(&self) -> &'static str {
        match self {
            Self::CacheError | Self::CacheConnectionFailed | Self::TimeLimitExceeded => "store",
            Self::LockNotAcquired | Self::CircuitOpen => "coordination",
            Self::DatabaseError
            | Self::DatabaseConnectionFailed
            | Self::DatabaseQueryFailed
            | Self::RecordNotFound => "database",
            Self::SerializationError | Self::DeserializationError => "codec",
            Self::InvalidInput | Self::InvalidPattern => "input",
            Self::InternalError | Self::UnknownError => "internal",
        }
    }

    /// Whether the same call may succeed later without changes.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CacheError
                | Self::CacheConnectionFailed
                | Self::LockNotAcquired
                | Self::CircuitOpen
                | Self::DatabaseConnectionFailed
                | Self::DatabaseQueryFailed
                | Self::TimeLimitExceeded
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How loudly an error is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Misses, contention, bad input
    Low,
    /// The cache is degraded but callers are still served
    Medium,
    /// The source of truth failed
    High,
    Critical,
}

impl From<ErrorCode> for ErrorSeverity {
    fn from(code: ErrorCode) -> Self {
        match code.layer() {
            "input" => Self::Low,
            "coordination" if code == ErrorCode::LockNotAcquired => Self::Low,
            "database" if code == ErrorCode::RecordNotFound => Self::Low,
            "store" | "coordination" | "codec" => Self::Medium,
            "database" => Self::High,
            _ => Self::Critical,
        }
    }
}

/// Structured data attached to an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Cache, lock or record key involved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub retry_after: Option<Duration>,
}

#[derive(Error, Debug)]
pub struct CoreError {
    code: ErrorCode,
    message: Cow<'static, str>,
    /// Raw cause text, for logs only
    internal: Option<String>,
    details: ErrorDetails,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(internal) = &self.internal {
            write!(f, " ({internal})")?;
        }
        Ok(())
    }
}

impl CoreError {
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        counter!(
            "technews_errors_total",
            "code" => code.as_str(),
            "layer" => code.layer(),
        )
        .increment(1);
        Self {
            code,
            message: message.into(),
            internal: None,
            details: ErrorDetails::default(),
            source: None,
        }
    }

    /// An error whose public message hides the raw cause.
    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        internal: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, message);
        error.internal = Some(internal.into());
        error
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    pub fn invalid_input(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    /// A fetcher or repository call failed.
    pub fn database(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::DatabaseQueryFailed, "A database error occurred", message)
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        let what = what.into();
        let mut error = Self::new(ErrorCode::RecordNotFound, format!("Not found: {what}"));
        error.details.key = Some(what);
        error
    }

    /// Rejected by an open circuit with no fallback.
    pub fn circuit_open(name: &str, retry_after: Duration) -> Self {
        let mut error = Self::new(ErrorCode::CircuitOpen, format!("Circuit '{name}' is open"));
        error.details.retry_after = Some(retry_after);
        error
    }

    pub fn lock_not_acquired(key: impl Into<String>) -> Self {
        let key = key.into();
        let mut error = Self::new(ErrorCode::LockNotAcquired, format!("Lock not acquired: {key}"));
        error.details.key = Some(key);
        error
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.details.key = Some(key.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Message without the internal cause.
    pub fn user_message(&self) -> &str {
        &self.message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.code.into()
    }

    /// Log at a level matching [`severity`](Self::severity).
    pub fn log(&self) {
        let code = self.code.as_str();
        let layer = self.code.layer();
        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => error!(
                code,
                layer,
                message = %self.message,
                internal = ?self.internal,
                key = ?self.details.key,
                "Core error"
            ),
            ErrorSeverity::Medium => warn!(
                code,
                layer,
                message = %self.message,
                internal = ?self.internal,
                "Degraded operation"
            ),
            ErrorSeverity::Low => debug!(code, layer, message = %self.message, "Expected condition"),
        }
    }
}

/// Wrap foreign errors and missing values with a code and public message.
pub trait ErrorContext<T> {
    fn context(self, code: ErrorCode, message: &'static str) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, code: ErrorCode, message: &'static str) -> Result<T> {
        self.map_err(|e| CoreError::with_internal(code, message, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, code: ErrorCode, message: &'static str) -> Result<T> {
        self.ok_or_else(|| CoreError::new(code, message))
    }
}

impl From<redis::RedisError> for CoreError {
    fn from(error: redis::RedisError) -> Self {
        let (code, message) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::CacheConnectionFailed, "Unable to connect to cache")
        } else if error.is_timeout() {
            (ErrorCode::TimeLimitExceeded, "Cache operation timed out")
        } else {
            (ErrorCode::CacheError, "A cache error occurred")
        };
        Self::with_internal(code, message, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_io() {
            ErrorCode::SerializationError
        } else {
            ErrorCode::DeserializationError
        };
        Self::with_internal(code, "Cached value could not be processed", error.to_string()).with_source(error)
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(error: sqlx::Error) -> Self {
        let code = match &error {
            sqlx::Error::RowNotFound => ErrorCode::RecordNotFound,
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                ErrorCode::DatabaseConnectionFailed
            }
            sqlx::Error::Database(_) => ErrorCode::DatabaseQueryFailed,
            _ => ErrorCode::DatabaseError,
        };
        Self::with_internal(code, "A database error occurred", error.to_string()).with_source(error)
    }
}

impl From<regex::Error> for CoreError {
    fn from(error: regex::Error) -> Self {
        Self::with_internal(ErrorCode::InvalidPattern, "Invalid key pattern", error.to_string()).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for CoreError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::TimeLimitExceeded, "Operation timed out", error.to_string()).with_source(error)
    }
}
