//! Errors raised by the live results core.
//!
//! Every failure carries an [`ErrorCode`]. The code picks the HTTP status on
//! the trigger API, the level the error is logged at, and the labels on the
//! `laplink_errors_total` counter.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A specialized Result type for Laplink operations.
pub type Result<T> = std::result::Result<T, LaplinkError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Stable, machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No brokered connection freed up within the wait budget
    ResourceExhausted,
    /// The broker was closed
    PoolClosed,
    /// A registration arrived after the scheduler shut down
    SchedulerShutdown,
    /// The event or phase job does not exist
    RecordNotFound,
    /// The aggregation procedure or the phase write failed
    DependencyFailure,
    /// A database session could not be opened or was lost
    DatabaseUnavailable,
    /// A statement failed on a live session
    DatabaseError,
    /// Settings rejected at load time
    ConfigurationError,
    InternalError,
}

impl ErrorCode {
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::ResourceExhausted => 1000,
            Self::PoolClosed => 1001,
            Self::SchedulerShutdown => 1100,
            Self::DatabaseError => 2000,
            Self::DatabaseUnavailable => 2001,
            Self::RecordNotFound => 2004,
            Self::DependencyFailure => 3000,
            Self::ConfigurationError => 5000,
            Self::InternalError => 9000,
        }
    }

    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::RecordNotFound => StatusCode::NOT_FOUND,
            Self::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
            Self::PoolClosed | Self::SchedulerShutdown | Self::DatabaseUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::DependencyFailure => StatusCode::BAD_GATEWAY,
            Self::DatabaseError | Self::ConfigurationError | Self::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether the same call may succeed if repeated later.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted | Self::DependencyFailure | Self::DatabaseUnavailable
        )
    }

    pub const fn category(&self) -> &'static str {
        match self {
            Self::ResourceExhausted | Self::PoolClosed => "pool",
            Self::SchedulerShutdown => "scheduler",
            Self::RecordNotFound | Self::DatabaseUnavailable | Self::DatabaseError => "database",
            Self::DependencyFailure => "dependency",
            Self::ConfigurationError => "configuration",
            Self::InternalError => "internal",
        }
    }

    pub const fn severity(&self) -> ErrorSeverity {
        match self {
            Self::RecordNotFound => ErrorSeverity::Low,
            Self::ResourceExhausted | Self::PoolClosed | Self::SchedulerShutdown => {
                ErrorSeverity::Medium
            }
            Self::DependencyFailure
            | Self::DatabaseUnavailable
            | Self::DatabaseError
            | Self::ConfigurationError
            | Self::InternalError => ErrorSeverity::High,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How loudly an error is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected by callers; logged at debug
    Low,
    /// Contention or shutdown; logged at warn
    Medium,
    /// The database or the procedure misbehaved; logged at error
    High,
}

impl ErrorSeverity {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Structured details returned to API clients alongside the message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    #[serde(flatten)]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl ErrorDetails {
    pub fn is_empty(&self) -> bool {
        self.entity_type.is_none() && self.entity_id.is_none() && self.context.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The error type of the live results core.
///
/// `message` is safe to show clients. `internal` only reaches the logs.
#[derive(Error, Debug)]
pub struct LaplinkError {
    code: ErrorCode,
    message: Cow<'static, str>,
    internal: Option<String>,
    details: ErrorDetails,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for LaplinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(internal) = &self.internal {
            write!(f, " ({})", internal)?;
        }
        Ok(())
    }
}

impl LaplinkError {
    /// Create an error and count it in `laplink_errors_total`.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let severity = code.severity();
        counter!(
            "laplink_errors_total",
            "code" => code.to_string(),
            "category" => code.category(),
            "severity" => severity.as_str(),
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

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, "An internal error occurred").with_internal(message)
    }

    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        let mut error = Self::new(
            ErrorCode::RecordNotFound,
            format!("{} not found: {}", entity_type, entity_id),
        );
        error.details.entity_type = Some(entity_type);
        error.details.entity_id = Some(entity_id);
        error
    }

    /// No pooled connection became free within the wait budget.
    pub fn resource_exhausted(pool: impl Into<String>, waited_ms: u64) -> Self {
        let pool = pool.into();
        let mut error = Self::new(
            ErrorCode::ResourceExhausted,
            "All database connections are currently busy",
        )
        .with_internal(format!("pool '{}' had no free connection after {}ms", pool, waited_ms))
        .with_context("waited_ms", waited_ms);
        error.details.entity_type = Some("connection_pool".to_string());
        error.details.entity_id = Some(pool);
        error
    }

    /// The broker was closed while a caller was waiting, or before it asked.
    pub fn pool_closed(pool: impl Into<String>) -> Self {
        Self::new(ErrorCode::PoolClosed, "The connection pool is shut down")
            .with_internal(format!("pool '{}' closed", pool.into()))
    }

    /// The aggregation procedure or the phase write failed.
    pub fn dependency_failure(dependency: impl Into<String>, reason: impl Into<String>) -> Self {
        let dependency = dependency.into();
        Self::new(ErrorCode::DependencyFailure, format!("{} failed", dependency))
            .with_internal(reason)
            .with_context("dependency", dependency)
    }

    pub fn scheduler_shutdown() -> Self {
        Self::new(
            ErrorCode::SchedulerShutdown,
            "The results scheduler has been shut down",
        )
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), value);
        }
        self
    }

    fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal = Some(internal.into());
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Client-facing message.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.code.severity()
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::RecordNotFound
    }

    /// Log at the level the severity calls for.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        match self.severity() {
            ErrorSeverity::High => tracing::error!(
                error_code = %code,
                category,
                message = %self.message,
                internal = ?self.internal,
                source = ?self.source,
                "Request failed"
            ),
            ErrorSeverity::Medium => tracing::warn!(
                error_code = %code,
                category,
                message = %self.message,
                "Request rejected"
            ),
            ErrorSeverity::Low => tracing::debug!(
                error_code = %code,
                category,
                message = %self.message,
                "Request rejected"
            ),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error body of the trigger API.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Always false
    pub success: bool,
    pub error: ErrorInfo,
}

#[derive(Debug, Serialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub numeric_code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&LaplinkError> for ErrorResponse {
    fn from(error: &LaplinkError) -> Self {
        Self {
            success: false,
            error: ErrorInfo {
                code: error.code,
                numeric_code: error.code.numeric_code(),
                message: error.message.to_string(),
                details: (!error.details.is_empty()).then(|| error.details.clone()),
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

impl IntoResponse for LaplinkError {
    fn into_response(self) -> Response {
        self.log();
        (self.http_status(), Json(ErrorResponse::from(&self))).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for LaplinkError {
    fn from(error: sqlx::Error) -> Self {
        let (code, message) = match &error {
            sqlx::Error::RowNotFound => (ErrorCode::RecordNotFound, "The requested record was not found"),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed => (ErrorCode::DatabaseUnavailable, "The database is unreachable"),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };
        Self::new(code, message)
            .with_internal(error.to_string())
            .with_source(error)
    }
}

impl From<config::ConfigError> for LaplinkError {
    fn from(error: config::ConfigError) -> Self {
        Self::configuration("Configuration could not be loaded")
            .with_internal(error.to_string())
            .with_source(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_retry_by_code() {
        assert_eq!(ErrorCode::RecordNotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::ResourceExhausted.http_status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ErrorCode::SchedulerShutdown.http_status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ErrorCode::DependencyFailure.http_status(), StatusCode::BAD_GATEWAY);

        assert!(ErrorCode::ResourceExhausted.is_retryable());
        assert!(ErrorCode::DatabaseUnavailable.is_retryable());
        assert!(!ErrorCode::RecordNotFound.is_retryable());
        assert!(!ErrorCode::SchedulerShutdown.is_retryable());
    }

    #[test]
    fn test_resource_exhausted_names_pool() {
        let error = LaplinkError::resource_exhausted("laplink", 250);
        assert_eq!(error.code(), ErrorCode::ResourceExhausted);
        assert_eq!(error.details().entity_id.as_deref(), Some("laplink"));
        assert!(error.details().context.contains_key("waited_ms"));
        assert!(error.to_string().contains("250ms"));
        assert_eq!(error.severity(), ErrorSeverity::Medium);
    }

    #[test]
    fn test_not_found_is_low_severity() {
        let error = LaplinkError::not_found("Event", "42");
        assert!(error.is_not_found());
        assert_eq!(error.message(), "Event not found: 42");
        assert_eq!(error.details().entity_type.as_deref(), Some("Event"));
        assert_eq!(error.severity(), ErrorSeverity::Low);
    }

    #[test]
    fn test_response_hides_internal_reason() {
        let error = LaplinkError::dependency_failure("Result aggregation", "deadlock");
        assert!(error.to_string().contains("deadlock"));

        let json = serde_json::to_value(ErrorResponse::from(&error)).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "DEPENDENCY_FAILURE");
        assert_eq!(json["error"]["numeric_code"], 3000);
        assert_eq!(json["error"]["message"], "Result aggregation failed");
        assert_eq!(json["error"]["details"]["dependency"], "Result aggregation");
        assert!(!json.to_string().contains("deadlock"));
    }

    #[test]
    fn test_sqlx_errors_by_kind() {
        let lost = LaplinkError::from(sqlx::Error::Io(std::io::Error::from(
            std::io::ErrorKind::ConnectionReset,
        )));
        assert_eq!(lost.code(), ErrorCode::DatabaseUnavailable);

        let missing = LaplinkError::from(sqlx::Error::RowNotFound);
        assert!(missing.is_not_found());
    }
}
