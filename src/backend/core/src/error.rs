//! Error handling for Caravel.
//!
//! Provides error codes with stable numeric identifiers, HTTP status
//! mapping for the admin API, and a distinction between the message shown
//! to callers and the internal detail that goes to the logs.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

/// A specialized Result type for Caravel operations.
pub type Result<T> = std::result::Result<T, CaravelError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Task catalog errors (1000-1099)
    TaskNotFound,
    TaskAlreadyExists,
    RegistryEmpty,
    NoTasksInState,

    // Validation errors (1100-1199)
    ValidationError,
    MissingName,
    MissingResources,
    ConflictingLaunchDescriptor,

    // Storage errors (2000-2099)
    StorageError,
    StorageConnectionFailed,
    KeyNotFound,
    DuplicateKey,

    // Master transport errors (3000-3099)
    MasterTransport,
    MasterResponse,
    NotSubscribed,

    // Leadership errors (4000-4099)
    ElectionFailed,
    LeadershipLost,

    // Configuration errors (5000-5099)
    ConfigurationError,

    // Internal errors (9000-9099)
    SerializationError,
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::TaskNotFound => 1000,
            Self::TaskAlreadyExists => 1001,
            Self::RegistryEmpty => 1002,
            Self::NoTasksInState => 1003,

            Self::ValidationError => 1100,
            Self::MissingName => 1101,
            Self::MissingResources => 1102,
            Self::ConflictingLaunchDescriptor => 1103,

            Self::StorageError => 2000,
            Self::StorageConnectionFailed => 2001,
            Self::KeyNotFound => 2002,
            Self::DuplicateKey => 2003,

            Self::MasterTransport => 3000,
            Self::MasterResponse => 3001,
            Self::NotSubscribed => 3002,

            Self::ElectionFailed => 4000,
            Self::LeadershipLost => 4001,

            Self::ConfigurationError => 5000,

            Self::SerializationError => 9000,
            Self::InternalError => 9001,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::TaskNotFound | Self::RegistryEmpty | Self::NoTasksInState | Self::KeyNotFound => {
                StatusCode::NOT_FOUND
            }

            Self::TaskAlreadyExists | Self::DuplicateKey => StatusCode::CONFLICT,

            Self::ValidationError
            | Self::MissingName
            | Self::MissingResources
            | Self::ConflictingLaunchDescriptor => StatusCode::UNPROCESSABLE_ENTITY,

            Self::StorageConnectionFailed | Self::NotSubscribed => StatusCode::SERVICE_UNAVAILABLE,

            Self::MasterTransport | Self::MasterResponse => StatusCode::BAD_GATEWAY,

            Self::StorageError
            | Self::ElectionFailed
            | Self::LeadershipLost
            | Self::ConfigurationError
            | Self::SerializationError
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if the failure is transient and worth retrying.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StorageError | Self::StorageConnectionFailed | Self::MasterTransport
        )
    }

    /// Get the error category for grouping in logs and metrics.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "task",
            1100..=1199 => "validation",
            2000..=2099 => "storage",
            3000..=3099 => "master",
            4000..=4099 => "leadership",
            5000..=5099 => "configuration",
            _ => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The error type used throughout the scheduler.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct CaravelError {
    /// Machine-readable code.
    pub code: ErrorCode,
    /// Message suitable for API callers.
    pub message: String,
    /// Internal detail, logged but never returned to callers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal: Option<String>,
}

impl CaravelError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            internal: None,
        }
    }

    /// Create an error carrying internal detail for the logs.
    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<String>,
        internal: impl Into<String>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            internal: Some(internal.into()),
        }
    }

    pub fn not_found(name: &str) -> Self {
        Self::new(ErrorCode::TaskNotFound, format!("Task {} not found", name))
    }

    pub fn already_exists(name: &str) -> Self {
        Self::new(
            ErrorCode::TaskAlreadyExists,
            format!("Task {} already exists", name),
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn storage(message: impl Into<String>, internal: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::StorageError, message, internal)
    }

    pub fn master_transport(internal: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::MasterTransport,
            "Master transport failure",
            internal,
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Log at a level appropriate for the error category.
    pub fn log(&self) {
        match self.code.http_status() {
            StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE => {
                error!(
                    code = %self.code,
                    category = self.code.category(),
                    internal = self.internal.as_deref().unwrap_or(""),
                    "{}",
                    self.message
                );
            }
            _ => {
                warn!(code = %self.code, category = self.code.category(), "{}", self.message);
            }
        }
    }
}

impl From<serde_json::Error> for CaravelError {
    fn from(e: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "Serialization failure",
            e.to_string(),
        )
    }
}

impl From<redis::RedisError> for CaravelError {
    fn from(e: redis::RedisError) -> Self {
        let code = if e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
            ErrorCode::StorageConnectionFailed
        } else {
            ErrorCode::StorageError
        };
        Self::with_internal(code, "Storage backend failure", e.to_string())
    }
}

impl From<reqwest::Error> for CaravelError {
    fn from(e: reqwest::Error) -> Self {
        Self::master_transport(e.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP Response Mapping
// ═══════════════════════════════════════════════════════════════════════════════

impl IntoResponse for CaravelError {
    fn into_response(self) -> Response {
        self.log();
        metrics::counter!(
            "caravel_errors_total",
            "category" => self.code.category(),
        )
        .increment(1);

        // Same {status, message, data} envelope as the success path, so
        // callers never branch on status to find the payload key.
        let body = serde_json::json!({
            "status": "FAILED",
            "message": self.message,
            "data": {
                "code": self.code,
                "numeric_code": self.code.numeric_code(),
            }
        });
        (self.code.http_status(), Json(body)).into_response()
    }
}
