//! Domain error taxonomy.
//!
//! Every fallible path in the crate bubbles one of these kinds; the HTTP
//! layer maps kind → status + stable code string and the client retry
//! policy consults `is_retryable`.

use axum::http::StatusCode;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // ── Input ───────────────────────────────────────────
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unsupported device generation: {0}")]
    UnsupportedGeneration(u8),

    #[error("could not determine device generation at {0}")]
    InvalidGeneration(String),

    // ── Transport ───────────────────────────────────────
    #[error("operation timed out")]
    Timeout,

    #[error("device unreachable: {0}")]
    DeviceUnreachable(String),

    #[error("device requires authentication")]
    AuthRequired,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    // ── State ───────────────────────────────────────────
    #[error("template inheritance cycle at template {0}")]
    TemplateCycle(i64),

    #[error("template error: {0}")]
    Template(String),

    #[error("stale record: {0}")]
    Stale(String),

    #[error("record expired: {0}")]
    Expired(String),

    // ── Storage ─────────────────────────────────────────
    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    // ── Integrity ───────────────────────────────────────
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("record count mismatch: archive declares {declared}, found {found}")]
    RecordCountMismatch { declared: u64, found: u64 },

    #[error("unsupported archive version: {0}")]
    UnsupportedArchiveVersion(String),

    // ── Plugins ─────────────────────────────────────────
    #[error("plugin error: {0}")]
    Plugin(String),

    // ── Internal ────────────────────────────────────────
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error maps to at the API boundary.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Validation(_) | Error::InvalidGeneration(_) => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict(_) | Error::Stale(_) => StatusCode::CONFLICT,
            Error::UnsupportedGeneration(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Error::DeviceUnreachable(_) => StatusCode::BAD_GATEWAY,
            Error::AuthRequired | Error::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            Error::Protocol(_) | Error::Rpc { .. } => StatusCode::BAD_GATEWAY,
            Error::TemplateCycle(_) | Error::Template(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Expired(_) => StatusCode::GONE,
            Error::ChecksumMismatch { .. }
            | Error::RecordCountMismatch { .. }
            | Error::UnsupportedArchiveVersion(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Plugin(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Storage(_) | Error::Io(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable code for the response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_FAILED",
            Error::NotFound { resource, .. } => match *resource {
                "device" => "DEVICE_NOT_FOUND",
                _ => "NOT_FOUND",
            },
            Error::Conflict(_) => "CONFLICT",
            Error::UnsupportedGeneration(_) | Error::InvalidGeneration(_) => {
                "UNSUPPORTED_GENERATION"
            }
            Error::Timeout => "TIMEOUT",
            Error::DeviceUnreachable(_) => "DEVICE_OFFLINE",
            Error::AuthRequired | Error::AuthFailed(_) => "UNAUTHORIZED",
            Error::Protocol(_) | Error::Rpc { .. } => "DEVICE_PROTOCOL_ERROR",
            Error::TemplateCycle(_) | Error::Template(_) => "TEMPLATE_ERROR",
            Error::Stale(_) => "STALE_RECORD",
            Error::Expired(_) => "EXPIRED",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            Error::RecordCountMismatch { .. } => "RECORD_COUNT_MISMATCH",
            Error::UnsupportedArchiveVersion(_) => "UNSUPPORTED_ARCHIVE_VERSION",
            Error::Plugin(_) => "PLUGIN_ERROR",
            Error::Io(_) | Error::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Transient errors the device client may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::DeviceUnreachable(_) | Error::Protocol(_)
        )
    }

    /// Message safe to return to API clients. Internal details are redacted.
    pub fn public_message(&self) -> String {
        match self {
            Error::Storage(_) | Error::Io(_) | Error::Internal(_) => {
                "internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound {
                resource: "record",
                id: String::new(),
            },
            rusqlite::Error::SqliteFailure(code, Some(msg))
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::Conflict(msg)
            }
            other => Error::Storage(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout
        } else if e.is_connect() {
            Error::DeviceUnreachable(
                e.url().map(|u| u.to_string()).unwrap_or_else(|| "unknown".into()),
            )
        } else {
            Error::Protocol(e.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Validation(format!("invalid JSON: {}", e))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Validation(format!("invalid YAML: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::Validation("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            Error::NotFound { resource: "device", id: "7".into() }.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(Error::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(Error::Storage("boom".into()).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_device_not_found_code() {
        let err = Error::NotFound { resource: "device", id: "3".into() };
        assert_eq!(err.code(), "DEVICE_NOT_FOUND");
        let err = Error::NotFound { resource: "template", id: "3".into() };
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn test_internal_details_redacted() {
        let err = Error::Storage("table devices is corrupt at page 9".into());
        assert_eq!(err.public_message(), "internal server error");
        let err = Error::Validation("mac is required".into());
        assert!(err.public_message().contains("mac is required"));
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::DeviceUnreachable("10.0.0.9".into()).is_retryable());
        assert!(!Error::AuthRequired.is_retryable());
        assert!(!Error::Validation("x".into()).is_retryable());
    }
}
