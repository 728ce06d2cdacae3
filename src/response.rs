//! Uniform API response envelope.
//!
//! Every HTTP response is `{success, data?, error?, meta?, timestamp,
//! request_id}`. Internal error details never reach the wire; the error
//! block carries a stable code from the taxonomy in `error.rs`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use rand::Rng;
use serde::Serialize;

use crate::error::Error;

#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    pub timestamp: chrono::DateTime<Utc>,
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Meta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
}

/// Per-request correlation id, injected by middleware as an extension.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// `yyyymmddhhmmss-<8 base36 random>`, matching the log correlation format.
pub fn generate_request_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{}-{}", Utc::now().format("%Y%m%d%H%M%S"), suffix)
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T, request_id: &str) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            meta: None,
            timestamp: Utc::now(),
            request_id: request_id.to_string(),
        }
    }

    pub fn ok_with_meta(data: T, meta: Meta, request_id: &str) -> Self {
        Self {
            meta: Some(meta),
            ..Self::ok(data, request_id)
        }
    }
}

impl ApiResponse<serde_json::Value> {
    pub fn from_error(err: &Error, request_id: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                code: err.code().to_string(),
                message: err.public_message(),
                details: None,
            }),
            meta: None,
            timestamp: Utc::now(),
            request_id: request_id.to_string(),
        }
    }
}

/// Handler-level result that renders the envelope on both arms.
pub struct ApiResult<T: Serialize>(pub Result<ApiResponse<T>, (Error, String)>);

impl<T: Serialize> IntoResponse for ApiResult<T> {
    fn into_response(self) -> Response {
        match self.0 {
            Ok(body) => (StatusCode::OK, Json(body)).into_response(),
            Err((err, request_id)) => {
                let status = err.status();
                if status.is_server_error() {
                    tracing::error!(request_id = %request_id, error = %err, "request failed");
                } else {
                    tracing::debug!(request_id = %request_id, error = %err, "request rejected");
                }
                let body = ApiResponse::from_error(&err, &request_id);
                (status, Json(body)).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_shape() {
        let id = generate_request_id();
        let (ts, suffix) = id.split_once('-').expect("dash separator");
        assert_eq!(ts.len(), 14);
        assert!(ts.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_ok_envelope() {
        let resp = ApiResponse::ok(serde_json::json!({"n": 1}), "rid-1");
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["success"], true);
        assert_eq!(v["data"]["n"], 1);
        assert_eq!(v["request_id"], "rid-1");
        assert!(v.get("error").is_none());
    }

    #[test]
    fn test_error_envelope_redacts_internal() {
        let err = Error::Storage("secret table layout".into());
        let resp = ApiResponse::from_error(&err, "rid-2");
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["error"]["code"], "INTERNAL_SERVER_ERROR");
        assert_eq!(v["error"]["message"], "internal server error");
    }
}
