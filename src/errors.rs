use crate::{
    protocol::{self, ProtocolError, UPLOAD_COMPLETE, UPLOAD_OFFSET},
    services::offset_store::UploadError,
};
use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
///
/// `headers` carries protocol fields the client needs to recover, such as
/// the server's offset on a conflict.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub headers: HeaderMap,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            headers: HeaderMap::new(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 409 Conflict
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, msg)
    }

    /// Attach `Upload-Offset` / `Upload-Complete` so the client can resume.
    pub fn with_upload_state(mut self, offset: u64, complete: bool) -> Self {
        self.headers.insert(UPLOAD_OFFSET, protocol::sf_integer(offset));
        self.headers
            .insert(UPLOAD_COMPLETE, protocol::sf_boolean(complete));
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        let mut response = (self.status, body).into_response();
        response.headers_mut().extend(self.headers);
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
    }
}

impl From<ProtocolError> for AppError {
    fn from(err: ProtocolError) -> Self {
        AppError::bad_request(err.to_string())
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::NotFound(_) => AppError::not_found(err.to_string()),
            UploadError::OffsetMismatch { current, .. } => {
                AppError::conflict(err.to_string()).with_upload_state(current, false)
            }
            UploadError::AlreadyComplete(_) => AppError::bad_request(err.to_string()),
            UploadError::SizeExceeded { .. } | UploadError::LengthMismatch { .. } => {
                AppError::bad_request(err.to_string())
            }
            UploadError::Duplicate(_)
            | UploadError::IdExhausted
            | UploadError::Sqlx(_)
            | UploadError::Io(_) => {
                tracing::error!("upload storage failure: {}", err);
                AppError::internal("internal storage error")
            }
        }
    }
}
