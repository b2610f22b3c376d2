//! 统一的 API 错误类型与转换。所有错误响应均为 JSON `{ "error": ... }`。

use axum::Json;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::io::{self, ErrorKind};
use tracing::error;

use crate::chunks::StageError;
use crate::session::UploadError;
use crate::storage::StorageError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    PayloadTooLarge(String),
    RangeNotSatisfiable(u64),
    IncompleteUpload { received: u64, expected: u64 },
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            ApiError::Internal(msg) => {
                error!(error = msg, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
            ApiError::RangeNotSatisfiable(size) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                return (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    headers,
                    Json(json!({ "error": "Range not satisfiable" })),
                )
                    .into_response();
            }
            ApiError::IncompleteUpload { received, expected } => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "error": "Not all chunks uploaded",
                        "received": received,
                        "expected": expected,
                    })),
                )
                    .into_response();
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::AccessDenied => ApiError::Forbidden(error.to_string()),
            StorageError::InvalidName(msg) | StorageError::AlreadyExists(msg) => {
                ApiError::BadRequest(msg.to_string())
            }
            StorageError::NotFound(_) => ApiError::NotFound(error.to_string()),
            StorageError::Io(err) => err.into(),
        }
    }
}

impl From<io::Error> for ApiError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            ErrorKind::NotFound => ApiError::NotFound(error.to_string()),
            _ => ApiError::Internal(error.to_string()),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(error: MultipartError) -> Self {
        ApiError::BadRequest(format!("Invalid multipart body: {}", error.body_text()))
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        ApiError::BadRequest(format!("Invalid multipart body: {}", rejection.body_text()))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(format!("Invalid JSON body: {}", rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(format!("Invalid query: {}", rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(format!("Invalid path: {}", rejection.body_text()))
    }
}

impl From<UploadError> for ApiError {
    fn from(error: UploadError) -> Self {
        match error {
            UploadError::IncompleteUpload { received, expected } => {
                ApiError::IncompleteUpload { received, expected }
            }
            UploadError::InvalidChunkIndex { .. }
            | UploadError::InvalidTotalChunks
            | UploadError::SessionTotalMismatch { .. }
            | UploadError::InvalidUploadId
            | UploadError::InvalidFileName => ApiError::BadRequest(error.to_string()),
            UploadError::SessionNotFound(_) => ApiError::NotFound(error.to_string()),
            UploadError::SessionBusy(_) => ApiError::Conflict(error.to_string()),
            UploadError::Storage(err) => err.into(),
            UploadError::CorruptSession(_) | UploadError::Io(_) => {
                ApiError::Internal(error.to_string())
            }
        }
    }
}

impl From<StageError> for ApiError {
    fn from(error: StageError) -> Self {
        match error {
            StageError::TooLarge(limit) => {
                ApiError::PayloadTooLarge(format!("Upload exceeds the {limit} byte limit"))
            }
            StageError::Io(err) => err.into(),
        }
    }
}
