// HTTP error envelope and request-id plumbing.
//
// REST endpoints and the pre-upgrade half of the websocket route answer
// failures with `{"error": {code, message, retryable, request_id}}`. The
// code is almost always one of the shared wire codes so clients see the
// same vocabulary on both halves of the protocol; request validation has
// no wire counterpart and maps to a plain 400.

use std::future::Future;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use cowrite_common::protocol::{ErrorCode, Severity};
use serde_json::json;

/// Header used to propagate request ids in and out of the relay.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

/// Run `f` with `request_id` bound for [`current_request_id`].
pub async fn with_request_id_scope<F>(request_id: String, f: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, f).await
}

/// The request id bound by [`with_request_id_scope`], if any.
pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

/// Caller-provided `x-request-id` when present and sane, else a fresh uuid.
pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorKind {
    Wire(ErrorCode),
    BadRequest,
}

/// An error response from a relay HTTP endpoint.
#[derive(Debug, Clone)]
pub struct RelayError {
    kind: ErrorKind,
    message: String,
    request_id: Option<String>,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> RelayError {
        RelayError { kind: ErrorKind::Wire(code), message: message.into(), request_id: None }
    }

    /// An error with the code's stock message.
    pub fn from_code(code: ErrorCode) -> RelayError {
        RelayError::new(code, default_message(code))
    }

    /// A 400 for malformed request payloads (no wire-code counterpart).
    pub fn bad_request(message: impl Into<String>) -> RelayError {
        RelayError { kind: ErrorKind::BadRequest, message: message.into(), request_id: None }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> RelayError {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn code_str(&self) -> &'static str {
        match self.kind {
            ErrorKind::Wire(code) => code.as_str(),
            ErrorKind::BadRequest => "BAD_REQUEST",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::Wire(code) => status_for(code),
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        }
    }

    fn retryable(&self) -> bool {
        match self.kind {
            ErrorKind::Wire(code) => code.severity() == Severity::Recoverable,
            ErrorKind::BadRequest => false,
        }
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message)
    }
}

impl std::error::Error for RelayError {}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.clone().or_else(current_request_id);
        let body = json!({
            "error": {
                "code": self.code_str(),
                "message": self.message,
                "retryable": self.retryable(),
                "request_id": request_id,
            }
        });
        let mut response = (self.status(), axum::Json(body)).into_response();
        if let Some(id) = request_id.as_deref() {
            attach_request_id_header(&mut response, id);
        }
        response
    }
}

/// HTTP status for a wire code surfacing on a REST response.
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::AuthMissing
        | ErrorCode::AuthExpired
        | ErrorCode::AuthInvalid
        | ErrorCode::TokenRefreshRequired => StatusCode::UNAUTHORIZED,
        ErrorCode::AuthForbidden => StatusCode::FORBIDDEN,
        ErrorCode::RoomNotFound => StatusCode::NOT_FOUND,
        ErrorCode::RoomFull | ErrorCode::ServiceUnavailable | ErrorCode::DegradedMode => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorCode::SyncConflict | ErrorCode::PersistStaleSnapshot => StatusCode::CONFLICT,
        ErrorCode::ConnectionTimeout => StatusCode::REQUEST_TIMEOUT,
        ErrorCode::PersistFailed => StatusCode::INSUFFICIENT_STORAGE,
        ErrorCode::SyncFailed
        | ErrorCode::ConnectionClosed
        | ErrorCode::ServerConfigError
        | ErrorCode::ServerInternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn default_message(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::AuthMissing => "authentication required",
        ErrorCode::AuthExpired => "token expired",
        ErrorCode::AuthInvalid => "token rejected",
        ErrorCode::AuthForbidden => "not authorized for this room",
        ErrorCode::RoomNotFound => "room not found",
        ErrorCode::RoomFull => "room is at capacity",
        ErrorCode::ServerConfigError => "server misconfigured",
        ErrorCode::ServerInternalError => "internal server error",
        ErrorCode::SyncConflict => "sync conflict",
        ErrorCode::SyncFailed => "sync failed",
        ErrorCode::ConnectionTimeout => "connection timed out",
        ErrorCode::ConnectionClosed => "connection closed",
        ErrorCode::PersistFailed => "failed to persist snapshot",
        ErrorCode::PersistStaleSnapshot => "snapshot version is stale",
        ErrorCode::TokenRefreshRequired => "token refresh required",
        ErrorCode::ServiceUnavailable => "service unavailable",
        ErrorCode::DegradedMode => "service degraded",
    }
}
