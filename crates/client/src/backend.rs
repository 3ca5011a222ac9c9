// HTTP control plane: collaboration tokens, snapshot URLs, cell refs.
//
// The relay socket never hands out credentials; every connection attempt
// fetches a fresh one-time token through here first.

use cowrite_common::protocol::{ErrorCode, RoomId};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Failure talking to the backend, folded into the wire error taxonomy so
/// the connection manager can reuse its severity rules.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct BackendError {
    pub code: ErrorCode,
    pub message: String,
}

impl BackendError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> BackendError {
        BackendError { code, message: message.into() }
    }

    pub fn is_terminal(&self) -> bool {
        self.code.is_terminal()
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> BackendError {
        let code = if err.is_timeout() {
            ErrorCode::ConnectionTimeout
        } else {
            ErrorCode::ConnectionClosed
        };
        BackendError::new(code, err.to_string())
    }
}

/// Issues one-time collaboration tokens. One fetch per connection attempt;
/// tokens must never be reused across attempts.
pub trait TokenProvider: Send + Sync + 'static {
    fn collab_token(
        &self,
        room: &RoomId,
    ) -> impl std::future::Future<Output = Result<String, BackendError>> + Send;
}

/// Resolves and fetches cold-start snapshots for rooms the client has never
/// seen. `snapshot_url` returns `None` when no snapshot exists yet.
pub trait SnapshotSource: Send + Sync + 'static {
    fn snapshot_url(
        &self,
        room: &RoomId,
    ) -> impl std::future::Future<Output = Result<Option<String>, BackendError>> + Send;

    fn fetch_snapshot(
        &self,
        url: &str,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, BackendError>> + Send;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotUrlResponse {
    snapshot_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    #[serde(default)]
    message: Option<String>,
}

/// Backend client over the Cowrite HTTP API.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpBackend {
    pub fn new(base_url: &str) -> Result<HttpBackend, BackendError> {
        let base_url = Url::parse(base_url).map_err(|e| {
            BackendError::new(ErrorCode::ServerConfigError, format!("invalid backend url: {e}"))
        })?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(BackendError::from)?;
        Ok(HttpBackend { http, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        self.base_url.join(path).map_err(|e| {
            BackendError::new(ErrorCode::ServerConfigError, format!("invalid endpoint {path}: {e}"))
        })
    }

    /// Ask the backend to ensure a derived-cache row exists for a cell
    /// reference. The relay populates the value asynchronously.
    pub async fn ensure_cell(&self, room: &RoomId, cell_ref: &str) -> Result<(), BackendError> {
        let url = self.endpoint(&format!("rooms/{room}/cells/ensure"))?;
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({ "cellRef": cell_ref }))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

/// Map an error response to the taxonomy: a relay error envelope in the body
/// wins, otherwise the HTTP status decides.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let fallback = code_for_status(status);
    let body = response.text().await.unwrap_or_default();
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&body) {
        let code = ErrorCode::parse(&envelope.error.code).unwrap_or(fallback);
        let message = envelope.error.message.unwrap_or_else(|| envelope.error.code.clone());
        return Err(BackendError::new(code, message));
    }
    Err(BackendError::new(fallback, format!("backend returned {status}")))
}

fn code_for_status(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::UNAUTHORIZED => ErrorCode::AuthExpired,
        StatusCode::FORBIDDEN => ErrorCode::AuthForbidden,
        StatusCode::NOT_FOUND => ErrorCode::RoomNotFound,
        s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
            ErrorCode::ServiceUnavailable
        }
        _ => ErrorCode::ConnectionClosed,
    }
}

impl TokenProvider for HttpBackend {
    async fn collab_token(&self, room: &RoomId) -> Result<String, BackendError> {
        let url = self.endpoint("collaboration/token")?;
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({ "roomId": room }))
            .send()
            .await?;
        let response = check_status(response).await?;
        let body: TokenResponse = response.json().await?;
        Ok(body.token)
    }
}

impl SnapshotSource for HttpBackend {
    async fn snapshot_url(&self, room: &RoomId) -> Result<Option<String>, BackendError> {
        let url = self.endpoint(&format!("rooms/{room}/snapshot-url"))?;
        let response = self.http.get(url).send().await;
        let response = match response {
            Ok(r) if r.status() == StatusCode::NOT_FOUND => return Ok(None),
            Ok(r) => check_status(r).await?,
            Err(e) => return Err(e.into()),
        };
        let body: SnapshotUrlResponse = response.json().await?;
        Ok(body.snapshot_url)
    }

    async fn fetch_snapshot(&self, url: &str) -> Result<Vec<u8>, BackendError> {
        let response = self.http.get(url).send().await?;
        let response = check_status(response).await?;
        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }
}
