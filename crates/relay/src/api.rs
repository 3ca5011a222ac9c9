// HTTP surface next to the websocket endpoint: token verification, snapshot
// download, and the cell-cache write paths. Routes under /internal require
// the shared internal bearer token instead of a collaboration token.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cowrite_common::protocol::{ErrorCode, RoomId};
use cowrite_common::sheet::CellRange;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::auth::VerifyError;
use crate::cells::{BatchSummary, CellUpdate};
use crate::error::RelayError;
use crate::AppState;

pub const SNAPSHOT_VERSION_HEADER: &str = "x-snapshot-version";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/collaboration/verify", post(verify_token))
        .route("/rooms/{room_id}/snapshot", get(room_snapshot))
        .route("/rooms/{room_id}/cells/ensure", post(ensure_cell))
        .route("/internal/rooms/{room_id}/cells", post(upsert_cells))
        .route("/internal/rooms/{room_id}/revoke", post(revoke_user))
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, RelayError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| RelayError::from_code(ErrorCode::AuthMissing))
}

/// Routes under /internal are for trusted backend callers only.
fn require_internal(state: &AppState, headers: &HeaderMap) -> Result<(), RelayError> {
    let token = bearer_token(headers)?;
    if token != state.internal_token.as_ref() {
        return Err(RelayError::from_code(ErrorCode::AuthForbidden));
    }
    Ok(())
}

fn verify_error(error: VerifyError) -> RelayError {
    RelayError::from_code(error.code())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyBody {
    room_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyReply {
    user_id: String,
    user_name: String,
}

/// Server side of the one-time-token verify contract. Always consults the
/// relay's own signing service, so a relay fleet can point its HTTP verifiers
/// at the instance holding the signing secret.
async fn verify_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<VerifyBody>,
) -> Result<Json<VerifyReply>, RelayError> {
    let token = bearer_token(&headers)?;

    // A room id that does not even parse can never match the token.
    let room = RoomId::parse(&body.room_id)
        .map_err(|_| RelayError::from_code(ErrorCode::AuthForbidden))?;

    let user = state.tokens.verify(token, &room).map_err(verify_error)?;
    Ok(Json(VerifyReply { user_id: user.user_id, user_name: user.user_name }))
}

/// Latest durable snapshot as a raw v2 blob. Served without collaboration
/// auth; deployments front this with their signed-URL layer.
async fn room_snapshot(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Response, RelayError> {
    let room =
        RoomId::parse(&room_id).map_err(|_| RelayError::from_code(ErrorCode::RoomNotFound))?;

    let stored = state
        .snapshots
        .load(&room.to_string())
        .await
        .map_err(|error| {
            warn!(room = %room, %error, "snapshot load failed");
            RelayError::from_code(ErrorCode::ServiceUnavailable)
        })?
        .ok_or_else(|| RelayError::from_code(ErrorCode::RoomNotFound))?;

    let mut response = (StatusCode::OK, stored.payload).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    if let Ok(version) = HeaderValue::from_str(&stored.version.to_string()) {
        headers.insert(SNAPSHOT_VERSION_HEADER, version);
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnsureBody {
    cell_ref: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnsureReply {
    cell_ref: String,
    created: bool,
}

/// Authenticated edit path: create the placeholder row for a cell range and
/// kick off background population from the room snapshot.
async fn ensure_cell(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<EnsureBody>,
) -> Result<Json<EnsureReply>, RelayError> {
    let token = bearer_token(&headers)?;
    let room =
        RoomId::parse(&room_id).map_err(|_| RelayError::from_code(ErrorCode::RoomNotFound))?;
    state.verifier.verify(token, &room).await.map_err(verify_error)?;

    let range = CellRange::parse(&body.cell_ref)
        .map_err(|error| RelayError::bad_request(format!("invalid cell reference: {error}")))?;

    let outcome = state.cells.ensure(&room, range).await.map_err(|error| {
        warn!(room = %room, %error, "cell ensure failed");
        RelayError::from_code(ErrorCode::ServerInternalError)
    })?;
    Ok(Json(EnsureReply { cell_ref: outcome.cell_ref, created: outcome.created }))
}

#[derive(Debug, Deserialize)]
struct UpsertBody {
    updates: Vec<CellUpdate>,
}

/// Trusted batch path: write computed values straight into the cache.
async fn upsert_cells(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<UpsertBody>,
) -> Result<Json<BatchSummary>, RelayError> {
    require_internal(&state, &headers)?;
    let room =
        RoomId::parse(&room_id).map_err(|_| RelayError::from_code(ErrorCode::RoomNotFound))?;
    let summary = state.cells.apply_batch(&room, &body.updates).await;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevokeBody {
    user_id: String,
    reason: String,
}

#[derive(Debug, Serialize)]
struct RevokeReply {
    notified: usize,
}

/// Close a user's connections in a room after their access was withdrawn.
/// Unknown rooms are a no-op so callers need not track room liveness.
async fn revoke_user(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<RevokeBody>,
) -> Result<Json<RevokeReply>, RelayError> {
    require_internal(&state, &headers)?;
    let room =
        RoomId::parse(&room_id).map_err(|_| RelayError::from_code(ErrorCode::RoomNotFound))?;
    let notified = state.registry.revoke(&room, &body.user_id, &body.reason).await;
    Ok(Json(RevokeReply { notified }))
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use cowrite_common::protocol::ResourceType;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;

    const SECRET: &str = "unit-test-secret-0123456789-0123456789";
    const INTERNAL: &str = "internal-token";

    fn state() -> AppState {
        AppState::in_memory(SECRET, INTERNAL).expect("in-memory state")
    }

    fn app(state: &AppState) -> Router {
        crate::build_router(state.clone())
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn post_json(uri: &str, bearer: Option<&str>, body: Value) -> Request<Body> {
        let mut builder =
            Request::builder().method("POST").uri(uri).header("content-type", "application/json");
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).expect("request")
    }

    fn doc_room() -> RoomId {
        RoomId::new(ResourceType::Doc, "abc123")
    }

    #[tokio::test]
    async fn verify_round_trips_a_token_and_burns_it() {
        let state = state();
        let room = doc_room();
        let token = state.tokens.issue("u1", "Ada", &room).expect("token issues");

        let request =
            post_json("/collaboration/verify", Some(&token), json!({ "roomId": room.to_string() }));
        let response = app(&state).oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({ "userId": "u1", "userName": "Ada" })
        );

        // Single use: the same token is now spent.
        let replay =
            post_json("/collaboration/verify", Some(&token), json!({ "roomId": room.to_string() }));
        let response = app(&state).oneshot(replay).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"]["code"], "AUTH_INVALID");
    }

    #[tokio::test]
    async fn verify_fails_closed_without_a_bearer_or_on_room_mismatch() {
        let state = state();
        let room = doc_room();

        let request = post_json("/collaboration/verify", None, json!({ "roomId": room.to_string() }));
        let response = app(&state).oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"]["code"], "AUTH_MISSING");

        let token = state.tokens.issue("u1", "Ada", &room).expect("token issues");
        let request =
            post_json("/collaboration/verify", Some(&token), json!({ "roomId": "doc-other" }));
        let response = app(&state).oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["error"]["code"], "AUTH_FORBIDDEN");

        let token = state.tokens.issue("u1", "Ada", &room).expect("token issues");
        let request =
            post_json("/collaboration/verify", Some(&token), json!({ "roomId": "not a room id" }));
        let response = app(&state).oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn snapshot_endpoint_serves_the_stored_blob_with_its_version() {
        let state = state();
        state
            .snapshots
            .persist(&doc_room().to_string(), 3, b"snapshot-bytes")
            .await
            .expect("persist");

        let request = Request::builder()
            .uri("/rooms/doc-abc123/snapshot")
            .body(Body::empty())
            .expect("request");
        let response = app(&state).oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some("application/octet-stream")
        );
        assert_eq!(
            response.headers().get(SNAPSHOT_VERSION_HEADER).and_then(|v| v.to_str().ok()),
            Some("3")
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        assert_eq!(&bytes[..], b"snapshot-bytes");
    }

    #[tokio::test]
    async fn snapshot_endpoint_maps_absence_to_404() {
        let state = state();

        for uri in ["/rooms/doc-missing/snapshot", "/rooms/garbage/snapshot"] {
            let request = Request::builder().uri(uri).body(Body::empty()).expect("request");
            let response = app(&state).oneshot(request).await.expect("response");
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn ensure_authenticates_normalizes_and_reports_creation() {
        let state = state();
        let room = RoomId::new(ResourceType::Spreadsheet, "budget");

        let request = post_json(
            &format!("/rooms/{room}/cells/ensure"),
            None,
            json!({ "cellRef": "A1:B2" }),
        );
        let response = app(&state).oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let token = state.tokens.issue("u1", "Ada", &room).expect("token issues");
        let request = post_json(
            &format!("/rooms/{room}/cells/ensure"),
            Some(&token),
            json!({ "cellRef": "b2:a1" }),
        );
        let response = app(&state).oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({ "cellRef": "A1:B2", "created": true })
        );

        let token = state.tokens.issue("u1", "Ada", &room).expect("token issues");
        let request = post_json(
            &format!("/rooms/{room}/cells/ensure"),
            Some(&token),
            json!({ "cellRef": "not-a-ref" }),
        );
        let response = app(&state).oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn internal_cells_requires_the_shared_secret() {
        let state = state();
        let room = RoomId::new(ResourceType::Spreadsheet, "budget");
        let body = json!({ "updates": [{ "cellRef": "A1", "values": [["5"]] }] });

        let request =
            post_json(&format!("/internal/rooms/{room}/cells"), Some("wrong"), body.clone());
        let response = app(&state).oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let request = post_json(&format!("/internal/rooms/{room}/cells"), Some(INTERNAL), body);
        let response = app(&state).oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        // No ensure ran first, so the write is dropped rather than created.
        assert_eq!(
            body_json(response).await,
            json!({ "patched": 0, "unchanged": 0, "dropped": 1, "invalid": 0, "failed": 0 })
        );
    }

    #[tokio::test]
    async fn revoke_returns_zero_for_unknown_rooms() {
        let state = state();
        let request = post_json(
            "/internal/rooms/doc-ghost/revoke",
            Some(INTERNAL),
            json!({ "userId": "u1", "reason": "gone" }),
        );
        let response = app(&state).oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "notified": 0 }));
    }
}
