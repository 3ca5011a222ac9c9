// One-time collaboration tokens.
//
// The application server (or this relay's own issue endpoint in local dev)
// signs a short-lived HS256 token scoped to a single room. The relay accepts
// each token exactly once: the jti is consumed on first presentation, before
// the room check, so a token aimed at the wrong room is burned rather than
// left replayable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use cowrite_common::protocol::{ErrorCode, RoomId};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use url::Url;

/// Lifetime of an issued collaboration token, in seconds.
pub const TOKEN_TTL_SECONDS: i64 = 120;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CollabClaims {
    jti: String,
    sub: String,
    name: String,
    room: String,
    iat: i64,
    exp: i64,
}

/// Identity attached to a connection after successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedUser {
    pub user_id: String,
    pub user_name: String,
    /// Expiry of the presented token when the verifier knows it. The HTTP
    /// verifier does not report expiry; callers fall back to the token TTL.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Why a token was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    Expired,
    Invalid,
    RoomMismatch,
    Unavailable,
    Internal,
}

impl VerifyError {
    pub fn code(self) -> ErrorCode {
        match self {
            VerifyError::Expired => ErrorCode::AuthExpired,
            VerifyError::Invalid => ErrorCode::AuthInvalid,
            VerifyError::RoomMismatch => ErrorCode::AuthForbidden,
            VerifyError::Unavailable => ErrorCode::ServiceUnavailable,
            VerifyError::Internal => ErrorCode::ServerInternalError,
        }
    }
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code().as_str())
    }
}

impl std::error::Error for VerifyError {}

/// Issues and verifies one-time collaboration tokens.
pub struct CollabTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    /// jti -> exp (unix seconds) of every accepted token. Pruned on each
    /// verification, so the set stays bounded by the token TTL.
    used: Mutex<HashMap<String, i64>>,
}

impl CollabTokenService {
    pub fn new(secret: &str) -> Result<CollabTokenService> {
        if secret.len() < 32 {
            bail!("collaboration token secret must be at least 32 bytes");
        }
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Ok(CollabTokenService {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            used: Mutex::new(HashMap::new()),
        })
    }

    /// Sign a token granting `user_id` one connection to `room`.
    pub fn issue(&self, user_id: &str, user_name: &str, room: &RoomId) -> Result<String> {
        self.issue_at(Utc::now(), user_id, user_name, room)
    }

    fn issue_at(
        &self,
        now: DateTime<Utc>,
        user_id: &str,
        user_name: &str,
        room: &RoomId,
    ) -> Result<String> {
        let claims = CollabClaims {
            jti: uuid::Uuid::new_v4().to_string(),
            sub: user_id.to_owned(),
            name: user_name.to_owned(),
            room: room.to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(TOKEN_TTL_SECONDS)).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to sign collaboration token")
    }

    /// Verify `token` for `room`, consuming its jti.
    pub fn verify(&self, token: &str, room: &RoomId) -> Result<VerifiedUser, VerifyError> {
        let data =
            decode::<CollabClaims>(token, &self.decoding_key, &self.validation).map_err(|error| {
                match error.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => VerifyError::Expired,
                    _ => VerifyError::Invalid,
                }
            })?;
        let claims = data.claims;

        if !self.consume_jti(&claims.jti, claims.exp) {
            return Err(VerifyError::Invalid);
        }
        if claims.room != room.to_string() {
            return Err(VerifyError::RoomMismatch);
        }

        Ok(VerifiedUser {
            user_id: claims.sub,
            user_name: claims.name,
            expires_at: DateTime::from_timestamp(claims.exp, 0),
        })
    }

    /// True when the jti had not been seen before.
    fn consume_jti(&self, jti: &str, exp: i64) -> bool {
        let now = Utc::now().timestamp();
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        used.retain(|_, entry_exp| *entry_exp >= now);
        used.insert(jti.to_owned(), exp).is_none()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest<'a> {
    room_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    user_id: String,
    user_name: String,
}

/// Delegates verification to the application server's verify endpoint.
pub struct HttpVerifier {
    endpoint: Url,
    client: reqwest::Client,
}

impl HttpVerifier {
    pub fn new(endpoint: Url) -> HttpVerifier {
        HttpVerifier { endpoint, client: reqwest::Client::new() }
    }

    async fn verify(&self, token: &str, room: &RoomId) -> Result<VerifiedUser, VerifyError> {
        let room_id = room.to_string();
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(token)
            .json(&VerifyRequest { room_id: &room_id })
            .send()
            .await
            .map_err(|error| {
                tracing::warn!(%error, "token verify endpoint unreachable");
                VerifyError::Unavailable
            })?;

        match response.status() {
            reqwest::StatusCode::OK => {
                let body: VerifyResponse =
                    response.json().await.map_err(|_| VerifyError::Internal)?;
                Ok(VerifiedUser {
                    user_id: body.user_id,
                    user_name: body.user_name,
                    expires_at: None,
                })
            }
            reqwest::StatusCode::UNAUTHORIZED => Err(VerifyError::Invalid),
            reqwest::StatusCode::FORBIDDEN => Err(VerifyError::RoomMismatch),
            status => {
                tracing::warn!(%status, "token verify endpoint returned unexpected status");
                Err(VerifyError::Internal)
            }
        }
    }
}

/// Token verification backend, selected at startup.
pub enum TokenVerifier {
    /// Verify against the relay's own signing service.
    Local(Arc<CollabTokenService>),
    /// Verify against an external application server over HTTP.
    Http(HttpVerifier),
}

impl TokenVerifier {
    pub fn local(service: Arc<CollabTokenService>) -> TokenVerifier {
        TokenVerifier::Local(service)
    }

    pub fn http(endpoint: Url) -> TokenVerifier {
        TokenVerifier::Http(HttpVerifier::new(endpoint))
    }

    pub async fn verify(&self, token: &str, room: &RoomId) -> Result<VerifiedUser, VerifyError> {
        match self {
            TokenVerifier::Local(service) => service.verify(token, room),
            TokenVerifier::Http(verifier) => verifier.verify(token, room).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use cowrite_common::protocol::ResourceType;

    use super::*;

    fn service() -> CollabTokenService {
        CollabTokenService::new("unit-test-secret-0123456789-0123456789").expect("secret length ok")
    }

    fn room() -> RoomId {
        RoomId::new(ResourceType::Doc, "abc123")
    }

    #[test]
    fn issue_and_verify_round_trip() {
        let service = service();
        let token = service.issue("u1", "Ada", &room()).expect("issue");

        let user = service.verify(&token, &room()).expect("verify");
        assert_eq!(user.user_id, "u1");
        assert_eq!(user.user_name, "Ada");

        let expires_at = user.expires_at.expect("local verifier reports expiry");
        let remaining = (expires_at - Utc::now()).num_seconds();
        assert!(remaining > TOKEN_TTL_SECONDS - 5 && remaining <= TOKEN_TTL_SECONDS);
    }

    #[test]
    fn token_is_single_use() {
        let service = service();
        let token = service.issue("u1", "Ada", &room()).expect("issue");

        service.verify(&token, &room()).expect("first use succeeds");
        assert_eq!(service.verify(&token, &room()), Err(VerifyError::Invalid));
    }

    #[test]
    fn wrong_room_fails_closed_and_burns_the_jti() {
        let service = service();
        let token = service.issue("u1", "Ada", &room()).expect("issue");
        let other = RoomId::new(ResourceType::Diagram, "xyz");

        assert_eq!(service.verify(&token, &other), Err(VerifyError::RoomMismatch));
        // The mismatch consumed the jti, so the right room no longer works either.
        assert_eq!(service.verify(&token, &room()), Err(VerifyError::Invalid));
    }

    #[test]
    fn expired_token_is_rejected() {
        let service = service();
        let issued_long_ago = Utc::now() - Duration::seconds(TOKEN_TTL_SECONDS * 3);
        let token = service.issue_at(issued_long_ago, "u1", "Ada", &room()).expect("issue");

        assert_eq!(service.verify(&token, &room()), Err(VerifyError::Expired));
    }

    #[test]
    fn tampered_token_is_rejected() {
        let service = service();
        let token = service.issue("u1", "Ada", &room()).expect("issue");
        let mut tampered = token.into_bytes();
        let last = tampered.len() - 1;
        tampered[last] = if tampered[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).expect("still utf8");

        assert_eq!(service.verify(&tampered, &room()), Err(VerifyError::Invalid));
    }

    #[test]
    fn garbage_token_is_invalid() {
        assert_eq!(service().verify("not-a-jwt", &room()), Err(VerifyError::Invalid));
    }

    #[test]
    fn short_secret_is_refused() {
        assert!(CollabTokenService::new("too-short").is_err());
    }

    #[test]
    fn consumed_jti_set_prunes_expired_entries() {
        let service = service();
        let past = Utc::now().timestamp() - 10;
        let future = Utc::now().timestamp() + 60;

        assert!(service.consume_jti("old", past));
        assert!(service.consume_jti("fresh", future));
        // The expired entry was pruned while consuming "fresh".
        let used = service.used.lock().expect("lock");
        assert!(!used.contains_key("old"));
        assert!(used.contains_key("fresh"));
    }

    #[test]
    fn verify_error_codes_match_the_wire_taxonomy() {
        assert_eq!(VerifyError::Expired.code(), ErrorCode::AuthExpired);
        assert_eq!(VerifyError::Invalid.code(), ErrorCode::AuthInvalid);
        assert_eq!(VerifyError::RoomMismatch.code(), ErrorCode::AuthForbidden);
        assert_eq!(VerifyError::Unavailable.code(), ErrorCode::ServiceUnavailable);
        assert_eq!(VerifyError::Internal.code(), ErrorCode::ServerInternalError);
    }
}
