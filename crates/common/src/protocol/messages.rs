// JSON messages exchanged on the text half of a relay connection.
//
// Binary frames on the same socket carry y-protocol payloads and never reach
// these types. Error codes travel as plain strings; see `codes` for the
// severity mapping.

use serde::{Deserialize, Serialize};

use super::room::ResourceType;

/// Client -> Server messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on every connection: the one-time collaboration token.
    Auth { token: String },

    /// Mid-session token rotation, answering `TOKEN_REFRESH_REQUIRED`.
    TokenRefresh { token: String },

    /// Forces a full resync handshake.
    SyncRequest {},

    /// Workspace presence: where this user currently is in the app.
    #[serde(rename_all = "camelCase")]
    PresenceUpdate {
        current_path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        resource_type: Option<ResourceType>,
        #[serde(skip_serializing_if = "Option::is_none")]
        resource_id: Option<String>,
    },
}

/// One user's workspace presence record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceInfo {
    pub user_id: String,
    pub user_name: String,
    pub user_color: String,
    pub current_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<ResourceType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

/// Server -> Client messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication accepted; the session is live.
    #[serde(rename_all = "camelCase")]
    AuthOk { user_id: String, user_name: String },

    /// Authentication rejected; `code` is from the wire taxonomy.
    AuthError { code: String },

    /// Mid-session failure; `code` is from the wire taxonomy.
    Error { code: String },

    /// A collaborator joined this room.
    #[serde(rename_all = "camelCase")]
    UserJoined { user_id: String, user_name: String, user_color: String },

    /// A collaborator left this room.
    #[serde(rename_all = "camelCase")]
    UserLeft { user_id: String },

    /// The sync handshake finished; reports the latest durable snapshot version
    /// (0 when none has been persisted yet).
    #[serde(rename_all = "camelCase")]
    SyncComplete { snapshot_version: u64 },

    /// Authorization revoked mid-session. Terminal for the session.
    PermissionRevoked { reason: String },

    /// Relay-side health changed.
    #[serde(rename_all = "camelCase")]
    ServiceStatus {
        available: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        degraded_reason: Option<String>,
    },

    /// Full workspace-presence roster, sent on joining a presence room.
    PresenceSnapshot { users: Vec<PresenceInfo> },

    /// One user's workspace presence changed.
    PresenceChanged { user: PresenceInfo },

    /// A user left the workspace-presence room.
    #[serde(rename_all = "camelCase")]
    UserLeftPresence { user_id: String },
}

/// Strict decode of a client text frame. Callers drop the frame on error
/// instead of tearing the connection down.
pub fn decode_client(raw: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str::<ClientMessage>(raw)
}

/// Strict decode of a server text frame.
pub fn decode_server(raw: &str) -> Result<ServerMessage, serde_json::Error> {
    serde_json::from_str::<ServerMessage>(raw)
}

pub fn encode_client(message: &ClientMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

pub fn encode_server(message: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    fn shape_of(value: &Value) -> Vec<&str> {
        value.as_object().expect("message should be a json object").keys().map(String::as_str).collect()
    }

    #[test]
    fn client_messages_serialize_with_snake_case_tags_and_camel_case_fields() {
        let samples = [
            (ClientMessage::Auth { token: "tok".into() }, "auth", vec!["type", "token"]),
            (
                ClientMessage::TokenRefresh { token: "tok2".into() },
                "token_refresh",
                vec!["type", "token"],
            ),
            (ClientMessage::SyncRequest {}, "sync_request", vec!["type"]),
            (
                ClientMessage::PresenceUpdate {
                    current_path: "/boards/7".into(),
                    resource_type: Some(ResourceType::Diagram),
                    resource_id: Some("7".into()),
                },
                "presence_update",
                vec!["type", "currentPath", "resourceType", "resourceId"],
            ),
        ];

        for (message, tag, fields) in samples {
            let value = serde_json::to_value(&message).expect("client message should serialize");
            assert_eq!(value["type"], tag);
            let mut keys = shape_of(&value);
            keys.sort_unstable();
            let mut expected = fields.clone();
            expected.sort_unstable();
            assert_eq!(keys, expected, "field shape for {tag}");

            let back = decode_client(&value.to_string()).expect("round trip should decode");
            assert_eq!(back, message);
        }
    }

    #[test]
    fn optional_presence_fields_are_omitted_when_absent() {
        let message = ClientMessage::PresenceUpdate {
            current_path: "/home".into(),
            resource_type: None,
            resource_id: None,
        };
        let value = serde_json::to_value(&message).expect("presence update should serialize");
        assert_eq!(shape_of(&value), vec!["type", "currentPath"]);
    }

    #[test]
    fn server_messages_round_trip() {
        let samples = [
            ServerMessage::AuthOk { user_id: "u1".into(), user_name: "Ada".into() },
            ServerMessage::AuthError { code: "AUTH_EXPIRED".into() },
            ServerMessage::Error { code: "TOKEN_REFRESH_REQUIRED".into() },
            ServerMessage::UserJoined {
                user_id: "u2".into(),
                user_name: "Grace".into(),
                user_color: "#22c1a0".into(),
            },
            ServerMessage::UserLeft { user_id: "u2".into() },
            ServerMessage::SyncComplete { snapshot_version: 12 },
            ServerMessage::PermissionRevoked { reason: "membership removed".into() },
            ServerMessage::ServiceStatus { available: true, degraded_reason: None },
            ServerMessage::PresenceSnapshot {
                users: vec![PresenceInfo {
                    user_id: "u1".into(),
                    user_name: "Ada".into(),
                    user_color: "#22c1a0".into(),
                    current_path: "/docs/readme".into(),
                    resource_type: Some(ResourceType::Doc),
                    resource_id: Some("readme".into()),
                }],
            },
            ServerMessage::UserLeftPresence { user_id: "u1".into() },
        ];

        for message in samples {
            let raw = encode_server(&message).expect("server message should serialize");
            let back = decode_server(&raw).expect("server message should decode");
            assert_eq!(back, message);
        }
    }

    #[test]
    fn server_payload_fields_are_camel_case() {
        let value = serde_json::to_value(ServerMessage::SyncComplete { snapshot_version: 3 })
            .expect("sync_complete should serialize");
        assert_eq!(value, json!({"type": "sync_complete", "snapshotVersion": 3}));

        let value = serde_json::to_value(ServerMessage::ServiceStatus {
            available: false,
            degraded_reason: Some("datastore unreachable".into()),
        })
        .expect("service_status should serialize");
        assert_eq!(
            value,
            json!({
                "type": "service_status",
                "available": false,
                "degradedReason": "datastore unreachable"
            })
        );
    }

    #[test]
    fn unknown_discriminants_and_missing_fields_are_rejected() {
        assert!(decode_client(r#"{"type":"launch_missiles"}"#).is_err());
        assert!(decode_client(r#"{"type":"auth"}"#).is_err());
        assert!(decode_client(r#"{"type":"presence_update","resourceId":"7"}"#).is_err());
        assert!(decode_server(r#"{"type":"sync_complete"}"#).is_err());
        assert!(decode_server("not json at all").is_err());
    }

    #[test]
    fn unrecognized_error_code_strings_still_decode() {
        let message = decode_server(r#"{"type":"error","code":"BRAND_NEW_FAILURE"}"#)
            .expect("unknown code strings are a severity concern, not a decode failure");
        assert_eq!(message, ServerMessage::Error { code: "BRAND_NEW_FAILURE".into() });
    }
}
