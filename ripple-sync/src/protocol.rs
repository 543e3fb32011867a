//! Wire protocol for push/pull synchronization.
//!
//! Two encodings share one set of request/response types:
//!
//! - HTTP carries the JSON bodies directly (`PushRequest`, `PullRequest`,
//!   `PullResponse`).
//! - The live WebSocket channel carries a bincode-encoded [`SocketMessage`]
//!   envelope whose payload is the serde_json-encoded body:
//!
//! ```text
//! ┌──────────┬───────────┬──────────────┬──────────┐
//! │ msg_type │ client_id │ document_id  │ payload  │
//! │ 1 byte   │ variable  │ variable     │ variable │
//! └──────────┴───────────┴──────────────┴──────────┘
//! ```
//!
//! JSON payloads ride inside `Vec<u8>` because `serde_json::Value` needs a
//! self-describing format and the envelope does not.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single client-submitted mutation.
///
/// `id` is the client-local sequence number and the idempotency key: the
/// server applies each id at most once per client. `name` selects the
/// registered mutator; `args` is an opaque JSON payload interpreted by it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mutation {
    pub id: u64,
    pub name: String,
    pub args: Value,
}

/// Body of `POST /push?docID=...` and of `PushReq` socket frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushRequest {
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub mutations: Vec<Mutation>,
}

/// Body of `POST /pull?docID=...` and of `PullReq` socket frames.
///
/// `cookie` is the checkpoint returned by the previous pull, or null for a
/// client that has never synced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PullRequest {
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(default)]
    pub cookie: Option<String>,
}

/// One patch operation in a pull response.
///
/// Applying the full patch to a replica that was exactly at the request
/// cookie yields the document state at the response cookie.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Put { key: String, value: Value },
    Del { key: String },
}

impl PatchOp {
    /// The key this operation targets.
    pub fn key(&self) -> &str {
        match self {
            PatchOp::Put { key, .. } => key,
            PatchOp::Del { key } => key,
        }
    }
}

/// Response body for a pull.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PullResponse {
    pub cookie: Option<String>,
    #[serde(rename = "lastMutationID")]
    pub last_mutation_id: u64,
    pub patch: Vec<PatchOp>,
}

// ─── Cookie encoding ──────────────────────────────────────────────────

/// Parse a wire cookie into a store version.
///
/// Null and empty cookies mean "beginning of time" (version 0). Anything
/// else must be the decimal version a previous pull handed out.
pub fn parse_cookie(cookie: Option<&str>) -> Result<u64, ProtocolError> {
    match cookie {
        None | Some("") => Ok(0),
        Some(s) => s
            .parse::<u64>()
            .map_err(|_| ProtocolError::InvalidCookie(s.to_string())),
    }
}

/// Encode a store version as a wire cookie.
///
/// Version 0 is the empty-document sentinel and serializes as null.
pub fn format_cookie(version: u64) -> Option<String> {
    if version == 0 {
        None
    } else {
        Some(version.to_string())
    }
}

// ─── Socket envelope ──────────────────────────────────────────────────

/// Frame types on the live WebSocket channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client mirrors a push request over the socket
    PushReq = 1,
    /// Client mirrors a pull request over the socket
    PullReq = 2,
    /// Server answers a socket pull
    PullResp = 3,
    /// Content-free "something changed, re-pull" signal
    Poke = 4,
    /// Heartbeat ping
    Ping = 5,
    /// Heartbeat pong
    Pong = 6,
}

/// Top-level socket frame, bincode-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketMessage {
    pub msg_type: MessageType,
    pub client_id: String,
    pub document_id: String,
    /// serde_json-encoded body (empty for poke/ping/pong)
    pub payload: Vec<u8>,
}

impl SocketMessage {
    /// Create a push request frame.
    pub fn push_req(document_id: impl Into<String>, req: &PushRequest) -> Self {
        Self {
            msg_type: MessageType::PushReq,
            client_id: req.client_id.clone(),
            document_id: document_id.into(),
            payload: serde_json::to_vec(req).unwrap_or_default(),
        }
    }

    /// Create a pull request frame.
    pub fn pull_req(document_id: impl Into<String>, req: &PullRequest) -> Self {
        Self {
            msg_type: MessageType::PullReq,
            client_id: req.client_id.clone(),
            document_id: document_id.into(),
            payload: serde_json::to_vec(req).unwrap_or_default(),
        }
    }

    /// Create a pull response frame.
    pub fn pull_resp(
        client_id: impl Into<String>,
        document_id: impl Into<String>,
        resp: &PullResponse,
    ) -> Self {
        Self {
            msg_type: MessageType::PullResp,
            client_id: client_id.into(),
            document_id: document_id.into(),
            payload: serde_json::to_vec(resp).unwrap_or_default(),
        }
    }

    /// Create a poke frame. Pokes carry no state — the empty payload is the
    /// whole message.
    pub fn poke(document_id: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::Poke,
            client_id: String::new(),
            document_id: document_id.into(),
            payload: Vec::new(),
        }
    }

    /// Create a ping frame.
    pub fn ping(client_id: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::Ping,
            client_id: client_id.into(),
            document_id: String::new(),
            payload: Vec::new(),
        }
    }

    /// Create a pong frame.
    pub fn pong(client_id: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::Pong,
            client_id: client_id.into(),
            document_id: String::new(),
            payload: Vec::new(),
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the payload of a `PushReq` frame.
    pub fn push_request(&self) -> Result<PushRequest, ProtocolError> {
        if self.msg_type != MessageType::PushReq {
            return Err(ProtocolError::InvalidMessageType);
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Parse the payload of a `PullReq` frame.
    pub fn pull_request(&self) -> Result<PullRequest, ProtocolError> {
        if self.msg_type != MessageType::PullReq {
            return Err(ProtocolError::InvalidMessageType);
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Parse the payload of a `PullResp` frame.
    pub fn pull_response(&self) -> Result<PullResponse, ProtocolError> {
        if self.msg_type != MessageType::PullResp {
            return Err(ProtocolError::InvalidMessageType);
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    InvalidCookie(String),
    InvalidMessageType,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidCookie(c) => write!(f, "Invalid cookie: {c:?}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_push_request_json_shape() {
        let req = PushRequest {
            client_id: "c1".into(),
            mutations: vec![Mutation {
                id: 1,
                name: "put".into(),
                args: json!({"key": "x", "value": 1}),
            }],
        };

        let encoded = serde_json::to_value(&req).unwrap();
        assert_eq!(
            encoded,
            json!({
                "clientID": "c1",
                "mutations": [{"id": 1, "name": "put", "args": {"key": "x", "value": 1}}]
            })
        );

        let decoded: PushRequest = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_pull_request_cookie_defaults_to_null() {
        let decoded: PullRequest = serde_json::from_value(json!({"clientID": "c1"})).unwrap();
        assert_eq!(decoded.cookie, None);

        let decoded: PullRequest =
            serde_json::from_value(json!({"clientID": "c1", "cookie": null})).unwrap();
        assert_eq!(decoded.cookie, None);

        let decoded: PullRequest =
            serde_json::from_value(json!({"clientID": "c1", "cookie": "17"})).unwrap();
        assert_eq!(decoded.cookie, Some("17".into()));
    }

    #[test]
    fn test_pull_response_json_shape() {
        let resp = PullResponse {
            cookie: Some("5".into()),
            last_mutation_id: 3,
            patch: vec![
                PatchOp::Put {
                    key: "x".into(),
                    value: json!(1),
                },
                PatchOp::Del { key: "y".into() },
            ],
        };

        let encoded = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            encoded,
            json!({
                "cookie": "5",
                "lastMutationID": 3,
                "patch": [
                    {"op": "put", "key": "x", "value": 1},
                    {"op": "del", "key": "y"}
                ]
            })
        );
    }

    #[test]
    fn test_patch_op_key() {
        let put = PatchOp::Put {
            key: "a".into(),
            value: json!(null),
        };
        let del = PatchOp::Del { key: "b".into() };
        assert_eq!(put.key(), "a");
        assert_eq!(del.key(), "b");
    }

    #[test]
    fn test_parse_cookie() {
        assert_eq!(parse_cookie(None).unwrap(), 0);
        assert_eq!(parse_cookie(Some("")).unwrap(), 0);
        assert_eq!(parse_cookie(Some("42")).unwrap(), 42);
        assert!(parse_cookie(Some("not-a-number")).is_err());
        assert!(parse_cookie(Some("-3")).is_err());
    }

    #[test]
    fn test_format_cookie() {
        assert_eq!(format_cookie(0), None);
        assert_eq!(format_cookie(7), Some("7".into()));
    }

    #[test]
    fn test_cookie_roundtrip() {
        for v in [1u64, 17, u64::MAX] {
            let wire = format_cookie(v).unwrap();
            assert_eq!(parse_cookie(Some(&wire)).unwrap(), v);
        }
    }

    #[test]
    fn test_socket_push_roundtrip() {
        let req = PushRequest {
            client_id: "c1".into(),
            mutations: vec![Mutation {
                id: 9,
                name: "del".into(),
                args: json!({"key": "gone"}),
            }],
        };

        let msg = SocketMessage::push_req("doc-1", &req);
        let bytes = msg.encode().unwrap();
        let decoded = SocketMessage::decode(&bytes).unwrap();

        assert_eq!(decoded.msg_type, MessageType::PushReq);
        assert_eq!(decoded.client_id, "c1");
        assert_eq!(decoded.document_id, "doc-1");
        assert_eq!(decoded.push_request().unwrap(), req);
    }

    #[test]
    fn test_socket_pull_roundtrip() {
        let req = PullRequest {
            client_id: "c2".into(),
            cookie: Some("3".into()),
        };
        let msg = SocketMessage::pull_req("doc-1", &req);
        let decoded = SocketMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.pull_request().unwrap(), req);

        let resp = PullResponse {
            cookie: Some("4".into()),
            last_mutation_id: 2,
            patch: vec![PatchOp::Del { key: "x".into() }],
        };
        let msg = SocketMessage::pull_resp("c2", "doc-1", &resp);
        let decoded = SocketMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.pull_response().unwrap(), resp);
    }

    #[test]
    fn test_poke_is_content_free() {
        let msg = SocketMessage::poke("doc-1");
        assert!(msg.payload.is_empty());

        let decoded = SocketMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Poke);
        assert_eq!(decoded.document_id, "doc-1");
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_ping_pong_roundtrip() {
        let ping = SocketMessage::ping("c1");
        let pong = SocketMessage::pong("c1");

        let decoded_ping = SocketMessage::decode(&ping.encode().unwrap()).unwrap();
        let decoded_pong = SocketMessage::decode(&pong.encode().unwrap()).unwrap();

        assert_eq!(decoded_ping.msg_type, MessageType::Ping);
        assert_eq!(decoded_pong.msg_type, MessageType::Pong);
    }

    #[test]
    fn test_payload_accessor_rejects_wrong_type() {
        let msg = SocketMessage::poke("doc-1");
        assert!(msg.push_request().is_err());
        assert!(msg.pull_request().is_err());
        assert!(msg.pull_response().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SocketMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_malformed_payload_is_an_error_not_a_panic() {
        let mut msg = SocketMessage::push_req(
            "doc-1",
            &PushRequest {
                client_id: "c1".into(),
                mutations: vec![],
            },
        );
        msg.payload = b"{not json".to_vec();
        assert!(msg.push_request().is_err());
    }
}
