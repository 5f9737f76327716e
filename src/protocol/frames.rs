//! Frame and handshake types

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ErrorCode;

/// Any frame on the wire, discriminated by `type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req")]
    Request(RequestFrame),
    #[serde(rename = "res")]
    Response(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

impl Frame {
    /// Parse a text frame
    ///
    /// # Errors
    ///
    /// Returns error if the text is not a valid frame
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Serialize to a text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// `{type:"req", id, method, params}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// `{type:"res", id, ok, payload|error}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    #[must_use]
    pub fn ok(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    #[must_use]
    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }

    /// Whether this is the interim half of an accepted-then-final exchange
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        self.ok
            && self
                .payload
                .as_ref()
                .and_then(|p| p.get("status"))
                .and_then(Value::as_str)
                == Some("accepted")
    }
}

/// `{type:"event", event, payload, seq?, stateVersion?}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_version: Option<StateVersion>,
}

/// Staleness stamp carried by events independent of their sequence number
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVersion {
    pub presence: u64,
    pub health: u64,
}

/// Error payload of a failed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorShape {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl ErrorShape {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            retryable: matches!(code, ErrorCode::Unavailable).then_some(true),
        }
    }
}

/// Client descriptor sent in the handshake
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub version: String,
    pub platform: String,
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_identifier: Option<String>,
}

/// Bearer credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Signed device block
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuth {
    pub id: String,
    /// Raw Ed25519 public key, base64url
    pub public_key: String,
    /// Signature over the auth payload, base64url
    pub signature: String,
    pub signed_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Params of the `connect` request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<HashMap<String, bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceAuth>,
}

impl ConnectParams {
    /// Requested role, defaulting to operator
    #[must_use]
    pub fn role(&self) -> &str {
        self.role.as_deref().unwrap_or(super::DEFAULT_ROLE)
    }

    /// Whether the requested scopes include `scope` or admin
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes
            .iter()
            .any(|s| s == super::scopes::ADMIN || s == scope)
    }
}

/// Payload of a successful `connect` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    #[serde(rename = "type")]
    pub kind: String,
    pub protocol: u32,
    pub server: ServerInfo,
    #[serde(default)]
    pub features: Features,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<HelloAuth>,
    pub policy: HelloPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub version: String,
    pub host: String,
    pub conn_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Features {
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

/// Rotated device token issued on a successful handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloAuth {
    pub device_token: String,
    pub role: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub issued_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPolicy {
    pub max_payload: usize,
    pub max_buffered_bytes: usize,
    pub tick_interval_ms: u64,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_each_frame_kind() {
        let req = Frame::parse(r#"{"type":"req","id":"1","method":"health"}"#).unwrap();
        assert!(matches!(req, Frame::Request(r) if r.method == "health" && r.params.is_none()));

        let res =
            Frame::parse(r#"{"type":"res","id":"1","ok":false,"error":{"code":"TIMEOUT","message":"x"}}"#)
                .unwrap();
        let Frame::Response(res) = res else {
            panic!("expected response");
        };
        assert_eq!(res.error.unwrap().code, ErrorCode::Timeout);

        let evt = Frame::parse(r#"{"type":"event","event":"tick","payload":{"ts":1},"seq":7}"#)
            .unwrap();
        assert!(matches!(evt, Frame::Event(e) if e.seq == Some(7)));
    }

    #[test]
    fn targeted_event_omits_seq() {
        let frame = Frame::Event(EventFrame {
            event: "chat".into(),
            payload: Some(json!({})),
            seq: None,
            state_version: None,
        });
        let text = frame.to_text().unwrap();
        assert!(text.contains(r#""type":"event""#));
        assert!(!text.contains("seq"));
        assert!(!text.contains("stateVersion"));
    }

    #[test]
    fn accepted_detection() {
        let interim = ResponseFrame::ok("a", json!({"status": "accepted", "id": "x"}));
        assert!(interim.is_accepted());
        let done = ResponseFrame::ok("a", json!({"status": "ok"}));
        assert!(!done.is_accepted());
    }

    #[test]
    fn connect_params_defaults() {
        let params: ConnectParams = serde_json::from_value(json!({
            "minProtocol": 3,
            "maxProtocol": 3,
            "client": {"id": "cli", "version": "1", "platform": "linux", "mode": "cli"}
        }))
        .unwrap();
        assert_eq!(params.role(), "operator");
        assert!(params.scopes.is_empty());
        assert!(!params.has_scope("operator.read"));
    }
}
