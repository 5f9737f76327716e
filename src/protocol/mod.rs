//! Gateway wire protocol
//!
//! JSON frames exchanged over a persistent WebSocket, plus the constants both
//! sides agree on (protocol version, close codes, scopes, timing defaults)

pub mod frames;

use serde::{Deserialize, Serialize};

pub use frames::{
    ClientInfo, ConnectAuth, ConnectParams, DeviceAuth, ErrorShape, EventFrame, Features, Frame,
    HelloAuth, HelloOk, HelloPolicy, RequestFrame, ResponseFrame, ServerInfo, StateVersion,
};

/// Current protocol version spoken by this crate
pub const PROTOCOL_VERSION: u32 = 3;

/// Maximum accepted inbound frame size
pub const MAX_PAYLOAD_BYTES: usize = 512 * 1024;

/// Outbound buffer ceiling before a peer counts as a slow consumer
pub const MAX_BUFFERED_BYTES: usize = (1024 * 1024 * 3) / 2;

/// Server tick interval
pub const TICK_INTERVAL_MS: u64 = 30_000;

/// Time a peer has to complete the handshake
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Allowed clock skew on signed device payloads
pub const SIGNATURE_SKEW_MS: i64 = 10 * 60_000;

/// Default node invoke timeout
pub const DEFAULT_INVOKE_TIMEOUT_MS: u64 = 30_000;

/// Default exec approval timeout
pub const DEFAULT_APPROVAL_TIMEOUT_MS: u64 = 120_000;

/// Default role when a peer omits one
pub const DEFAULT_ROLE: &str = "operator";

/// Node role
pub const NODE_ROLE: &str = "node";

/// WebSocket close codes used by the gateway
pub mod close {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Policy violation: auth failure, pin mismatch, slow consumer
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Server restarting
    pub const SERVICE_RESTART: u16 = 1012;
    /// Heartbeat went stale
    pub const TICK_TIMEOUT: u16 = 4000;
    /// Abnormal closure (no close frame)
    pub const ABNORMAL: u16 = 1006;
}

/// Operator scopes
pub mod scopes {
    pub const ADMIN: &str = "operator.admin";
    pub const READ: &str = "operator.read";
    pub const WRITE: &str = "operator.write";
    pub const APPROVALS: &str = "operator.approvals";
    pub const PAIRING: &str = "operator.pairing";
}

/// Event names emitted by the gateway
pub mod events {
    pub const CONNECT_CHALLENGE: &str = "connect.challenge";
    pub const TICK: &str = "tick";
    pub const PRESENCE: &str = "presence";
    pub const AGENT: &str = "agent";
    pub const CHAT: &str = "chat";
    pub const NODE_INVOKE_REQUEST: &str = "node.invoke.request";
    pub const EXEC_APPROVAL_REQUESTED: &str = "exec.approval.requested";
    pub const EXEC_APPROVAL_RESOLVED: &str = "exec.approval.resolved";
    pub const DEVICE_PAIR_REQUESTED: &str = "device.pair.requested";
    pub const DEVICE_PAIR_RESOLVED: &str = "device.pair.resolved";
    pub const NODE_PAIR_REQUESTED: &str = "node.pair.requested";
    pub const NODE_PAIR_RESOLVED: &str = "node.pair.resolved";
    pub const SHUTDOWN: &str = "shutdown";
}

/// Wire error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Target peer absent
    NotConnected,
    /// No terminal response within bound
    Timeout,
    /// Transport send failed
    Unavailable,
    /// Schema or parameter validation failed
    InvalidRequest,
    /// Any code this build does not know about
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    /// Wire representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotConnected => "NOT_CONNECTED",
            Self::Timeout => "TIMEOUT",
            Self::Unavailable => "UNAVAILABLE",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current wall-clock time in milliseconds since the epoch
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_wire_names() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::NotConnected).unwrap(),
            "\"NOT_CONNECTED\""
        );
        let parsed: ErrorCode = serde_json::from_str("\"AGENT_TIMEOUT\"").unwrap();
        assert_eq!(parsed, ErrorCode::Unknown);
    }
}
