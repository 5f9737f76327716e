//! RPC methods served over an authenticated connection

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};

use super::GatewayState;
use crate::approvals::{ExecApprovalDecision, ExecApprovalRequest};
use crate::broadcast::{BroadcastOpts, ConnectedPeer};
use crate::nodes::{NodeInvokeRequest, NodeInvokeResultParams};
use crate::protocol::{
    DEFAULT_APPROVAL_TIMEOUT_MS, DEFAULT_ROLE, ErrorCode, Frame, NODE_ROLE, RequestFrame, ResponseFrame,
    events, now_ms, scopes,
};
use crate::{Error, Result};

const NODE_METHODS: &[&str] = &["node.invoke.result"];

const READ_METHODS: &[&str] = &["health", "node.list", "chat.subscribe", "chat.unsubscribe"];

const WRITE_METHODS: &[&str] = &["node.invoke", "chat.abort"];

const APPROVAL_METHODS: &[&str] = &["exec.approval.request", "exec.approval.resolve"];

const PAIRING_METHODS: &[&str] = &["node.rename"];

/// Every method this gateway serves, advertised in hello-ok
#[must_use]
pub fn method_names() -> Vec<String> {
    [NODE_METHODS, READ_METHODS, WRITE_METHODS, APPROVAL_METHODS, PAIRING_METHODS]
        .concat()
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Events this gateway emits, advertised in hello-ok
#[must_use]
pub fn event_names() -> Vec<String> {
    [
        events::CONNECT_CHALLENGE,
        events::TICK,
        events::PRESENCE,
        events::AGENT,
        events::CHAT,
        events::NODE_INVOKE_REQUEST,
        events::EXEC_APPROVAL_REQUESTED,
        events::EXEC_APPROVAL_RESOLVED,
        events::SHUTDOWN,
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn is_in(method: &str, list: &[&str]) -> bool {
    list.contains(&method)
}

/// Check role and scopes for a method
///
/// # Errors
///
/// Returns `InvalidRequest` naming the missing role or scope
pub fn authorize_method(method: &str, role: &str, granted: &[String]) -> Result<()> {
    if is_in(method, NODE_METHODS) {
        if role == NODE_ROLE {
            return Ok(());
        }
        return Err(Error::InvalidRequest(format!("unauthorized role: {role}")));
    }
    if role != DEFAULT_ROLE {
        return Err(Error::InvalidRequest(format!("unauthorized role: {role}")));
    }

    let has = |scope: &str| granted.iter().any(|s| s == scope);
    if has(scopes::ADMIN) {
        return Ok(());
    }

    let missing = if is_in(method, APPROVAL_METHODS) {
        (!has(scopes::APPROVALS)).then_some(scopes::APPROVALS)
    } else if is_in(method, PAIRING_METHODS) {
        (!has(scopes::PAIRING)).then_some(scopes::PAIRING)
    } else if is_in(method, READ_METHODS) {
        (!(has(scopes::READ) || has(scopes::WRITE))).then_some(scopes::READ)
    } else if is_in(method, WRITE_METHODS) {
        (!has(scopes::WRITE)).then_some(scopes::WRITE)
    } else {
        Some(scopes::ADMIN)
    };

    match missing {
        Some(scope) => Err(Error::InvalidRequest(format!("missing scope: {scope}"))),
        None => Ok(()),
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| Error::InvalidRequest(format!("invalid params: {e}")))
}

/// Handle one request and send its response to `peer`
pub async fn dispatch(state: Arc<GatewayState>, peer: Arc<ConnectedPeer>, request: RequestFrame) {
    let id = request.id.clone();
    let method = request.method.clone();

    let outcome = match authorize_method(&method, peer.role(), &peer.connect.scopes) {
        Ok(()) => handle(&state, &peer, request).await,
        Err(e) => Err(e),
    };

    let response = match outcome {
        Ok(payload) => ResponseFrame::ok(id, payload),
        Err(e) => {
            tracing::debug!(conn_id = %peer.conn_id, method = %method, error = %e, "request failed");
            ResponseFrame::err(id, e.to_shape())
        }
    };
    if let Err(e) = peer.handle.send_frame(&Frame::Response(response)) {
        tracing::debug!(conn_id = %peer.conn_id, error = %e, "dropping response for closed connection");
    }
}

async fn handle(state: &GatewayState, peer: &ConnectedPeer, request: RequestFrame) -> Result<Value> {
    match request.method.as_str() {
        "health" => Ok(health(state)),
        "node.list" => Ok(json!({ "ts": now_ms(), "nodes": state.nodes.list() })),
        "node.invoke" => node_invoke(state, parse(request.params)?).await,
        "node.invoke.result" => Ok(node_invoke_result(state, peer, parse(request.params)?)),
        "node.rename" => node_rename(state, parse(request.params)?),
        "chat.subscribe" => {
            let params: SessionParams = parse(request.params)?;
            state.broadcaster.subscribe_session(&peer.conn_id, &params.session_key);
            Ok(json!({ "subscribed": true, "sessionKey": params.session_key }))
        }
        "chat.unsubscribe" => {
            let params: SessionParams = parse(request.params)?;
            state.broadcaster.unsubscribe_session(&peer.conn_id, &params.session_key);
            Ok(json!({ "subscribed": false, "sessionKey": params.session_key }))
        }
        "chat.abort" => Ok(chat_abort(state, parse(request.params)?)),
        "exec.approval.request" => approval_request(state, peer, &request.id, parse(request.params)?).await,
        "exec.approval.resolve" => Ok(approval_resolve(state, peer, parse(request.params)?)),
        other => Err(Error::InvalidRequest(format!("unknown method: {other}"))),
    }
}

fn health(state: &GatewayState) -> Value {
    json!({
        "ok": true,
        "ts": now_ms(),
        "uptimeMs": now_ms() - state.started_at_ms,
        "connections": state.broadcaster.len(),
        "nodes": state.nodes.len(),
        "activeChatRuns": state.chat.active_count(),
        "pendingApprovals": state.approvals.pending_count(),
        "stateVersion": state.broadcaster.state_version(),
    })
}

async fn node_invoke(state: &GatewayState, request: NodeInvokeRequest) -> Result<Value> {
    let Some(node) = state.nodes.get(&request.node_id) else {
        return Err(Error::NotConnected(format!("node not connected: {}", request.node_id)));
    };
    if !state.node_policy.is_allowed(&node, &request.command) {
        return Err(Error::InvalidRequest(format!(
            "command not allowed on {}: {}",
            node.platform, request.command
        )));
    }

    let node_id = request.node_id.clone();
    let command = request.command.clone();
    let result = state.nodes.invoke(request).await;
    if result.ok {
        Ok(json!({
            "ok": true,
            "nodeId": node_id,
            "command": command,
            "payload": result.payload,
            "payloadJSON": result.payload_json,
        }))
    } else {
        let shape = result
            .error
            .unwrap_or_else(|| crate::protocol::ErrorShape::new(ErrorCode::Unavailable, "node invoke failed"));
        Err(Error::from(shape))
    }
}

fn node_invoke_result(state: &GatewayState, peer: &ConnectedPeer, params: NodeInvokeResultParams) -> Value {
    let caller = state.nodes.get_by_conn(&peer.conn_id).map(|n| n.node_id);
    if caller.as_deref() != Some(params.node_id.as_str()) {
        tracing::warn!(conn_id = %peer.conn_id, claimed = %params.node_id, "invoke result from unexpected node");
        return json!({ "ok": true, "ignored": true });
    }
    if state.nodes.handle_invoke_result(params) {
        json!({ "ok": true })
    } else {
        json!({ "ok": true, "ignored": true })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameParams {
    node_id: String,
    display_name: String,
}

fn node_rename(state: &GatewayState, params: RenameParams) -> Result<Value> {
    let display_name = params.display_name.trim();
    if display_name.is_empty() {
        return Err(Error::InvalidRequest("displayName required".to_string()));
    }
    state.nodes.rename(&params.node_id, display_name)?;
    state.broadcaster.broadcast(
        events::PRESENCE,
        json!({ "nodes": state.nodes.list() }),
        BroadcastOpts {
            drop_if_slow: true,
            state_version: Some(state.broadcaster.bump_presence()),
        },
    );
    Ok(json!({ "nodeId": params.node_id, "displayName": display_name }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionParams {
    session_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AbortParams {
    session_key: String,
    #[serde(default)]
    run_id: Option<String>,
}

fn chat_abort(state: &GatewayState, params: AbortParams) -> Value {
    let now = now_ms();
    let run_ids = match &params.run_id {
        Some(run_id) => {
            let outcome = state.chat.abort_by_id(run_id, &params.session_key, Some("rpc"), now);
            if outcome.aborted { vec![run_id.clone()] } else { Vec::new() }
        }
        None => state
            .chat
            .abort_all_for_session(&params.session_key, Some("rpc"), now),
    };
    json!({ "ok": true, "aborted": !run_ids.is_empty(), "runIds": run_ids })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApprovalRequestParams {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    /// Answer `{status:"accepted"}` first, then the decision
    #[serde(default)]
    two_phase: bool,
    #[serde(flatten)]
    request: ExecApprovalRequest,
}

async fn approval_request(
    state: &GatewayState,
    peer: &ConnectedPeer,
    request_id: &str,
    params: ApprovalRequestParams,
) -> Result<Value> {
    if params.request.command.trim().is_empty() {
        return Err(Error::InvalidRequest("command required".to_string()));
    }
    let record = state.approvals.create(
        params.request,
        params.timeout_ms.unwrap_or(DEFAULT_APPROVAL_TIMEOUT_MS),
        params.id,
    );
    let id = record.id.clone();
    let created_at_ms = record.created_at_ms;
    let expires_at_ms = record.expires_at_ms;
    let requested = serde_json::to_value(&record)?;

    // Resolvable before anyone can hear about it
    let rx = state.approvals.register(record)?;

    state.broadcaster.broadcast(
        events::EXEC_APPROVAL_REQUESTED,
        requested,
        BroadcastOpts::default(),
    );

    if params.two_phase {
        let accepted = ResponseFrame::ok(
            request_id,
            json!({ "status": "accepted", "id": id, "createdAtMs": created_at_ms, "expiresAtMs": expires_at_ms }),
        );
        if let Err(e) = peer.handle.send_frame(&Frame::Response(accepted)) {
            state.approvals.cancel(&id);
            return Err(e);
        }
    }

    let decision = state.approvals.wait(&id, expires_at_ms, rx).await;
    Ok(json!({ "id": id, "decision": decision, "expiresAtMs": expires_at_ms }))
}

#[derive(Debug, Deserialize)]
struct ResolveParams {
    id: String,
    decision: ExecApprovalDecision,
}

fn approval_resolve(state: &GatewayState, peer: &ConnectedPeer, params: ResolveParams) -> Value {
    let resolved_by = peer
        .connect
        .client
        .display_name
        .as_deref()
        .unwrap_or(&peer.connect.client.id);
    let resolved = state
        .approvals
        .resolve(&params.id, params.decision, Some(resolved_by));
    if resolved {
        state.broadcaster.broadcast(
            events::EXEC_APPROVAL_RESOLVED,
            json!({
                "id": params.id,
                "decision": params.decision,
                "resolvedBy": resolved_by,
                "ts": now_ms(),
            }),
            BroadcastOpts::default(),
        );
    }
    json!({ "ok": true, "resolved": resolved })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn granted(scopes: &[&str]) -> Vec<String> {
        scopes.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn node_methods_need_node_role() {
        assert!(authorize_method("node.invoke.result", "node", &[]).is_ok());
        assert!(authorize_method("node.invoke.result", "operator", &granted(&["operator.admin"])).is_err());
        assert!(authorize_method("health", "node", &[]).is_err());
    }

    #[test]
    fn operator_scopes_gate_methods() {
        let read = granted(&["operator.read"]);
        assert!(authorize_method("health", "operator", &read).is_ok());
        assert!(authorize_method("node.invoke", "operator", &read).is_err());
        assert!(authorize_method("exec.approval.resolve", "operator", &read).is_err());

        let write = granted(&["operator.write"]);
        assert!(authorize_method("node.list", "operator", &write).is_ok());
        assert!(authorize_method("node.invoke", "operator", &write).is_ok());

        let approvals = granted(&["operator.approvals"]);
        assert!(authorize_method("exec.approval.request", "operator", &approvals).is_ok());
        assert!(authorize_method("node.rename", "operator", &approvals).is_err());
    }

    #[test]
    fn admin_passes_everything_for_operators() {
        let admin = granted(&["operator.admin"]);
        for method in method_names() {
            if method == "node.invoke.result" {
                continue;
            }
            assert!(authorize_method(&method, "operator", &admin).is_ok(), "{method}");
        }
        assert!(authorize_method("made.up", "operator", &admin).is_ok());
    }

    #[test]
    fn unknown_method_needs_admin() {
        let err = authorize_method("made.up", "operator", &granted(&["operator.write"])).unwrap_err();
        assert!(err.to_string().contains("operator.admin"));
    }

    #[test]
    fn approval_params_flatten_request() {
        let params: ApprovalRequestParams = serde_json::from_value(json!({
            "id": "a1",
            "command": "rm -rf /tmp/x",
            "cwd": "/tmp",
            "twoPhase": true,
            "timeoutMs": 5000
        }))
        .unwrap();
        assert!(params.two_phase);
        assert_eq!(params.timeout_ms, Some(5000));
        assert_eq!(params.request.command, "rm -rf /tmp/x");
        assert_eq!(params.request.cwd.as_deref(), Some("/tmp"));
    }
}
