//! Node registry for tracking connected devices
//!
//! Sessions are indexed by node id and by connection id. Both maps, plus the
//! pending invoke table, live behind one lock so they are always updated
//! together.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::types::{
    NodeInvokeRequest, NodeInvokeRequestEvent, NodeInvokeResult, NodeInvokeResultParams, NodeSession,
};
use crate::broadcast::PeerHandle;
use crate::protocol::{ConnectParams, DEFAULT_INVOKE_TIMEOUT_MS, ErrorCode, events, now_ms};
use crate::{Error, Result};

struct NodeEntry {
    session: NodeSession,
    handle: PeerHandle,
}

struct PendingInvoke {
    node_id: String,
    command: String,
    tx: oneshot::Sender<NodeInvokeResult>,
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<String, NodeEntry>,
    by_conn: HashMap<String, String>,
    pending: HashMap<String, PendingInvoke>,
}

/// Registry of connected nodes
#[derive(Default)]
pub struct NodeRegistry {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("NodeRegistry")
            .field("nodes", &inner.nodes.len())
            .field("pending", &inner.pending.len())
            .finish()
    }
}

impl NodeRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node from its handshake
    ///
    /// The node id is the device id when the peer signed in with one, the
    /// client id otherwise. A node reconnecting on a new connection replaces
    /// its old session.
    pub fn register(
        &self,
        handle: PeerHandle,
        connect: &ConnectParams,
        remote_ip: Option<String>,
    ) -> NodeSession {
        let node_id = connect
            .device
            .as_ref()
            .map_or_else(|| connect.client.id.clone(), |d| d.id.clone());
        let conn_id = handle.conn_id().to_string();

        let session = NodeSession {
            node_id: node_id.clone(),
            conn_id: conn_id.clone(),
            client: connect.client.clone(),
            display_name: connect.client.display_name.clone(),
            platform: connect.client.platform.clone(),
            version: connect.client.version.clone(),
            device_family: connect.client.device_family.clone(),
            model_identifier: connect.client.model_identifier.clone(),
            remote_ip,
            caps: connect.caps.clone(),
            commands: connect.commands.clone(),
            permissions: connect.permissions.clone().unwrap_or_default(),
            path_env: connect.path_env.clone(),
            connected_at_ms: now_ms(),
        };

        let mut inner = self.inner.lock();
        if let Some(stale) = inner.nodes.get(&node_id).map(|e| e.session.conn_id.clone())
            && stale != conn_id
        {
            inner.by_conn.remove(&stale);
            tracing::info!(node_id = %node_id, stale_conn = %stale, "node reconnected, evicting stale connection");
        }
        if let Some(previous) = inner.by_conn.insert(conn_id, node_id.clone())
            && previous != node_id
        {
            inner.nodes.remove(&previous);
        }
        inner.nodes.insert(
            node_id.clone(),
            NodeEntry {
                session: session.clone(),
                handle,
            },
        );
        drop(inner);

        tracing::info!(
            node_id = %node_id,
            platform = %session.platform,
            commands = session.commands.len(),
            "node registered"
        );
        session
    }

    /// Unregister the node on `conn_id`, failing its pending invocations
    pub fn unregister(&self, conn_id: &str) -> Option<NodeSession> {
        let (session, orphaned) = {
            let mut inner = self.inner.lock();
            let node_id = inner.by_conn.remove(conn_id)?;
            let entry = inner.nodes.remove(&node_id)?;

            let ids: Vec<String> = inner
                .pending
                .iter()
                .filter(|(_, p)| p.node_id == node_id)
                .map(|(id, _)| id.clone())
                .collect();
            let orphaned: Vec<PendingInvoke> = ids
                .iter()
                .filter_map(|id| inner.pending.remove(id))
                .collect();
            (entry.session, orphaned)
        };

        if !orphaned.is_empty() {
            tracing::info!(
                node_id = %session.node_id,
                pending = orphaned.len(),
                "failing invocations of disconnected node"
            );
        }
        for pending in orphaned {
            let _ = pending
                .tx
                .send(NodeInvokeResult::failure(ErrorCode::Unavailable, "node disconnected"));
        }

        tracing::info!(node_id = %session.node_id, "node unregistered");
        Some(session)
    }

    /// Invoke a command on a node and wait for its result
    ///
    /// Never returns early without a result: absence, send failure and
    /// timeout are reported as `NOT_CONNECTED`, `UNAVAILABLE` and `TIMEOUT`.
    pub async fn invoke(&self, request: NodeInvokeRequest) -> NodeInvokeResult {
        let timeout_ms = request.timeout_ms.unwrap_or(DEFAULT_INVOKE_TIMEOUT_MS);
        let id = Uuid::new_v4().to_string();

        let (handle, rx) = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.nodes.get(&request.node_id) else {
                return NodeInvokeResult::failure(
                    ErrorCode::NotConnected,
                    format!("node not connected: {}", request.node_id),
                );
            };
            let handle = entry.handle.clone();
            let (tx, rx) = oneshot::channel();
            inner.pending.insert(
                id.clone(),
                PendingInvoke {
                    node_id: request.node_id.clone(),
                    command: request.command.clone(),
                    tx,
                },
            );
            (handle, rx)
        };

        let event = NodeInvokeRequestEvent {
            id: id.clone(),
            node_id: request.node_id.clone(),
            command: request.command.clone(),
            params_json: request.params.as_ref().map(ToString::to_string),
            timeout_ms,
            idempotency_key: request.idempotency_key,
        };
        let sent = serde_json::to_value(&event)
            .map_err(Error::from)
            .and_then(|payload| handle.send_event(events::NODE_INVOKE_REQUEST, payload));
        if let Err(e) = sent {
            self.inner.lock().pending.remove(&id);
            tracing::warn!(node_id = %request.node_id, error = %e, "failed to send node invoke");
            return NodeInvokeResult::failure(
                ErrorCode::Unavailable,
                "failed to send invoke to node",
            );
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => NodeInvokeResult::failure(ErrorCode::Unavailable, "node disconnected"),
            Err(_) => {
                self.inner.lock().pending.remove(&id);
                tracing::warn!(
                    node_id = %request.node_id,
                    command = %request.command,
                    timeout_ms,
                    "node invoke timed out"
                );
                NodeInvokeResult::failure(ErrorCode::Timeout, "node invoke timed out")
            }
        }
    }

    /// Resolve a pending invocation from a node's reply
    ///
    /// Returns false for unknown or late ids and for results claiming to come
    /// from a node other than the one invoked.
    pub fn handle_invoke_result(&self, params: NodeInvokeResultParams) -> bool {
        let pending = {
            let mut inner = self.inner.lock();
            let target = inner.pending.get(&params.id).map(|p| p.node_id.clone());
            match target {
                Some(node_id) if node_id == params.node_id => inner.pending.remove(&params.id),
                Some(node_id) => {
                    tracing::warn!(
                        invoke_id = %params.id,
                        expected = %node_id,
                        claimed = %params.node_id,
                        "ignoring invoke result from wrong node"
                    );
                    None
                }
                None => None,
            }
        };

        let Some(pending) = pending else {
            return false;
        };
        tracing::debug!(invoke_id = %params.id, command = %pending.command, ok = params.ok, "node invoke completed");
        pending.tx.send(params.into()).is_ok()
    }

    /// Get a node by ID
    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<NodeSession> {
        self.inner.lock().nodes.get(node_id).map(|e| e.session.clone())
    }

    /// Node session on a connection
    #[must_use]
    pub fn get_by_conn(&self, conn_id: &str) -> Option<NodeSession> {
        let inner = self.inner.lock();
        let node_id = inner.by_conn.get(conn_id)?;
        inner.nodes.get(node_id).map(|e| e.session.clone())
    }

    /// List all connected nodes
    #[must_use]
    pub fn list(&self) -> Vec<NodeSession> {
        let mut nodes: Vec<NodeSession> = self
            .inner
            .lock()
            .nodes
            .values()
            .map(|e| e.session.clone())
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Find a node that has the given capability
    #[must_use]
    pub fn find_by_cap(&self, cap: &str) -> Option<NodeSession> {
        self.inner
            .lock()
            .nodes
            .values()
            .find(|e| e.session.caps.iter().any(|c| c == cap))
            .map(|e| e.session.clone())
    }

    /// Find a node that supports the given command
    #[must_use]
    pub fn find_by_command(&self, command: &str) -> Option<NodeSession> {
        self.inner
            .lock()
            .nodes
            .values()
            .find(|e| e.session.commands.iter().any(|c| c == command))
            .map(|e| e.session.clone())
    }

    /// Set a node's display name
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` if the node is unknown
    pub fn rename(&self, node_id: &str, display_name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| Error::NotConnected(format!("node not connected: {node_id}")))?;
        entry.session.display_name = Some(display_name.to_string());
        Ok(())
    }

    /// Number of connected nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().nodes.is_empty()
    }

    /// Invocations awaiting a result
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Whether the node and connection indices mirror each other
    #[must_use]
    pub fn indices_consistent(&self) -> bool {
        let inner = self.inner.lock();
        inner.nodes.len() == inner.by_conn.len()
            && inner.by_conn.iter().all(|(conn_id, node_id)| {
                inner
                    .nodes
                    .get(node_id)
                    .is_some_and(|e| &e.session.conn_id == conn_id)
            })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::broadcast::Outbound;
    use crate::protocol::{ClientInfo, DeviceAuth, Frame};

    fn connect(client_id: &str, device_id: Option<&str>) -> ConnectParams {
        ConnectParams {
            client: ClientInfo {
                id: client_id.to_string(),
                display_name: Some("My MacBook".to_string()),
                version: "1.0.0".to_string(),
                platform: "darwin".to_string(),
                mode: "node".to_string(),
                ..ClientInfo::default()
            },
            caps: vec!["audio".to_string(), "display".to_string()],
            commands: vec!["system.run".to_string(), "device.info".to_string()],
            role: Some("node".to_string()),
            device: device_id.map(|id| DeviceAuth {
                id: id.to_string(),
                public_key: String::new(),
                signature: String::new(),
                signed_at: 0,
                nonce: None,
            }),
            ..ConnectParams::default()
        }
    }

    fn next_invoke(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> NodeInvokeRequestEvent {
        let Ok(Outbound::Text(text)) = rx.try_recv() else {
            panic!("expected queued invoke");
        };
        let Frame::Event(evt) = Frame::parse(&text).unwrap() else {
            panic!("expected event frame");
        };
        assert_eq!(evt.event, events::NODE_INVOKE_REQUEST);
        assert!(evt.seq.is_none());
        serde_json::from_value(evt.payload.unwrap()).unwrap()
    }

    fn result_for(evt: &NodeInvokeRequestEvent, node_id: &str, payload: serde_json::Value) -> NodeInvokeResultParams {
        NodeInvokeResultParams {
            id: evt.id.clone(),
            node_id: node_id.to_string(),
            ok: true,
            payload: Some(payload),
            payload_json: None,
            error: None,
        }
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn register_and_get() {
        let registry = NodeRegistry::new();
        let (handle, _rx) = PeerHandle::new("c1");
        let session = registry.register(handle, &connect("mac", Some("dev-1")), Some("10.0.0.2".into()));

        assert_eq!(session.node_id, "dev-1");
        let node = registry.get("dev-1").unwrap();
        assert_eq!(node.platform, "darwin");
        assert_eq!(node.remote_ip.as_deref(), Some("10.0.0.2"));
        assert_eq!(registry.get_by_conn("c1").unwrap().node_id, "dev-1");
        assert!(registry.indices_consistent());
    }

    #[test]
    fn client_id_used_without_device() {
        let registry = NodeRegistry::new();
        let (handle, _rx) = PeerHandle::new("c1");
        assert_eq!(registry.register(handle, &connect("mac", None), None).node_id, "mac");
    }

    #[test]
    fn reregister_evicts_stale_connection() {
        let registry = NodeRegistry::new();
        let (old, _old_rx) = PeerHandle::new("c1");
        let (new, _new_rx) = PeerHandle::new("c2");
        registry.register(old, &connect("mac", Some("dev-1")), None);
        registry.register(new, &connect("mac", Some("dev-1")), None);

        assert_eq!(registry.len(), 1);
        assert!(registry.get_by_conn("c1").is_none());
        assert_eq!(registry.get("dev-1").unwrap().conn_id, "c2");
        assert!(registry.indices_consistent());

        // The stale connection going away must not drop the live session
        assert!(registry.unregister("c1").is_none());
        assert!(registry.get("dev-1").is_some());
    }

    #[test]
    fn find_by_cap_and_command() {
        let registry = NodeRegistry::new();
        let (handle, _rx) = PeerHandle::new("c1");
        registry.register(handle, &connect("mac", None), None);

        assert!(registry.find_by_cap("audio").is_some());
        assert!(registry.find_by_cap("camera").is_none());
        assert!(registry.find_by_command("system.run").is_some());
        assert!(registry.find_by_command("browser.proxy").is_none());
    }

    #[test]
    fn rename_node() {
        let registry = NodeRegistry::new();
        let (handle, _rx) = PeerHandle::new("c1");
        registry.register(handle, &connect("mac", None), None);

        registry.rename("mac", "Desk").unwrap();
        assert_eq!(registry.get("mac").unwrap().display_name.as_deref(), Some("Desk"));
        assert!(matches!(registry.rename("nope", "x"), Err(Error::NotConnected(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn invoke_unknown_node_fails_immediately() {
        let registry = NodeRegistry::new();
        let started = tokio::time::Instant::now();
        let result = registry
            .invoke(NodeInvokeRequest {
                node_id: "ghost".into(),
                command: "device.info".into(),
                params: None,
                timeout_ms: Some(60_000),
                idempotency_key: None,
            })
            .await;

        assert_eq!(result.error_code(), Some(ErrorCode::NotConnected));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn invoke_round_trip() {
        let registry = std::sync::Arc::new(NodeRegistry::new());
        let (handle, mut rx) = PeerHandle::new("c1");
        registry.register(handle, &connect("mac", None), None);

        let task = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .invoke(NodeInvokeRequest {
                        node_id: "mac".into(),
                        command: "device.info".into(),
                        params: Some(json!({"verbose": true})),
                        timeout_ms: None,
                        idempotency_key: Some("k1".into()),
                    })
                    .await
            })
        };
        settle().await;

        let evt = next_invoke(&mut rx);
        assert_eq!(evt.timeout_ms, DEFAULT_INVOKE_TIMEOUT_MS);
        assert_eq!(evt.params(), json!({"verbose": true}));
        assert_eq!(evt.idempotency_key.as_deref(), Some("k1"));

        assert!(registry.handle_invoke_result(result_for(&evt, "mac", json!({"status": "done"}))));
        let result = task.await.unwrap();
        assert!(result.ok);
        assert_eq!(result.payload, Some(json!({"status": "done"})));
        assert_eq!(registry.pending_count(), 0);

        // Duplicate delivery is ignored
        assert!(!registry.handle_invoke_result(result_for(&evt, "mac", json!({}))));
    }

    #[tokio::test]
    async fn spoofed_node_result_is_rejected() {
        let registry = std::sync::Arc::new(NodeRegistry::new());
        let (handle, mut rx) = PeerHandle::new("c1");
        registry.register(handle, &connect("mac", None), None);

        let task = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .invoke(NodeInvokeRequest {
                        node_id: "mac".into(),
                        command: "device.info".into(),
                        params: None,
                        timeout_ms: Some(5_000),
                        idempotency_key: None,
                    })
                    .await
            })
        };
        settle().await;

        let evt = next_invoke(&mut rx);
        assert!(!registry.handle_invoke_result(result_for(&evt, "intruder", json!({}))));
        assert_eq!(registry.pending_count(), 1);

        assert!(registry.handle_invoke_result(result_for(&evt, "mac", json!({}))));
        assert!(task.await.unwrap().ok);
    }

    #[tokio::test(start_paused = true)]
    async fn invoke_times_out_and_late_result_is_ignored() {
        let registry = NodeRegistry::new();
        let (handle, mut rx) = PeerHandle::new("c1");
        registry.register(handle, &connect("mac", None), None);

        let result = registry
            .invoke(NodeInvokeRequest {
                node_id: "mac".into(),
                command: "device.info".into(),
                params: None,
                timeout_ms: Some(1_000),
                idempotency_key: None,
            })
            .await;

        assert_eq!(result.error_code(), Some(ErrorCode::Timeout));
        assert_eq!(registry.pending_count(), 0);

        let evt = next_invoke(&mut rx);
        assert!(!registry.handle_invoke_result(result_for(&evt, "mac", json!({}))));
    }

    #[tokio::test]
    async fn send_failure_is_unavailable() {
        let registry = NodeRegistry::new();
        let (handle, rx) = PeerHandle::new("c1");
        registry.register(handle, &connect("mac", None), None);
        drop(rx);

        let result = registry
            .invoke(NodeInvokeRequest {
                node_id: "mac".into(),
                command: "device.info".into(),
                params: None,
                timeout_ms: None,
                idempotency_key: None,
            })
            .await;
        assert_eq!(result.error_code(), Some(ErrorCode::Unavailable));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn unregister_fails_all_pending() {
        let registry = std::sync::Arc::new(NodeRegistry::new());
        let (handle, _rx) = PeerHandle::new("c1");
        registry.register(handle, &connect("mac", None), None);

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .invoke(NodeInvokeRequest {
                            node_id: "mac".into(),
                            command: "device.info".into(),
                            params: None,
                            timeout_ms: Some(60_000),
                            idempotency_key: None,
                        })
                        .await
                })
            })
            .collect();
        settle().await;
        assert_eq!(registry.pending_count(), 2);

        assert!(registry.unregister("c1").is_some());
        assert_eq!(registry.pending_count(), 0);
        assert!(registry.get("mac").is_none());
        assert!(registry.indices_consistent());

        for task in tasks {
            let result = task.await.unwrap();
            assert_eq!(result.error_code(), Some(ErrorCode::Unavailable));
            assert_eq!(result.error.unwrap().message, "node disconnected");
        }
    }

    #[tokio::test]
    async fn concurrent_invokes_resolve_independently() {
        let registry = std::sync::Arc::new(NodeRegistry::new());
        let (handle, mut rx) = PeerHandle::new("c1");
        registry.register(handle, &connect("mac", None), None);

        let spawn = |command: &str| {
            let registry = registry.clone();
            let command = command.to_string();
            tokio::spawn(async move {
                registry
                    .invoke(NodeInvokeRequest {
                        node_id: "mac".into(),
                        command,
                        params: None,
                        timeout_ms: Some(5_000),
                        idempotency_key: None,
                    })
                    .await
            })
        };
        let first = spawn("device.info");
        settle().await;
        let second = spawn("system.run");
        settle().await;

        let evt_first = next_invoke(&mut rx);
        let evt_second = next_invoke(&mut rx);
        assert_ne!(evt_first.id, evt_second.id);
        assert_eq!(registry.pending_count(), 2);

        // Answer in reverse order
        assert!(registry.handle_invoke_result(result_for(&evt_second, "mac", json!({"n": 2}))));
        assert_eq!(second.await.unwrap().payload, Some(json!({"n": 2})));
        assert_eq!(registry.pending_count(), 1);

        assert!(registry.handle_invoke_result(result_for(&evt_first, "mac", json!({"n": 1}))));
        assert_eq!(first.await.unwrap().payload, Some(json!({"n": 1})));
    }
}
