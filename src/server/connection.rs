//! WebSocket connection handler: challenge, handshake, request loop

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{GatewayState, authenticate, methods};
use crate::broadcast::{BroadcastOpts, ConnectedPeer, Outbound, PeerHandle};
use crate::protocol::{
    ConnectParams, ErrorCode, ErrorShape, Features, Frame, HelloOk, HelloPolicy, MAX_PAYLOAD_BYTES,
    NODE_ROLE, PROTOCOL_VERSION, RequestFrame, ResponseFrame, ServerInfo, close, events, now_ms,
};
use crate::{Error, Result};

/// Handle WebSocket upgrade request
pub(super) async fn ws_upgrade(
    State(state): State<Arc<GatewayState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(MAX_PAYLOAD_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state, remote))
}

async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>, remote: SocketAddr) {
    let conn_id = Uuid::new_v4().to_string();
    let (handle, outbound) = PeerHandle::new(conn_id.clone());
    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, outbound, handle.clone()));

    tracing::debug!(conn_id = %conn_id, remote = %remote, "connection opened");

    let peer = match handshake(&state, &handle, &mut stream, remote).await {
        Ok(peer) => peer,
        Err(e) => {
            tracing::warn!(conn_id = %conn_id, remote = %remote, error = %e, "handshake rejected");
            handle.close(close::POLICY_VIOLATION, &e.to_string());
            drop(handle);
            let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
            return;
        }
    };

    read_loop(&state, &peer, &mut stream).await;

    if let Some(node) = state.nodes.unregister(&conn_id) {
        tracing::info!(node_id = %node.node_id, "node disconnected");
    }
    state.broadcaster.remove(&conn_id);
    announce_presence(&state);
    tracing::info!(conn_id = %conn_id, role = %peer.role(), "connection closed");

    writer.abort();
}

/// Drain the peer's outbound queue into the socket
async fn write_loop(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    handle: PeerHandle,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Text(text) => {
                let len = text.len();
                let sent = sink.send(Message::Text(text.into())).await;
                handle.mark_flushed(len);
                if sent.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

/// Challenge the peer and verify its `connect` request
async fn handshake(
    state: &GatewayState,
    handle: &PeerHandle,
    stream: &mut SplitStream<WebSocket>,
    remote: SocketAddr,
) -> Result<Arc<ConnectedPeer>> {
    let nonce = Uuid::new_v4().to_string();
    handle.send_event(events::CONNECT_CHALLENGE, json!({ "nonce": nonce, "ts": now_ms() }))?;

    let limit = Duration::from_millis(state.config.handshake_timeout_ms);
    let request = tokio::time::timeout(limit, next_request(stream))
        .await
        .map_err(|_| Error::Timeout("handshake timeout".to_string()))??;

    if request.method != "connect" {
        let error = Error::InvalidRequest("first request must be connect".to_string());
        reject(handle, &request.id, &error);
        return Err(error);
    }

    let params: ConnectParams = match serde_json::from_value(request.params.clone().unwrap_or_default()) {
        Ok(params) => params,
        Err(e) => {
            let error = Error::InvalidRequest(format!("invalid connect params: {e}"));
            reject(handle, &request.id, &error);
            return Err(error);
        }
    };

    let verified = match authenticate(
        &params,
        &nonce,
        remote.ip().is_loopback(),
        &state.shared_auth,
        &state.device_tokens,
    ) {
        Ok(verified) => verified,
        Err(e) => {
            reject(handle, &request.id, &e);
            return Err(e);
        }
    };

    let auth = verified
        .device_id
        .as_deref()
        .map(|device_id| state.device_tokens.rotate(device_id, &verified.role, &params.scopes));

    let peer = state.broadcaster.add(ConnectedPeer {
        conn_id: handle.conn_id().to_string(),
        connect: params,
        handle: handle.clone(),
        remote_addr: Some(remote.to_string()),
        connected_at_ms: now_ms(),
    });
    if verified.role == NODE_ROLE {
        state
            .nodes
            .register(handle.clone(), &peer.connect, Some(remote.ip().to_string()));
    }

    let hello = HelloOk {
        kind: "hello-ok".to_string(),
        protocol: PROTOCOL_VERSION,
        server: ServerInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            host: state.host.clone(),
            conn_id: peer.conn_id.clone(),
        },
        features: Features {
            methods: methods::method_names(),
            events: methods::event_names(),
        },
        auth,
        policy: HelloPolicy {
            max_payload: MAX_PAYLOAD_BYTES,
            max_buffered_bytes: state.config.max_buffered_bytes,
            tick_interval_ms: state.config.tick_interval_ms,
        },
    };
    handle.send_frame(&Frame::Response(ResponseFrame::ok(
        request.id,
        serde_json::to_value(&hello)?,
    )))?;

    tracing::info!(
        conn_id = %peer.conn_id,
        client = %peer.connect.client.id,
        role = %verified.role,
        device_id = verified.device_id.as_deref().unwrap_or("-"),
        "peer connected"
    );
    announce_presence(state);
    Ok(peer)
}

/// Wait for the first request frame, skipping control frames
async fn next_request(stream: &mut SplitStream<WebSocket>) -> Result<RequestFrame> {
    while let Some(msg) = stream.next().await {
        let msg = msg.map_err(|e| Error::Transport(e.to_string()))?;
        match msg {
            Message::Text(text) => {
                return match Frame::parse(text.as_str()) {
                    Ok(Frame::Request(request)) => Ok(request),
                    Ok(_) => Err(Error::InvalidRequest("expected a request frame".to_string())),
                    Err(e) => Err(Error::InvalidRequest(format!("invalid frame: {e}"))),
                };
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(Error::Unavailable("connection closed before handshake".to_string()))
}

fn reject(handle: &PeerHandle, request_id: &str, error: &Error) {
    let _ = handle.send_frame(&Frame::Response(ResponseFrame::err(request_id, error.to_shape())));
}

/// Serve requests until the socket closes
async fn read_loop(state: &Arc<GatewayState>, peer: &Arc<ConnectedPeer>, stream: &mut SplitStream<WebSocket>) {
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(conn_id = %peer.conn_id, error = %e, "socket error");
                break;
            }
        };

        match Frame::parse(text.as_str()) {
            Ok(Frame::Request(request)) => {
                tokio::spawn(methods::dispatch(state.clone(), peer.clone(), request));
            }
            Ok(_) => {
                tracing::debug!(conn_id = %peer.conn_id, "ignoring non-request frame");
            }
            Err(e) => {
                tracing::debug!(conn_id = %peer.conn_id, error = %e, "invalid frame");
                let shape = ErrorShape::new(ErrorCode::InvalidRequest, format!("invalid frame: {e}"));
                let _ = peer
                    .handle
                    .send_frame(&Frame::Response(ResponseFrame::err("", shape)));
            }
        }
    }
}

fn announce_presence(state: &GatewayState) {
    let version = state.broadcaster.bump_presence();
    let peers: Vec<_> = state
        .broadcaster
        .peers()
        .iter()
        .map(|p| {
            json!({
                "connId": p.conn_id,
                "clientId": p.connect.client.id,
                "role": p.role(),
                "platform": p.connect.client.platform,
                "connectedAtMs": p.connected_at_ms,
            })
        })
        .collect();
    state.broadcaster.broadcast(
        events::PRESENCE,
        json!({ "peers": peers }),
        BroadcastOpts {
            drop_if_slow: true,
            state_version: Some(version),
        },
    );
}
