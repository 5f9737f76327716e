//! Scoped event fan-out to connected peers
//!
//! Peers are reached through a [`PeerHandle`], an unbounded outbound queue
//! plus a counter of bytes queued but not yet flushed by the socket writer.
//! That counter drives the slow-consumer policy.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::{
    ConnectParams, DEFAULT_ROLE, EventFrame, Frame, MAX_BUFFERED_BYTES, StateVersion, close, scopes,
};
use crate::{Error, Result};

/// Item queued for a peer's socket writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Send side of one peer connection
#[derive(Debug, Clone)]
pub struct PeerHandle {
    conn_id: String,
    tx: mpsc::UnboundedSender<Outbound>,
    buffered: Arc<AtomicUsize>,
}

impl PeerHandle {
    /// Create a handle and the receiver its writer task drains
    #[must_use]
    pub fn new(conn_id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            conn_id: conn_id.into(),
            tx,
            buffered: Arc::new(AtomicUsize::new(0)),
        };
        (handle, rx)
    }

    #[must_use]
    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    /// Queue a text frame
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the writer has gone away
    pub fn send_text(&self, text: String) -> Result<()> {
        let len = text.len();
        self.buffered.fetch_add(len, Ordering::Relaxed);
        if self.tx.send(Outbound::Text(text)).is_err() {
            self.mark_flushed(len);
            return Err(Error::Unavailable(format!("connection {} closed", self.conn_id)));
        }
        Ok(())
    }

    /// Serialize and queue a frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails or the writer has gone away
    pub fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.send_text(frame.to_text()?)
    }

    /// Queue a targeted event (no sequence number)
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails or the writer has gone away
    pub fn send_event(&self, event: &str, payload: Value) -> Result<()> {
        self.send_frame(&Frame::Event(EventFrame {
            event: event.to_string(),
            payload: Some(payload),
            seq: None,
            state_version: None,
        }))
    }

    /// Called by the writer once `bytes` reached the socket
    pub fn mark_flushed(&self, bytes: usize) {
        let _ = self
            .buffered
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |b| {
                Some(b.saturating_sub(bytes))
            });
    }

    /// Bytes queued but not yet flushed
    #[must_use]
    pub fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    /// Ask the writer to close the socket
    pub fn close(&self, code: u16, reason: &str) -> bool {
        // Close reasons are limited to 123 bytes on the wire
        let reason: String = reason.chars().take(123).collect();
        self.tx.send(Outbound::Close { code, reason }).is_ok()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A peer that completed the handshake
#[derive(Debug, Clone)]
pub struct ConnectedPeer {
    pub conn_id: String,
    pub connect: ConnectParams,
    pub handle: PeerHandle,
    pub remote_addr: Option<String>,
    pub connected_at_ms: i64,
}

impl ConnectedPeer {
    #[must_use]
    pub fn role(&self) -> &str {
        self.connect.role()
    }

    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.connect.has_scope(scope)
    }
}

/// Per-call fan-out options
#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastOpts {
    /// Skip slow peers instead of disconnecting them
    pub drop_if_slow: bool,
    pub state_version: Option<StateVersion>,
}

impl BroadcastOpts {
    #[must_use]
    pub const fn droppable() -> Self {
        Self {
            drop_if_slow: true,
            state_version: None,
        }
    }
}

/// Scope an operator needs to receive `event`, if any
#[must_use]
pub fn required_scope(event: &str) -> Option<&'static str> {
    if event.starts_with("exec.approval.") {
        Some(scopes::APPROVALS)
    } else if event.starts_with("device.pair.") || event.starts_with("node.pair.") {
        Some(scopes::PAIRING)
    } else {
        None
    }
}

fn may_receive(peer: &ConnectedPeer, event: &str) -> bool {
    required_scope(event).is_none_or(|scope| peer.role() == DEFAULT_ROLE && peer.has_scope(scope))
}

/// Connected peers and the event sequence
pub struct Broadcaster {
    peers: RwLock<HashMap<String, Arc<ConnectedPeer>>>,
    session_subs: RwLock<HashMap<String, HashSet<String>>>,
    seq: AtomicU64,
    presence_version: AtomicU64,
    health_version: AtomicU64,
    max_buffered_bytes: usize,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("peers", &self.len())
            .field("seq", &self.seq.load(Ordering::Relaxed))
            .field("max_buffered_bytes", &self.max_buffered_bytes)
            .finish_non_exhaustive()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(MAX_BUFFERED_BYTES)
    }
}

impl Broadcaster {
    #[must_use]
    pub fn new(max_buffered_bytes: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            session_subs: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            presence_version: AtomicU64::new(0),
            health_version: AtomicU64::new(0),
            max_buffered_bytes,
        }
    }

    pub fn add(&self, peer: ConnectedPeer) -> Arc<ConnectedPeer> {
        let peer = Arc::new(peer);
        self.peers
            .write()
            .insert(peer.conn_id.clone(), peer.clone());
        peer
    }

    /// Drop a peer and its session subscriptions
    pub fn remove(&self, conn_id: &str) -> Option<Arc<ConnectedPeer>> {
        let removed = self.peers.write().remove(conn_id);
        let mut subs = self.session_subs.write();
        subs.retain(|_, conns| {
            conns.remove(conn_id);
            !conns.is_empty()
        });
        removed
    }

    #[must_use]
    pub fn get(&self, conn_id: &str) -> Option<Arc<ConnectedPeer>> {
        self.peers.read().get(conn_id).cloned()
    }

    #[must_use]
    pub fn peers(&self) -> Vec<Arc<ConnectedPeer>> {
        self.peers.read().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Last global sequence number issued
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn state_version(&self) -> StateVersion {
        StateVersion {
            presence: self.presence_version.load(Ordering::SeqCst),
            health: self.health_version.load(Ordering::SeqCst),
        }
    }

    pub fn bump_presence(&self) -> StateVersion {
        self.presence_version.fetch_add(1, Ordering::SeqCst);
        self.state_version()
    }

    pub fn bump_health(&self) -> StateVersion {
        self.health_version.fetch_add(1, Ordering::SeqCst);
        self.state_version()
    }

    /// Send an event to every eligible peer, stamped with the next global seq
    ///
    /// Returns the sequence number used.
    pub fn broadcast(&self, event: &str, payload: Value, opts: BroadcastOpts) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = Frame::Event(EventFrame {
            event: event.to_string(),
            payload: Some(payload),
            seq: Some(seq),
            state_version: opts.state_version,
        });
        let targets = self.peers();
        self.fan_out(&targets, event, &frame, opts);
        seq
    }

    /// Send an event to the listed connections only, without a seq
    ///
    /// Returns how many peers the frame was queued for.
    pub fn broadcast_to_conn_ids(
        &self,
        event: &str,
        payload: Value,
        conn_ids: &HashSet<String>,
        opts: BroadcastOpts,
    ) -> usize {
        if conn_ids.is_empty() {
            return 0;
        }
        let frame = Frame::Event(EventFrame {
            event: event.to_string(),
            payload: Some(payload),
            seq: None,
            state_version: opts.state_version,
        });
        let targets: Vec<_> = {
            let peers = self.peers.read();
            conn_ids.iter().filter_map(|id| peers.get(id).cloned()).collect()
        };
        self.fan_out(&targets, event, &frame, opts)
    }

    fn fan_out(&self, targets: &[Arc<ConnectedPeer>], event: &str, frame: &Frame, opts: BroadcastOpts) -> usize {
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(event = %event, error = %e, "failed to serialize event");
                return 0;
            }
        };

        let mut delivered = 0;
        for peer in targets {
            if !may_receive(peer, event) {
                continue;
            }

            if peer.handle.buffered_amount() > self.max_buffered_bytes {
                if opts.drop_if_slow {
                    continue;
                }
                tracing::warn!(
                    conn_id = %peer.conn_id,
                    buffered = peer.handle.buffered_amount(),
                    event = %event,
                    "closing slow consumer"
                );
                peer.handle.close(close::POLICY_VIOLATION, "slow consumer");
                continue;
            }

            if peer.handle.send_text(text.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Watch a chat session from a connection
    pub fn subscribe_session(&self, conn_id: &str, session_key: &str) {
        self.session_subs
            .write()
            .entry(session_key.to_string())
            .or_default()
            .insert(conn_id.to_string());
    }

    pub fn unsubscribe_session(&self, conn_id: &str, session_key: &str) {
        let mut subs = self.session_subs.write();
        if let Some(conns) = subs.get_mut(session_key) {
            conns.remove(conn_id);
            if conns.is_empty() {
                subs.remove(session_key);
            }
        }
    }

    /// Deliver an event to the peers watching `session_key`
    pub fn send_to_session(&self, session_key: &str, event: &str, payload: Value) -> usize {
        let conn_ids = self
            .session_subs
            .read()
            .get(session_key)
            .cloned()
            .unwrap_or_default();
        self.broadcast_to_conn_ids(event, payload, &conn_ids, BroadcastOpts::droppable())
    }

    /// Close every peer, e.g. on shutdown
    pub fn close_all(&self, code: u16, reason: &str) {
        for peer in self.peers() {
            peer.handle.close(code, reason);
        }
    }
}
