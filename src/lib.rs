//! Beacon Link - gateway protocol core
//!
//! This library provides the protocol, security and coordination layer that
//! sits between a gateway and its peers:
//! - Device identity (Ed25519) and signed handshakes
//! - Reconnecting client with certificate pinning
//! - Node registry with timeout-bounded remote invocation
//! - Scoped broadcast with slow-consumer handling
//! - Abortable chat runs, per-run event sequencing, exec approvals
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      Peers                           │
//! │     Operator UI/CLI   │   Nodes   │   GatewayClient  │
//! └────────────────────┬────────────────────────────────┘
//!                      │ JSON frames over WebSocket
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Gateway server                       │
//! │  Handshake │ Broadcaster │ NodeRegistry │ Approvals  │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │          ChatRunCoordinator  ◄──  RunEventBus        │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod approvals;
pub mod broadcast;
pub mod chat;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod nodes;
pub mod protocol;
pub mod security;
pub mod server;

pub use approvals::{ExecApprovalDecision, ExecApprovalManager, ExecApprovalRecord, ExecApprovalRequest};
pub use broadcast::{BroadcastOpts, Broadcaster, ConnectedPeer, PeerHandle};
pub use chat::ChatRunCoordinator;
pub use client::{ClientState, GatewayClient, GatewayClientHandler, GatewayClientOptions, RequestOptions};
pub use config::Config;
pub use error::{Error, Result};
pub use events::RunEventBus;
pub use nodes::NodeRegistry;
pub use security::{DeviceAuthStore, DeviceIdentity};
pub use server::{GatewayServer, GatewayState};
