//! Node registry for multi-device dispatch
//!
//! Nodes are connected devices that register their capabilities
//! and can receive commands from the gateway

pub mod policy;
pub mod registry;
pub mod types;

pub use policy::{NodeCommandPolicy, platform_defaults};
pub use registry::NodeRegistry;
pub use types::{
    NodeInvokeRequest, NodeInvokeRequestEvent, NodeInvokeResult, NodeInvokeResultParams, NodeSession,
};
