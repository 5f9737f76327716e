//! Device identity, handshake signing, token caching and certificate pinning

pub mod auth_payload;
pub mod device_auth;
pub mod fingerprint;
pub mod identity;

pub use auth_payload::{DeviceAuthPayload, build_device_auth_payload};
pub use device_auth::{DeviceAuthEntry, DeviceAuthStore};
pub use fingerprint::{PinnedCertVerifier, cert_fingerprint, normalize_fingerprint, pinned_client_config};
pub use identity::{DeviceIdentity, derive_device_id, verify};
