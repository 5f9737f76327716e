//! Handshake verification
//!
//! Checks run in a fixed order: protocol range, role, signed device block,
//! then credentials. The first failure rejects the connection.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};

use crate::protocol::{
    ConnectParams, DEFAULT_ROLE, HelloAuth, NODE_ROLE, PROTOCOL_VERSION, SIGNATURE_SKEW_MS, now_ms,
};
use crate::security::{DeviceAuthPayload, build_device_auth_payload, derive_device_id, verify};
use crate::{Error, Result};

/// Who a verified handshake belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    /// Verified device id, if the peer signed in with one
    pub device_id: Option<String>,
    pub role: String,
}

/// Rotating device tokens issued by this gateway, keyed by (device, role)
#[derive(Debug, Default)]
pub struct DeviceTokens {
    issued: Mutex<HashMap<(String, String), String>>,
}

impl DeviceTokens {
    /// Issue a fresh token, replacing the previous one for the pair
    pub fn rotate(&self, device_id: &str, role: &str, scopes: &[String]) -> HelloAuth {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);
        self.issued
            .lock()
            .insert((device_id.to_string(), role.to_string()), token.clone());
        HelloAuth {
            device_token: token,
            role: role.to_string(),
            scopes: scopes.to_vec(),
            issued_at_ms: now_ms(),
        }
    }

    fn matches(&self, device_id: &str, role: &str, provided: &str) -> bool {
        self.issued
            .lock()
            .get(&(device_id.to_string(), role.to_string()))
            .is_some_and(|t| constant_time_eq(t.as_bytes(), provided.as_bytes()))
    }
}

/// Shared credentials the gateway accepts
#[derive(Debug, Clone, Default)]
pub struct SharedAuth {
    pub token: Option<SecretString>,
    pub password: Option<SecretString>,
}

impl SharedAuth {
    const fn is_open(&self) -> bool {
        self.token.is_none() && self.password.is_none()
    }
}

/// Verify a `connect` request against the challenge `nonce`
///
/// A missing device nonce is tolerated only from loopback peers, which may
/// have connected before the challenge arrived.
///
/// # Errors
///
/// `InvalidRequest` for protocol or role problems, `Auth` for anything about
/// the device block or credentials
pub fn authenticate(
    params: &ConnectParams,
    nonce: &str,
    is_loopback: bool,
    shared: &SharedAuth,
    tokens: &DeviceTokens,
) -> Result<Authenticated> {
    if params.min_protocol > PROTOCOL_VERSION || params.max_protocol < PROTOCOL_VERSION {
        return Err(Error::InvalidRequest(format!(
            "protocol mismatch: server speaks {PROTOCOL_VERSION}, client offers {}..={}",
            params.min_protocol, params.max_protocol
        )));
    }

    let role = params.role();
    if role != DEFAULT_ROLE && role != NODE_ROLE {
        return Err(Error::InvalidRequest(format!("unknown role: {role}")));
    }

    let provided_token = params.auth.as_ref().and_then(|a| a.token.as_deref());
    let provided_password = params.auth.as_ref().and_then(|a| a.password.as_deref());

    let device_id = match &params.device {
        Some(device) => {
            if derive_device_id(&device.public_key).as_deref() != Some(device.id.as_str()) {
                return Err(Error::Auth("device identity mismatch".to_string()));
            }
            if now_ms().saturating_sub(device.signed_at).saturating_abs() > SIGNATURE_SKEW_MS {
                return Err(Error::Auth("device signature expired".to_string()));
            }
            match device.nonce.as_deref() {
                Some(signed) if signed != nonce => {
                    return Err(Error::Auth("device nonce mismatch".to_string()));
                }
                None if !is_loopback => {
                    return Err(Error::Auth("device nonce required".to_string()));
                }
                _ => {}
            }

            let payload = build_device_auth_payload(&DeviceAuthPayload {
                device_id: &device.id,
                client_id: &params.client.id,
                client_mode: &params.client.mode,
                role,
                scopes: &params.scopes,
                signed_at_ms: device.signed_at,
                token: provided_token,
                nonce: device.nonce.as_deref(),
            });
            if !verify(&device.public_key, &payload, &device.signature) {
                return Err(Error::Auth("device signature invalid".to_string()));
            }
            Some(device.id.clone())
        }
        None => None,
    };

    if !shared.is_open() {
        let token_ok = provided_token.is_some_and(|provided| {
            shared
                .token
                .as_ref()
                .is_some_and(|t| constant_time_eq(t.expose_secret().as_bytes(), provided.as_bytes()))
                || device_id
                    .as_deref()
                    .is_some_and(|id| tokens.matches(id, role, provided))
        });
        let password_ok = provided_password.is_some_and(|provided| {
            shared
                .password
                .as_ref()
                .is_some_and(|p| constant_time_eq(p.expose_secret().as_bytes(), provided.as_bytes()))
        });
        if !token_ok && !password_ok {
            return Err(Error::Auth("unauthorized".to_string()));
        }
    }

    Ok(Authenticated {
        device_id,
        role: role.to_string(),
    })
}

/// Constant-time byte comparison to prevent timing attacks
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
