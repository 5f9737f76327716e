//! Canonical string signed by a device during the handshake

/// Fields covered by the device signature
#[derive(Debug, Clone, Default)]
pub struct DeviceAuthPayload<'a> {
    pub device_id: &'a str,
    pub client_id: &'a str,
    pub client_mode: &'a str,
    pub role: &'a str,
    pub scopes: &'a [String],
    pub signed_at_ms: i64,
    pub token: Option<&'a str>,
    pub nonce: Option<&'a str>,
}

/// Build the `|`-joined payload
///
/// `v2` when a nonce is present (challenge flow), `v1` otherwise. Scopes are
/// sorted before joining so signer and verifier agree regardless of the
/// order they were requested in.
#[must_use]
pub fn build_device_auth_payload(params: &DeviceAuthPayload<'_>) -> String {
    let version = if params.nonce.is_some() { "v2" } else { "v1" };

    let mut scopes: Vec<&str> = params.scopes.iter().map(String::as_str).collect();
    scopes.sort_unstable();
    let scopes = scopes.join(",");
    let signed_at = params.signed_at_ms.to_string();

    let mut fields = vec![
        version,
        params.device_id,
        params.client_id,
        params.client_mode,
        params.role,
        scopes.as_str(),
        signed_at.as_str(),
        params.token.unwrap_or_default(),
    ];
    if let Some(nonce) = params.nonce {
        fields.push(nonce);
    }
    fields.join("|")
}
