//! Device identity management using Ed25519 cryptography
//!
//! Each install has a unique device identity consisting of an Ed25519
//! keypair stored as PKCS#8/SPKI PEM. The device ID is the SHA-256 hex digest
//! of the raw 32-byte public key

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use ed25519_dalek::pkcs8::{
    DecodePrivateKey, DecodePublicKey, Document, EncodePrivateKey, EncodePublicKey,
};
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::protocol::now_ms;
use crate::{Error, Result};

/// DER prefix of an Ed25519 `SubjectPublicKeyInfo`; the raw key follows it
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

/// On-disk format version
const IDENTITY_FILE_VERSION: u32 = 1;

/// Device identity loaded from disk
#[derive(Clone)]
pub struct DeviceIdentity {
    /// SHA-256 hex of the raw public key
    pub device_id: String,

    /// SPKI PEM public key
    pub public_key_pem: String,

    /// PKCS#8 PEM private key
    private_key_pem: String,

    /// When the identity was first generated
    pub created_at_ms: i64,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("created_at_ms", &self.created_at_ms)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredIdentity {
    version: u32,
    device_id: String,
    public_key_pem: String,
    private_key_pem: String,
    created_at_ms: i64,
}

impl DeviceIdentity {
    /// Generate a new device identity with a random keypair
    ///
    /// # Errors
    ///
    /// Returns error if PEM encoding fails
    pub fn generate() -> Result<Self> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        let private_key_pem = signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::Identity(format!("failed to encode private key: {e}")))?
            .to_string();
        let public_key_pem = verifying_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::Identity(format!("failed to encode public key: {e}")))?;

        Ok(Self {
            device_id: compute_device_id(verifying_key.as_bytes()),
            public_key_pem,
            private_key_pem,
            created_at_ms: now_ms(),
        })
    }

    /// Load identity from a file, or create a new one if it doesn't exist
    ///
    /// A stored device ID that disagrees with the stored public key is
    /// re-derived and written back. An unreadable file is replaced.
    ///
    /// # Errors
    ///
    /// Returns error if file operations or key encoding fail
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            match Self::load(path) {
                Ok(identity) => return Ok(identity),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "device identity unreadable, regenerating");
                }
            }
        }

        let identity = Self::generate()?;
        identity.save(path)?;
        tracing::info!(device_id = %identity.short_id(), "created new device identity");
        Ok(identity)
    }

    fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let stored: StoredIdentity = serde_json::from_str(&content)
            .map_err(|e| Error::Identity(format!("invalid device identity: {e}")))?;
        if stored.version != IDENTITY_FILE_VERSION {
            return Err(Error::Identity(format!(
                "unsupported identity version {}",
                stored.version
            )));
        }

        // Both halves must parse before the identity is trusted
        SigningKey::from_pkcs8_pem(&stored.private_key_pem)
            .map_err(|e| Error::Identity(format!("invalid private key: {e}")))?;
        let derived_id = fingerprint(&stored.public_key_pem)?;

        let identity = Self {
            device_id: derived_id,
            public_key_pem: stored.public_key_pem,
            private_key_pem: stored.private_key_pem,
            created_at_ms: stored.created_at_ms,
        };

        if identity.device_id == stored.device_id {
            tracing::debug!(device_id = %identity.short_id(), "loaded device identity");
        } else {
            tracing::info!(
                stored = %stored.device_id,
                derived = %identity.device_id,
                "device id disagreed with public key, rewriting identity file"
            );
            identity.save(path)?;
        }

        Ok(identity)
    }

    /// Persist the identity with owner-only permissions
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn save(&self, path: &Path) -> Result<()> {
        let stored = StoredIdentity {
            version: IDENTITY_FILE_VERSION,
            device_id: self.device_id.clone(),
            public_key_pem: self.public_key_pem.clone(),
            private_key_pem: self.private_key_pem.clone(),
            created_at_ms: self.created_at_ms,
        };
        let content = serde_json::to_string_pretty(&stored)?;
        write_private_file(path, &content)
    }

    /// Get the default identity file path
    ///
    /// Returns `~/.local/share/omni/beacon/identity/device.json`
    #[must_use]
    pub fn default_path() -> PathBuf {
        directories::BaseDirs::new().map_or_else(
            || PathBuf::from(".local/share/omni/beacon/identity/device.json"),
            |d| {
                d.data_dir()
                    .join("omni")
                    .join("beacon")
                    .join("identity")
                    .join("device.json")
            },
        )
    }

    /// Sign a payload with the device's private key
    ///
    /// # Errors
    ///
    /// Returns error if the private key cannot be parsed
    pub fn sign(&self, payload: &str) -> Result<String> {
        sign(&self.private_key_pem, payload)
    }

    /// Raw public key, base64url encoded
    ///
    /// # Errors
    ///
    /// Returns error if the stored public key is malformed
    pub fn raw_public_key(&self) -> Result<String> {
        raw_public_key(&self.public_key_pem)
    }

    /// Get the short device ID (first 8 characters)
    #[must_use]
    pub fn short_id(&self) -> &str {
        &self.device_id[..8.min(self.device_id.len())]
    }
}

/// Sign `payload` with a PKCS#8 PEM private key, returning a base64url signature
///
/// # Errors
///
/// Returns error if the private key is malformed
pub fn sign(private_key_pem: &str, payload: &str) -> Result<String> {
    let signing_key = SigningKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| Error::Identity(format!("invalid private key: {e}")))?;
    let signature = signing_key.sign(payload.as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(signature.to_bytes()))
}

/// Verify a device signature
///
/// `public_key` may be an SPKI PEM or a raw base64url key. Any malformed input
/// yields `false`.
#[must_use]
pub fn verify(public_key: &str, payload: &str, signature: &str) -> bool {
    let Some(verifying_key) = parse_public_key(public_key) else {
        return false;
    };
    let Some(sig_bytes) = decode_base64_lenient(signature) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    verifying_key.verify(payload.as_bytes(), &signature).is_ok()
}

/// Extract the raw 32-byte public key from an SPKI PEM, base64url encoded
///
/// # Errors
///
/// Returns error if the PEM is not an Ed25519 public key
pub fn raw_public_key(public_key_pem: &str) -> Result<String> {
    raw_public_key_bytes(public_key_pem).map(|raw| URL_SAFE_NO_PAD.encode(raw))
}

/// Device ID (SHA-256 hex of the raw key) for an SPKI PEM
///
/// # Errors
///
/// Returns error if the PEM is not an Ed25519 public key
pub fn fingerprint(public_key_pem: &str) -> Result<String> {
    raw_public_key_bytes(public_key_pem).map(|raw| compute_device_id(&raw))
}

/// Device ID for a public key given as PEM or raw base64url
#[must_use]
pub fn derive_device_id(public_key: &str) -> Option<String> {
    parse_public_key(public_key).map(|key| compute_device_id(key.as_bytes()))
}

/// Re-encode a PEM or raw public key as canonical raw base64url
#[must_use]
pub fn normalize_public_key(public_key: &str) -> Option<String> {
    parse_public_key(public_key).map(|key| URL_SAFE_NO_PAD.encode(key.as_bytes()))
}

fn raw_public_key_bytes(public_key_pem: &str) -> Result<[u8; 32]> {
    let (label, document) = Document::from_pem(public_key_pem.trim())
        .map_err(|e| Error::Identity(format!("invalid public key PEM: {e}")))?;
    if label != "PUBLIC KEY" {
        return Err(Error::Identity(format!("unexpected PEM label: {label}")));
    }

    let der = document.as_bytes();
    let raw = der
        .strip_prefix(ED25519_SPKI_PREFIX.as_slice())
        .ok_or_else(|| Error::Identity("not an Ed25519 public key".to_string()))?;
    <[u8; 32]>::try_from(raw)
        .map_err(|_| Error::Identity(format!("raw public key has {} bytes", raw.len())))
}

fn parse_public_key(public_key: &str) -> Option<VerifyingKey> {
    let trimmed = public_key.trim();
    if trimmed.contains("BEGIN") {
        return VerifyingKey::from_public_key_pem(trimmed).ok();
    }
    let raw = decode_base64_lenient(trimmed)?;
    let bytes = <[u8; 32]>::try_from(raw.as_slice()).ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

fn decode_base64_lenient(input: &str) -> Option<Vec<u8>> {
    let trimmed = input.trim();
    URL_SAFE_NO_PAD
        .decode(trimmed.trim_end_matches('='))
        .or_else(|_| STANDARD.decode(trimmed))
        .ok()
}

/// Compute device ID from raw public key bytes
fn compute_device_id(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// Write `content` to `path` readable and writable only by the owner
pub(crate) fn write_private_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(content.as_bytes())?;
    file.write_all(b"\n")?;

    // mode() only applies on creation
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_identity() {
        let identity = DeviceIdentity::generate().unwrap();

        assert_eq!(identity.device_id.len(), 64);
        assert!(identity.public_key_pem.contains("BEGIN PUBLIC KEY"));
        assert_eq!(fingerprint(&identity.public_key_pem).unwrap(), identity.device_id);
    }

    #[test]
    fn test_sign_and_verify() {
        let identity = DeviceIdentity::generate().unwrap();
        let payload = "v1|dev|cli|cli|operator||1|";

        let signature = identity.sign(payload).unwrap();
        assert!(verify(&identity.public_key_pem, payload, &signature));

        // Tampered payload should fail
        assert!(!verify(&identity.public_key_pem, "v1|dev|cli|cli|admin||1|", &signature));
    }

    #[test]
    fn test_verify_with_raw_key() {
        let identity = DeviceIdentity::generate().unwrap();
        let raw = identity.raw_public_key().unwrap();
        let signature = identity.sign("hello").unwrap();

        assert!(verify(&raw, "hello", &signature));
        assert_eq!(derive_device_id(&raw).unwrap(), identity.device_id);
        assert_eq!(normalize_public_key(&identity.public_key_pem).unwrap(), raw);
    }

    #[test]
    fn test_mismatched_keypair_fails() {
        let signer = DeviceIdentity::generate().unwrap();
        let other = DeviceIdentity::generate().unwrap();
        let signature = signer.sign("payload").unwrap();

        assert!(!verify(&other.public_key_pem, "payload", &signature));
    }

    #[test]
    fn test_malformed_inputs_fail_closed() {
        let identity = DeviceIdentity::generate().unwrap();
        let signature = identity.sign("payload").unwrap();

        assert!(!verify("not a key", "payload", &signature));
        assert!(!verify("-----BEGIN PUBLIC KEY-----\ngarbage\n-----END PUBLIC KEY-----", "payload", &signature));
        assert!(!verify(&identity.public_key_pem, "payload", "%%%"));
        assert!(!verify(&identity.public_key_pem, "payload", "c2hvcnQ"));
        assert!(!verify("", "", ""));
        assert!(sign("not a pem", "payload").is_err());
        assert!(raw_public_key("nope").is_err());
    }

    #[test]
    fn test_signature_accepts_standard_base64() {
        let identity = DeviceIdentity::generate().unwrap();
        let url_sig = identity.sign("payload").unwrap();
        let bytes = URL_SAFE_NO_PAD.decode(&url_sig).unwrap();
        let std_sig = STANDARD.encode(bytes);

        assert!(verify(&identity.public_key_pem, "payload", &std_sig));
    }

    #[test]
    fn test_load_or_create_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity").join("device.json");

        let first = DeviceIdentity::load_or_create(&path).unwrap();
        let second = DeviceIdentity::load_or_create(&path).unwrap();
        assert_eq!(first.device_id, second.device_id);
        assert_eq!(first.public_key_pem, second.public_key_pem);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_self_heals_wrong_device_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");
        let original = DeviceIdentity::load_or_create(&path).unwrap();

        let mut stored: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        stored["deviceId"] = serde_json::json!("deadbeef");
        fs::write(&path, serde_json::to_string(&stored).unwrap()).unwrap();

        let healed = DeviceIdentity::load_or_create(&path).unwrap();
        assert_eq!(healed.device_id, original.device_id);

        let on_disk: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["deviceId"], original.device_id.as_str());

        let again = DeviceIdentity::load_or_create(&path).unwrap();
        assert_eq!(again.device_id, original.device_id);
        assert_eq!(again.public_key_pem, original.public_key_pem);
    }

    #[test]
    fn test_corrupt_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");
        fs::write(&path, "{not json").unwrap();

        let identity = DeviceIdentity::load_or_create(&path).unwrap();
        assert_eq!(identity.device_id.len(), 64);
        assert_eq!(DeviceIdentity::load_or_create(&path).unwrap().device_id, identity.device_id);
    }

    #[test]
    fn test_short_id() {
        let identity = DeviceIdentity::generate().unwrap();
        assert_eq!(identity.short_id().len(), 8);
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let identity = DeviceIdentity::generate().unwrap();
        let rendered = format!("{identity:?}");
        assert!(!rendered.contains("PRIVATE KEY"));
    }
}
