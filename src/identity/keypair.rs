//! Ed25519 Key Pair
//!
//! Die lokale Identität eines Geräts. Die User-ID ist der Public Key
//! (URL-safe Base64), damit das Relay Schreibzugriffe auf fremde
//! Absender ohne eigenen Account-Server ablehnen kann.
//!
//! ## Verwendung
//! ```no_run
//! # use skycall::identity::KeyPair;
//! let keypair = KeyPair::load_or_create_at("/tmp/skycall/private.key".as_ref())?;
//! let user_id = keypair.user_id();
//! # Ok::<(), skycall::identity::KeyPairError>(())
//! ```

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::fs;
use std::path::Path;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum KeyPairError {
    #[error("Failed to access key file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode key material: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid public key")]
    InvalidKey,

    #[error("Signature verification failed")]
    InvalidSignature,
}

// ============================================================================
// KEYPAIR
// ============================================================================

/// Ed25519 Schlüsselpaar für User-ID und Signierung der Relay-Requests
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Lädt das Schlüsselpaar von `path` oder erzeugt und speichert ein neues
    pub fn load_or_create_at(path: &Path) -> Result<Self, KeyPairError> {
        if path.exists() {
            tracing::info!("Loading existing keypair from {:?}", path);
            Self::load_from_file(path)
        } else {
            tracing::info!("Creating new keypair at {:?}", path);
            let keypair = Self::generate();
            keypair.save_to_file(path)?;
            Ok(keypair)
        }
    }

    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    fn load_from_file(path: &Path) -> Result<Self, KeyPairError> {
        let encoded = fs::read_to_string(path)?;
        let bytes = BASE64.decode(encoded.trim())?;
        let key_bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| KeyPairError::InvalidKeyLength(b.len()))?;

        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
        })
    }

    fn save_to_file(&self, path: &Path) -> Result<(), KeyPairError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, BASE64.encode(self.signing_key.to_bytes()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    /// User-ID dieses Geräts (Mailbox-Dokument-ID)
    pub fn user_id(&self) -> String {
        user_id_for_key(&self.verifying_key().to_bytes())
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.verifying_key().to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Signiert ein JSON-Objekt.
    ///
    /// Die Signatur läuft über die kanonische Form: Keys alphabetisch
    /// sortiert, Feld `signature` ausgenommen.
    pub fn sign_message(&self, payload: &serde_json::Value) -> String {
        let canonical = canonical_json(payload);
        BASE64.encode(self.sign(canonical.as_bytes()).to_bytes())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("user_id", &self.user_id())
            .finish()
    }
}

// ============================================================================
// VERIFICATION
// ============================================================================

/// Leitet die User-ID aus einem Public Key ab
pub fn user_id_for_key(public_key: &[u8; 32]) -> String {
    URL_SAFE_NO_PAD.encode(public_key)
}

/// Prüft eine Signatur von [`KeyPair::sign_message`] und gibt die
/// User-ID des Unterzeichners zurück.
pub fn verify_message(
    public_key_base64: &str,
    payload: &serde_json::Value,
    signature_base64: &str,
) -> Result<String, KeyPairError> {
    let key_bytes: [u8; 32] = BASE64
        .decode(public_key_base64)?
        .try_into()
        .map_err(|b: Vec<u8>| KeyPairError::InvalidKeyLength(b.len()))?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| KeyPairError::InvalidKey)?;

    let signature_bytes = BASE64.decode(signature_base64)?;
    let signature =
        Signature::from_slice(&signature_bytes).map_err(|_| KeyPairError::InvalidSignature)?;

    key.verify(canonical_json(payload).as_bytes(), &signature)
        .map_err(|_| KeyPairError::InvalidSignature)?;

    Ok(user_id_for_key(&key_bytes))
}

fn canonical_json(payload: &serde_json::Value) -> String {
    serde_json::to_string(&sort_json_object(payload)).unwrap_or_default()
}

fn sort_json_object(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().filter(|k| *k != "signature").collect();
            keys.sort();

            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.clone(), sort_json_object(v));
                }
            }
            serde_json::Value::Object(sorted)
        }
        other => other.clone(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_is_url_safe() {
        let keypair = KeyPair::generate();
        let id = keypair.user_id();

        // 32 bytes ohne Padding = 43 Zeichen
        assert_eq!(id.len(), 43);
        assert!(!id.contains('/') && !id.contains('+') && !id.contains('='));
    }

    #[test]
    fn test_sign_and_verify_message() {
        let keypair = KeyPair::generate();
        let payload = serde_json::json!({
            "type": "put",
            "docId": "bob",
            "timestamp": 1234567890
        });

        let signature = keypair.sign_message(&payload);
        let signer = verify_message(&keypair.public_key_base64(), &payload, &signature).unwrap();
        assert_eq!(signer, keypair.user_id());
    }

    #[test]
    fn test_signature_ignores_key_order_and_signature_field() {
        let keypair = KeyPair::generate();
        let a = serde_json::json!({ "b": 1, "a": { "y": 2, "x": 3 } });
        let signature = keypair.sign_message(&a);

        let mut b = serde_json::json!({ "a": { "x": 3, "y": 2 }, "b": 1 });
        b.as_object_mut()
            .unwrap()
            .insert("signature".to_string(), serde_json::json!(signature.clone()));

        assert!(verify_message(&keypair.public_key_base64(), &b, &signature).is_ok());
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let keypair = KeyPair::generate();
        let payload = serde_json::json!({ "docId": "bob" });
        let signature = keypair.sign_message(&payload);

        let tampered = serde_json::json!({ "docId": "mallory" });
        assert!(matches!(
            verify_message(&keypair.public_key_base64(), &tampered, &signature),
            Err(KeyPairError::InvalidSignature)
        ));
    }

    #[test]
    fn test_load_or_create_roundtrip() {
        let dir = std::env::temp_dir().join(format!("skycall-key-{}", uuid::Uuid::new_v4()));
        let path = dir.join("keys").join("private.key");

        let created = KeyPair::load_or_create_at(&path).unwrap();
        let loaded = KeyPair::load_or_create_at(&path).unwrap();
        assert_eq!(created.user_id(), loaded.user_id());

        let _ = std::fs::remove_dir_all(dir);
    }
}
