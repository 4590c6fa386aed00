// neura-core/src/infrastructure/state/secrets.rs

// Connection credentials never sit in state.json in the clear. Each secret
// payload is sealed with XChaCha20-Poly1305 under a process-local key: the
// NEURA_STATE_SECRET env var (any string, normalized through sha256) or a
// generated key persisted to `.secret` with 0600 permissions.

use crate::infrastructure::error::InfrastructureError;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, XChaCha20Poly1305, XNonce};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const KEY_FILENAME: &str = ".secret";
const KEY_LEN: usize = 32;

pub struct SecretBox {
    cipher: XChaCha20Poly1305,
}

impl SecretBox {
    /// Resolve the key: env override first, then the key file, else generate
    /// a fresh key and persist it (0600 on unix).
    pub fn open(state_dir: &Path) -> Result<Self, InfrastructureError> {
        let key_bytes = match std::env::var("NEURA_STATE_SECRET") {
            Ok(raw) if !raw.trim().is_empty() => normalize_key(raw.trim()),
            _ => load_or_create_key_file(&state_dir.join(KEY_FILENAME))?,
        };
        let cipher = XChaCha20Poly1305::new_from_slice(&key_bytes)
            .map_err(|e| InfrastructureError::Crypto(format!("invalid key material: {e}")))?;
        Ok(Self { cipher })
    }

    #[cfg(test)]
    pub fn from_passphrase(passphrase: &str) -> Self {
        let key = normalize_key(passphrase);
        #[allow(clippy::expect_used)]
        let cipher = XChaCha20Poly1305::new_from_slice(&key).expect("32-byte key");
        Self { cipher }
    }

    /// Seal a JSON payload into `nonce || ciphertext`, base64url encoded.
    pub fn seal(&self, payload: &serde_json::Value) -> Result<String, InfrastructureError> {
        let plaintext = serde_json::to_vec(payload)?;
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|e| InfrastructureError::Crypto(format!("encryption failed: {e}")))?;
        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(blob))
    }

    /// Open a sealed blob. Tampered or foreign blobs yield None, never a
    /// partial plaintext.
    pub fn unseal(&self, token: &str) -> Option<serde_json::Value> {
        if token.is_empty() {
            return None;
        }
        let blob = URL_SAFE_NO_PAD.decode(token).ok()?;
        if blob.len() <= 24 {
            return None;
        }
        let (nonce_bytes, ciphertext) = blob.split_at(24);
        let nonce = XNonce::from_slice(nonce_bytes);
        let plaintext = self.cipher.decrypt(nonce, ciphertext).ok()?;
        serde_json::from_slice(&plaintext).ok()
    }
}

/// Any passphrase becomes a 32-byte key via sha256; raw 32-byte base64url
/// keys pass through unchanged.
fn normalize_key(raw: &str) -> [u8; KEY_LEN] {
    if let Ok(decoded) = URL_SAFE_NO_PAD.decode(raw)
        && decoded.len() == KEY_LEN
    {
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&decoded);
        return key;
    }
    let digest = Sha256::digest(raw.as_bytes());
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&digest);
    key
}

fn load_or_create_key_file(path: &PathBuf) -> Result<[u8; KEY_LEN], InfrastructureError> {
    if path.exists() {
        let raw = std::fs::read_to_string(path)?;
        return Ok(normalize_key(raw.trim()));
    }
    let mut key = [0u8; KEY_LEN];
    use rand::RngCore;
    rand::rngs::OsRng.fill_bytes(&mut key);
    let encoded = URL_SAFE_NO_PAD.encode(key);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &encoded)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    Ok(normalize_key(&encoded))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_seal_unseal_round_trip() {
        let secrets = SecretBox::from_passphrase("not-a-real-secret");
        let payload = serde_json::json!({"url": "sqlite:///data/prod.db", "user": "svc"});
        let sealed = secrets.seal(&payload).unwrap();
        assert_ne!(sealed, payload.to_string());
        assert_eq!(secrets.unseal(&sealed), Some(payload));
    }

    #[test]
    fn test_unseal_rejects_tampering() {
        let secrets = SecretBox::from_passphrase("not-a-real-secret");
        let sealed = secrets.seal(&serde_json::json!({"k": 1})).unwrap();
        let mut tampered = sealed.clone();
        tampered.replace_range(0..2, "AA");
        assert!(secrets.unseal(&tampered).is_none() || tampered == sealed);
        assert!(secrets.unseal("").is_none());
        assert!(secrets.unseal("garbage!!").is_none());
    }

    #[test]
    fn test_wrong_key_yields_none() {
        let a = SecretBox::from_passphrase("key-a");
        let b = SecretBox::from_passphrase("key-b");
        let sealed = a.seal(&serde_json::json!({"k": 1})).unwrap();
        assert!(b.unseal(&sealed).is_none());
    }

    #[test]
    fn test_key_file_created_with_owner_permissions() {
        let dir = tempdir().unwrap();
        let key_path = dir.path().join(KEY_FILENAME);
        let key1 = load_or_create_key_file(&key_path).unwrap();
        assert!(key_path.exists());
        let key2 = load_or_create_key_file(&key_path).unwrap();
        assert_eq!(key1, key2);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
