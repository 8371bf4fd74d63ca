use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use uuid::Uuid;

const ENVELOPE_PREFIX: &str = "enc:v1:";

/// Seals login service passwords at rest as
/// `enc:v1:{key_id}:{nonce}:{ciphertext}` (URL-safe base64 parts).
/// Without a key, values pass through unchanged.
#[derive(Clone)]
pub struct CredentialCipher {
    key: Option<(String, [u8; 32])>,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher")
            .field("key_id", &self.key.as_ref().map(|(id, _)| id))
            .finish()
    }
}

impl CredentialCipher {
    pub fn new(encoded_key: Option<&str>, key_id: &str) -> Result<Self> {
        let Some(encoded) = encoded_key.map(str::trim).filter(|k| !k.is_empty()) else {
            tracing::warn!("CREDENTIAL_KEY not set; login service passwords are stored unencrypted");
            return Ok(Self::disabled());
        };

        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.as_bytes())
            .or_else(|_| STANDARD.decode(encoded.as_bytes()))
            .context("CREDENTIAL_KEY is not valid base64")?;
        if bytes.len() != 32 {
            bail!("CREDENTIAL_KEY must decode to 32 bytes, got {}", bytes.len());
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(Self {
            key: Some((key_id.to_string(), key)),
        })
    }

    pub fn disabled() -> Self {
        Self { key: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    pub fn is_sealed(value: &str) -> bool {
        value.starts_with(ENVELOPE_PREFIX)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let Some((key_id, key)) = &self.key else {
            return Ok(plaintext.to_string());
        };
        if Self::is_sealed(plaintext) {
            return Ok(plaintext.to_string());
        }

        let nonce_source = Uuid::new_v4();
        let nonce_bytes = &nonce_source.as_bytes()[..12];
        let aead = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| anyhow!("failed to initialize credential cipher: {e}"))?;
        let ciphertext = aead
            .encrypt(Nonce::from_slice(nonce_bytes), plaintext.as_bytes())
            .map_err(|e| anyhow!("failed to encrypt credential: {e}"))?;

        Ok(format!(
            "{ENVELOPE_PREFIX}{key_id}:{}:{}",
            URL_SAFE_NO_PAD.encode(nonce_bytes),
            URL_SAFE_NO_PAD.encode(ciphertext)
        ))
    }

    /// Plaintext values stored before a key was configured are returned as is.
    pub fn decrypt(&self, stored: &str) -> Result<String> {
        if !Self::is_sealed(stored) {
            return Ok(stored.to_string());
        }
        let Some((expected_id, key)) = &self.key else {
            bail!("credential is encrypted but no CREDENTIAL_KEY is configured");
        };

        let parts: Vec<&str> = stored[ENVELOPE_PREFIX.len()..].split(':').collect();
        let [key_id, nonce_b64, ciphertext_b64] = parts.as_slice() else {
            bail!("credential envelope is malformed");
        };
        if *key_id != expected_id.as_str() {
            bail!("credential key id {key_id} is not configured");
        }

        let nonce = URL_SAFE_NO_PAD
            .decode(nonce_b64.as_bytes())
            .context("failed to decode credential nonce")?;
        if nonce.len() != 12 {
            bail!("credential nonce length is invalid");
        }
        let ciphertext = URL_SAFE_NO_PAD
            .decode(ciphertext_b64.as_bytes())
            .context("failed to decode credential payload")?;

        let aead = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| anyhow!("failed to initialize credential cipher: {e}"))?;
        let plaintext = aead
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|e| anyhow!("failed to decrypt credential: {e}"))?;
        String::from_utf8(plaintext).context("decrypted credential is not valid UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_b64(byte: u8) -> String {
        STANDARD.encode([byte; 32])
    }

    #[test]
    fn sealed_values_decrypt_with_the_same_key() {
        let cipher = CredentialCipher::new(Some(&key_b64(7)), "v1").unwrap();
        let sealed = cipher.encrypt("hunter2").unwrap();
        assert!(CredentialCipher::is_sealed(&sealed));
        assert!(sealed.starts_with("enc:v1:v1:"));
        assert_ne!(sealed, "hunter2");
        assert_eq!(cipher.decrypt(&sealed).unwrap(), "hunter2");
    }

    #[test]
    fn each_encryption_uses_a_fresh_nonce() {
        let cipher = CredentialCipher::new(Some(&key_b64(1)), "v1").unwrap();
        assert_ne!(cipher.encrypt("same").unwrap(), cipher.encrypt("same").unwrap());
    }

    #[test]
    fn rotated_or_missing_keys_are_rejected() {
        let cipher = CredentialCipher::new(Some(&key_b64(7)), "v1").unwrap();
        let rotated = CredentialCipher::new(Some(&key_b64(7)), "v2").unwrap();
        let sealed = cipher.encrypt("secret").unwrap();

        assert!(rotated.decrypt(&sealed).is_err());
        assert!(CredentialCipher::disabled().decrypt(&sealed).is_err());

        let other_key = CredentialCipher::new(Some(&key_b64(9)), "v1").unwrap();
        assert!(other_key.decrypt(&sealed).is_err());
    }

    #[test]
    fn plaintext_passes_through_without_a_key() {
        let cipher = CredentialCipher::disabled();
        assert!(!cipher.is_enabled());
        assert_eq!(cipher.encrypt("plain").unwrap(), "plain");
        assert_eq!(cipher.decrypt("plain").unwrap(), "plain");
    }

    #[test]
    fn bad_keys_fail_at_startup() {
        assert!(CredentialCipher::new(Some("not base64!"), "v1").is_err());
        assert!(CredentialCipher::new(Some(&STANDARD.encode([0u8; 16])), "v1").is_err());
        assert!(!CredentialCipher::new(Some("  "), "v1").unwrap().is_enabled());
    }
}
