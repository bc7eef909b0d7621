//! AEAD wrapping for secret bootstrap state.
//!
//! Secret values in the `app_state` table are sealed with AES-256-GCM
//! before they hit the database. The wrapped layout is recognizable:
//!
//! ```text
//! enc:v1:<iv_b64>:<ct_b64>:<tag_b64>
//! ```
//!
//! The key is derived from `PETAL_KEY_SECRET` with SHA-384 (first 32
//! bytes), so any passphrase works as key material.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha384};
use thiserror::Error;

/// Prefix carried by every wrapped value.
pub const ENC_PREFIX: &str = "enc:v1:";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("cipher init failed")]
    KeyInit,
    #[error("encryption failed")]
    Encrypt,
    #[error("malformed ciphertext: {0}")]
    Malformed(String),
    #[error("decryption failed")]
    Decrypt,
}

/// Derive a 256-bit AEAD key from arbitrary secret material.
pub fn derive_key(secret: &str) -> [u8; 32] {
    let digest = Sha384::digest(secret.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest[..32]);
    key
}

/// True when a stored value is a wrapped secret.
pub fn is_sealed(value: &str) -> bool {
    value.starts_with(ENC_PREFIX)
}

/// Seal a plaintext value into the `enc:v1:` layout.
pub fn seal(key: &[u8; 32], plaintext: &str) -> Result<String, SecretError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| SecretError::KeyInit)?;
    let mut iv = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut iv);
    // aes-gcm appends the 16-byte tag to the ciphertext.
    let sealed = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
        .map_err(|_| SecretError::Encrypt)?;
    let (ct, tag) = sealed.split_at(sealed.len() - TAG_LEN);
    Ok(format!(
        "{ENC_PREFIX}{}:{}:{}",
        BASE64.encode(iv),
        BASE64.encode(ct),
        BASE64.encode(tag)
    ))
}

/// Open a wrapped value. Raises on any malformed or tampered input.
pub fn open(key: &[u8; 32], wrapped: &str) -> Result<String, SecretError> {
    let body = wrapped
        .strip_prefix(ENC_PREFIX)
        .ok_or_else(|| SecretError::Malformed("missing enc:v1: prefix".into()))?;
    let parts: Vec<&str> = body.split(':').collect();
    if parts.len() != 3 {
        return Err(SecretError::Malformed(format!("expected 3 segments, got {}", parts.len())));
    }
    let iv = BASE64
        .decode(parts[0])
        .map_err(|e| SecretError::Malformed(format!("iv: {e}")))?;
    let ct = BASE64
        .decode(parts[1])
        .map_err(|e| SecretError::Malformed(format!("ciphertext: {e}")))?;
    let tag = BASE64
        .decode(parts[2])
        .map_err(|e| SecretError::Malformed(format!("tag: {e}")))?;
    if iv.len() != NONCE_LEN {
        return Err(SecretError::Malformed("iv must be 12 bytes".into()));
    }
    if tag.len() != TAG_LEN {
        return Err(SecretError::Malformed("tag must be 16 bytes".into()));
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| SecretError::KeyInit)?;
    let mut sealed = ct;
    sealed.extend_from_slice(&tag);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), sealed.as_slice())
        .map_err(|_| SecretError::Decrypt)?;
    String::from_utf8(plaintext).map_err(|_| SecretError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = derive_key("flora-test-secret");
        let wrapped = seal(&key, "302e020100300506032b657004220420aa").expect("seal");
        assert!(is_sealed(&wrapped));
        assert!(wrapped.starts_with("enc:v1:"));
        assert_eq!(open(&key, &wrapped).expect("open"), "302e020100300506032b657004220420aa");
    }

    #[test]
    fn wrapped_layout_has_three_segments() {
        let key = derive_key("k");
        let wrapped = seal(&key, "v").expect("seal");
        let body = wrapped.strip_prefix(ENC_PREFIX).expect("prefix");
        assert_eq!(body.split(':').count(), 3);
    }

    #[test]
    fn open_rejects_malformed_inputs() {
        let key = derive_key("k");
        assert!(matches!(open(&key, "plaintext"), Err(SecretError::Malformed(_))));
        assert!(matches!(open(&key, "enc:v1:only-two:parts"), Err(SecretError::Malformed(_))));
        assert!(matches!(open(&key, "enc:v1:a:b:c"), Err(SecretError::Malformed(_))));
    }

    #[test]
    fn open_rejects_wrong_key_and_tampering() {
        let key = derive_key("k");
        let wrapped = seal(&key, "secret").expect("seal");
        let other = derive_key("not-k");
        assert!(matches!(open(&other, &wrapped), Err(SecretError::Decrypt)));

        // Flip a ciphertext character.
        let mut parts: Vec<String> = wrapped.split(':').map(str::to_string).collect();
        let ct = parts[3].clone();
        parts[3] = if ct.starts_with('A') { format!("B{}", &ct[1..]) } else { format!("A{}", &ct[1..]) };
        let tampered = parts.join(":");
        assert!(open(&key, &tampered).is_err());
    }

    #[test]
    fn distinct_nonces_give_distinct_ciphertexts() {
        let key = derive_key("k");
        let a = seal(&key, "same").expect("seal");
        let b = seal(&key, "same").expect("seal");
        assert_ne!(a, b);
        assert_eq!(open(&key, &a).expect("open"), open(&key, &b).expect("open"));
    }
}
