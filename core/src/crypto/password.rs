// Password-based message encryption: PBKDF2 + XChaCha20-Poly1305 + HMAC tag
//
// Flow:
// 1. KDF: PBKDF2-HMAC-SHA256(password, salt, 10k iterations) → 256-bit key
// 2. Encrypt: XChaCha20-Poly1305(key, random 24-byte IV, plaintext)
// 3. Tag: HMAC-SHA256(key, ciphertext || iv) → authTag
// 4. Output: CipherPayload { encrypted, iv, authTag, salt } — all base64
//
// The receiver recomputes the tag and compares it BEFORE running the cipher,
// so a wrong password is reported as an authentication failure, never as
// garbage plaintext. The salt travels with the payload; payloads without one
// (older fixed-salt senders) derive against the legacy application salt.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

/// PBKDF2 iteration count. Changing this breaks compatibility with all
/// existing ciphertexts.
pub const KDF_ITERATIONS: u32 = 10_000;

/// Application-wide salt used when a payload carries no per-message salt.
const LEGACY_SALT: &[u8] = b"roomcast_salt_2024";

/// Per-message salt length in bytes
const SALT_LEN: usize = 16;

/// XChaCha20 nonce length in bytes
const IV_LEN: usize = 24;

/// Errors from password-based encryption/decryption
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Tag mismatch — wrong password or tampering. No decryption was attempted.
    #[error("message authentication failed - wrong password or tampering detected")]
    AuthenticationFailure,
    /// Tag matched (or never got that far) but the bytes could not be decoded
    #[error("decryption failed: {0}")]
    DecodeFailure(String),
    /// Payload is structurally unusable
    #[error("invalid cipher payload: {0}")]
    InvalidPayload(String),
    /// Cipher rejected the plaintext (practically unreachable)
    #[error("encryption failed")]
    EncryptionFailure,
}

/// Self-describing ciphertext bundle — replaces a plaintext body on the wire.
///
/// All binary fields are base64 for transport safety. A payload missing any
/// of `encrypted`/`iv`/`authTag` is invalid and dropped, never partially
/// processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CipherPayload {
    /// Base64 ciphertext
    pub encrypted: String,
    /// Base64 initialization vector (24 bytes decoded)
    pub iv: String,
    /// Base64 HMAC-SHA256 over ciphertext || iv, keyed by the derived key
    #[serde(rename = "authTag")]
    pub auth_tag: String,
    /// Per-message KDF salt. Absent on payloads from fixed-salt senders.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    /// Intended recipient hint. Not enforced as access control.
    #[serde(rename = "targetUser", skip_serializing_if = "Option::is_none")]
    pub target_user: Option<String>,
}

/// Stretch a password into a 256-bit key.
pub fn derive_key(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, KDF_ITERATIONS, &mut key);
    key
}

fn tag_mac(key: &[u8; 32], ciphertext: &[u8], iv: &[u8]) -> Result<HmacSha256, CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidPayload("bad HMAC key length".to_string()))?;
    mac.update(ciphertext);
    mac.update(iv);
    Ok(mac)
}

/// Encrypt a message body for a recipient password.
///
/// Every call draws a fresh salt and IV, so two calls with identical inputs
/// never produce identical ciphertext.
pub fn encrypt(
    plaintext: &str,
    password: &str,
    target_user: Option<&str>,
) -> Result<CipherPayload, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);

    let mut key = derive_key(password, &salt);

    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let cipher = XChaCha20Poly1305::new_from_slice(&key)
        .map_err(|_| CryptoError::EncryptionFailure)?;
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&iv), plaintext.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailure)?;

    let tag = tag_mac(&key, &ciphertext, &iv)?.finalize().into_bytes();
    key.zeroize();

    Ok(CipherPayload {
        encrypted: BASE64.encode(&ciphertext),
        iv: BASE64.encode(iv),
        auth_tag: BASE64.encode(tag),
        salt: Some(BASE64.encode(salt)),
        target_user: target_user.map(str::to_string),
    })
}

/// Decrypt a payload with the local password.
///
/// The auth tag is recomputed and compared (constant time) before the cipher
/// runs; a mismatch is a hard `AuthenticationFailure`, not a decryption
/// attempt.
pub fn decrypt(payload: &CipherPayload, password: &str) -> Result<String, CryptoError> {
    let ciphertext = BASE64
        .decode(&payload.encrypted)
        .map_err(|_| CryptoError::DecodeFailure("ciphertext is not valid base64".to_string()))?;
    let iv = BASE64
        .decode(&payload.iv)
        .map_err(|_| CryptoError::DecodeFailure("iv is not valid base64".to_string()))?;
    let tag = BASE64
        .decode(&payload.auth_tag)
        .map_err(|_| CryptoError::DecodeFailure("authTag is not valid base64".to_string()))?;

    if iv.len() != IV_LEN {
        return Err(CryptoError::DecodeFailure(format!(
            "iv must be {} bytes, got {}",
            IV_LEN,
            iv.len()
        )));
    }

    let salt = match &payload.salt {
        Some(s) => BASE64
            .decode(s)
            .map_err(|_| CryptoError::DecodeFailure("salt is not valid base64".to_string()))?,
        None => LEGACY_SALT.to_vec(),
    };

    let mut key = derive_key(password, &salt);

    tag_mac(&key, &ciphertext, &iv)?
        .verify_slice(&tag)
        .map_err(|_| CryptoError::AuthenticationFailure)?;

    let cipher = XChaCha20Poly1305::new_from_slice(&key)
        .map_err(|_| CryptoError::DecodeFailure("bad key length".to_string()))?;
    let plaintext_bytes = cipher
        .decrypt(XNonce::from_slice(&iv), ciphertext.as_ref())
        .map_err(|_| CryptoError::DecodeFailure("ciphertext rejected by cipher".to_string()))?;
    key.zeroize();

    String::from_utf8(plaintext_bytes)
        .map_err(|_| CryptoError::DecodeFailure("decrypted bytes are not valid UTF-8".to_string()))
}

/// Structural check: is this raw body a cipher payload?
///
/// True when the text parses as JSON carrying non-empty string fields
/// `encrypted`, `iv` and `authTag`.
pub fn is_cipher_payload(raw: &str) -> bool {
    parse_cipher_payload(raw).is_some()
}

/// Parse a raw body into a `CipherPayload`, or None if it isn't one.
pub fn parse_cipher_payload(raw: &str) -> Option<CipherPayload> {
    let payload: CipherPayload = serde_json::from_str(raw).ok()?;
    if payload.encrypted.is_empty() || payload.iv.is_empty() || payload.auth_tag.is_empty() {
        return None;
    }
    Some(payload)
}

/// SHA-256 of a text, hex-encoded
pub fn sha256_hex(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Generate a random password from a printable charset.
pub fn generate_password(length: usize) -> String {
    use rand::Rng;
    const CHARS: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*";
    let mut rng = rand::rngs::OsRng;
    (0..length)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}
