// Inbound pipeline — envelope extraction, decryption, dedup, delivery
//
// Both transports feed raw bodies here. The pipeline extracts the sender,
// recognizes cipher payloads, decrypts when a local password is configured,
// re-extracts the sender from the plaintext (older senders embed their name
// inside the encrypted body), and de-duplicates before delivery. Crypto
// failures surface as placeholder text for the UI, never as transport
// errors.

use crate::crypto;
use crate::message::envelope::extract_sender_and_body;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};
use tracing::debug;

/// Shown in place of a cipher payload the local password cannot open
pub const WRONG_PASSWORD_PLACEHOLDER: &str = "encrypted message - wrong password";

/// Shown when a cipher payload arrives and no local password is configured
pub const NO_PASSWORD_PLACEHOLDER: &str = "encrypted message - no password configured";

/// Bounded size of the duplicate-suppression window
const MAX_SEEN_KEYS: usize = 4096;

/// Read-only identity supplied by the host application.
#[derive(Debug, Clone, Default)]
pub struct LocalIdentity {
    pub username: String,
    /// Password used to decrypt inbound messages
    pub own_encryption_password: Option<String>,
}

impl LocalIdentity {
    pub fn new(username: &str, own_encryption_password: Option<&str>) -> Self {
        Self {
            username: username.to_string(),
            own_encryption_password: own_encryption_password.map(str::to_string),
        }
    }
}

/// How an inbound body ended up in its delivered form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// Arrived unencrypted
    Plain,
    /// Cipher payload opened with the local password
    Decrypted,
    /// Cipher payload that could not be read; the body is a placeholder
    Placeholder,
}

/// What the pipeline hands to the host for display and persistence.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub sender: Option<String>,
    pub body: String,
    pub kind: BodyKind,
    /// Recipient hint from the cipher payload, when present
    pub target_user: Option<String>,
}

/// Seen-key window: HashSet for membership, VecDeque for FIFO eviction.
struct SeenSet {
    keys: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenSet {
    fn new() -> Self {
        Self {
            keys: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns false when the key was already present.
    fn insert(&mut self, key: String) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        self.keys.insert(key.clone());
        self.order.push_back(key);
        while self.keys.len() > MAX_SEEN_KEYS {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        true
    }
}

/// Derive a dedup key from message content for transports without message
/// IDs (UDP). Include the sender-supplied timestamp so a user repeating the
/// same text still gets through.
pub fn content_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// The shared inbound pipeline. One instance serves both transports.
pub struct InboundPipeline {
    identity: RwLock<LocalIdentity>,
    seen: Mutex<SeenSet>,
}

impl InboundPipeline {
    pub fn new(identity: LocalIdentity) -> Self {
        Self {
            identity: RwLock::new(identity),
            seen: Mutex::new(SeenSet::new()),
        }
    }

    pub fn identity(&self) -> LocalIdentity {
        self.identity.read().clone()
    }

    pub fn set_identity(&self, identity: LocalIdentity) {
        *self.identity.write() = identity;
    }

    /// Run one raw body through extraction, decryption and dedup.
    ///
    /// `outer_sender` is transport metadata (UDP envelope username, BLE
    /// message sender); a sender found inside the body wins over it.
    /// `dedup_key` is the transport's message ID when it has one, else a
    /// `content_key`. Returns None for duplicates — at-least-once transports
    /// may deliver twice, the UI must not.
    pub fn process(
        &self,
        raw: &str,
        outer_sender: Option<String>,
        dedup_key: String,
    ) -> Option<IncomingMessage> {
        if !self.seen.lock().insert(dedup_key) {
            debug!("Dropping duplicate message");
            return None;
        }

        let extracted = extract_sender_and_body(raw);
        let sender = extracted.sender.or(outer_sender);

        let payload = match crypto::parse_cipher_payload(&extracted.body) {
            Some(payload) => payload,
            None => {
                return Some(IncomingMessage {
                    sender,
                    body: extracted.body,
                    kind: BodyKind::Plain,
                    target_user: None,
                });
            }
        };

        let password = self.identity.read().own_encryption_password.clone();
        let password = match password {
            Some(password) => password,
            None => {
                return Some(IncomingMessage {
                    sender,
                    body: NO_PASSWORD_PLACEHOLDER.to_string(),
                    kind: BodyKind::Placeholder,
                    target_user: payload.target_user,
                });
            }
        };

        match crypto::decrypt(&payload, &password) {
            Ok(plaintext) => {
                // The sender may have embedded their name inside the
                // encrypted body rather than the outer envelope
                let inner = extract_sender_and_body(&plaintext);
                Some(IncomingMessage {
                    sender: inner.sender.or(sender),
                    body: inner.body,
                    kind: BodyKind::Decrypted,
                    target_user: payload.target_user,
                })
            }
            Err(e) => {
                debug!("Inbound cipher payload unreadable: {}", e);
                Some(IncomingMessage {
                    sender,
                    body: WRONG_PASSWORD_PLACEHOLDER.to_string(),
                    kind: BodyKind::Placeholder,
                    target_user: payload.target_user,
                })
            }
        }
    }
}

/// Wrap outbound plaintext for a recipient password, or pass it through
/// unchanged when no password is given. The result is what a transport
/// sends as its message body.
pub fn prepare_outbound(
    plaintext: &str,
    recipient_password: Option<&str>,
    target_user: Option<&str>,
) -> Result<String, crypto::CryptoError> {
    match recipient_password {
        Some(password) => {
            let payload = crypto::encrypt(plaintext, password, target_user)?;
            serde_json::to_string(&payload)
                .map_err(|_| crypto::CryptoError::EncryptionFailure)
        }
        None => Ok(plaintext.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(password: Option<&str>) -> InboundPipeline {
        InboundPipeline::new(LocalIdentity::new("me", password))
    }

    #[test]
    fn test_plain_body_passes_through() {
        let pipeline = pipeline(None);
        let result = pipeline
            .process("hello there", Some("alice".to_string()), "k1".to_string())
            .unwrap();
        assert_eq!(result.kind, BodyKind::Plain);
        assert_eq!(result.body, "hello there");
        assert_eq!(result.sender.as_deref(), Some("alice"));
    }

    #[test]
    fn test_inner_sender_wins_over_transport_metadata() {
        let pipeline = pipeline(None);
        let result = pipeline
            .process(
                r#"{"username": "bob", "message": "hi"}"#,
                Some("192.168.1.4".to_string()),
                "k1".to_string(),
            )
            .unwrap();
        assert_eq!(result.sender.as_deref(), Some("bob"));
        assert_eq!(result.body, "hi");
    }

    #[test]
    fn test_encrypted_roundtrip_through_pipeline() {
        let body = prepare_outbound("the plan is on", Some("secret123"), None).unwrap();
        let pipeline = pipeline(Some("secret123"));

        let result = pipeline
            .process(&body, Some("alice".to_string()), "k1".to_string())
            .unwrap();
        assert_eq!(result.kind, BodyKind::Decrypted);
        assert_eq!(result.body, "the plan is on");
        assert_eq!(result.sender.as_deref(), Some("alice"));
    }

    #[test]
    fn test_sender_embedded_inside_ciphertext() {
        let body = prepare_outbound("carol: the plan is on", Some("pw"), None).unwrap();
        let pipeline = pipeline(Some("pw"));

        let result = pipeline
            .process(&body, Some("outer".to_string()), "k1".to_string())
            .unwrap();
        assert_eq!(result.sender.as_deref(), Some("carol"));
        assert_eq!(result.body, "the plan is on");
    }

    #[test]
    fn test_wrong_password_yields_placeholder_not_ciphertext() {
        let body = prepare_outbound("secret", Some("password-a"), Some("bob")).unwrap();
        let pipeline = pipeline(Some("password-b"));

        let result = pipeline
            .process(&body, Some("alice".to_string()), "k1".to_string())
            .unwrap();
        assert_eq!(result.kind, BodyKind::Placeholder);
        assert_eq!(result.body, WRONG_PASSWORD_PLACEHOLDER);
        assert_eq!(result.sender.as_deref(), Some("alice"));
        assert_eq!(result.target_user.as_deref(), Some("bob"));
        assert!(!result.body.contains("encrypted\":"));
    }

    #[test]
    fn test_no_password_yields_distinct_placeholder() {
        let body = prepare_outbound("secret", Some("pw"), None).unwrap();
        let pipeline = pipeline(None);

        let result = pipeline
            .process(&body, None, "k1".to_string())
            .unwrap();
        assert_eq!(result.kind, BodyKind::Placeholder);
        assert_eq!(result.body, NO_PASSWORD_PLACEHOLDER);
    }

    #[test]
    fn test_duplicates_are_suppressed() {
        let pipeline = pipeline(None);
        assert!(pipeline
            .process("hello", None, "same-key".to_string())
            .is_some());
        assert!(pipeline
            .process("hello", None, "same-key".to_string())
            .is_none());
        // A different key is a different message
        assert!(pipeline
            .process("hello", None, "other-key".to_string())
            .is_some());
    }

    #[test]
    fn test_seen_window_is_bounded() {
        let mut seen = SeenSet::new();
        for i in 0..(MAX_SEEN_KEYS + 10) {
            assert!(seen.insert(format!("key-{i}")));
        }
        assert_eq!(seen.keys.len(), MAX_SEEN_KEYS);
        // The oldest keys were evicted, so they deliver again
        assert!(seen.insert("key-0".to_string()));
    }

    #[test]
    fn test_content_key_separates_fields() {
        // ("ab", "c") and ("a", "bc") must not collide
        assert_ne!(content_key(&["ab", "c"]), content_key(&["a", "bc"]));
        assert_eq!(content_key(&["a", "b"]), content_key(&["a", "b"]));
    }

    #[test]
    fn test_prepare_outbound_without_password_is_passthrough() {
        assert_eq!(prepare_outbound("hi", None, None).unwrap(), "hi");
    }
}
