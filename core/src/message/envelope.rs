// Sender/body extraction — tolerant of three wire generations
//
// The two transports evolved independently, so an inbound body can be:
// (1) structured JSON with a `message` field, (2) the older "name: body"
// textual convention, or (3) bare text from a sender that predates both.

use serde_json::Value;

/// Longest sender name the textual convention accepts
const MAX_TEXTUAL_SENDER_LEN: usize = 64;

/// A raw payload split into sender metadata and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedMessage {
    pub sender: Option<String>,
    pub body: String,
}

/// Split a raw transport payload into `{sender?, body}`.
///
/// JSON objects carrying a string `message` field win, taking the sender
/// from `username`/`user`/`from`. JSON objects WITHOUT a `message` field are
/// returned whole — a bare `CipherPayload` must reach the decryption stage
/// intact, not be mangled by the textual fallback. Everything else goes
/// through the `"name: body"` match, then falls back to raw text.
pub fn extract_sender_and_body(raw: &str) -> ExtractedMessage {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        if let Value::Object(obj) = value {
            if let Some(message) = obj.get("message").and_then(Value::as_str) {
                let sender = ["username", "user", "from"]
                    .iter()
                    .find_map(|key| obj.get(*key).and_then(Value::as_str))
                    .map(str::to_string);
                return ExtractedMessage {
                    sender,
                    body: message.to_string(),
                };
            }
            return ExtractedMessage {
                sender: None,
                body: raw.to_string(),
            };
        }
    }

    if let Some((name, rest)) = raw.split_once(':') {
        let name = name.trim();
        let body = rest.trim_start();
        if !name.is_empty() && name.len() <= MAX_TEXTUAL_SENDER_LEN && !body.is_empty() {
            return ExtractedMessage {
                sender: Some(name.to_string()),
                body: body.to_string(),
            };
        }
    }

    ExtractedMessage {
        sender: None,
        body: raw.to_string(),
    }
}
