// Wire types — what actually crosses the network on each transport

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Conservative MTU-safe ceiling for a single broadcast datagram.
/// Fragmented broadcast UDP is unreliable on mobile stacks, so payloads are
/// shrunk to fit instead.
pub const MAX_DATAGRAM_SIZE: usize = 1400;

/// The UDP broadcast envelope.
///
/// `username` and `message` are required on receive; everything else is
/// optional so older senders still parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastPacket {
    pub username: String,
    pub message: String,
    /// Sender-supplied ISO-8601 timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Hardware address hint — first field dropped when shrinking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

impl BroadcastPacket {
    /// Create a packet stamped with the current time.
    pub fn new(username: &str, message: &str) -> Self {
        Self {
            username: username.to_string(),
            message: message.to_string(),
            timestamp: Some(Utc::now().to_rfc3339()),
            mac: None,
        }
    }

    /// Serialize to JSON, shrinking the payload until it fits a single
    /// datagram: drop `mac` first, then truncate the message body on a char
    /// boundary. Never fragments, never drops the packet outright.
    pub fn to_capped_json(&self) -> serde_json::Result<String> {
        let mut packet = self.clone();
        let mut json = serde_json::to_string(&packet)?;
        if json.len() <= MAX_DATAGRAM_SIZE {
            return Ok(json);
        }

        packet.mac = None;
        json = serde_json::to_string(&packet)?;

        while json.len() > MAX_DATAGRAM_SIZE && !packet.message.is_empty() {
            let overshoot = json.len() - MAX_DATAGRAM_SIZE;
            let mut cut = packet.message.len().saturating_sub(overshoot.max(1));
            while cut > 0 && !packet.message.is_char_boundary(cut) {
                cut -= 1;
            }
            packet.message.truncate(cut);
            json = serde_json::to_string(&packet)?;
        }

        Ok(json)
    }
}

/// The BLE message characteristic payload: UTF-8 JSON on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleMessage {
    /// Unique message ID (UUID v4) — also the deduplication key
    pub id: String,
    pub message: String,
    pub sender: String,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
}

impl BleMessage {
    /// Create a message stamped with the current time.
    pub fn new(sender: &str, message: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message: message.to_string(),
            sender: sender.to_string(),
            timestamp: Utc::now().timestamp_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_packet_passes_through() {
        let packet = BroadcastPacket::new("alice", "hello");
        let json = packet.to_capped_json().unwrap();
        assert!(json.len() <= MAX_DATAGRAM_SIZE);

        let parsed: BroadcastPacket = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.username, "alice");
        assert_eq!(parsed.message, "hello");
        assert!(parsed.timestamp.is_some());
    }

    #[test]
    fn test_oversized_packet_is_shrunk_not_fragmented() {
        let mut packet = BroadcastPacket::new("alice", &"x".repeat(5000));
        packet.mac = Some("aa:bb:cc:dd:ee:ff".to_string());

        let json = packet.to_capped_json().unwrap();
        assert!(json.len() <= MAX_DATAGRAM_SIZE);

        // Still parses, and the shrink dropped mac before cutting the body
        let parsed: BroadcastPacket = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.username, "alice");
        assert!(parsed.mac.is_none());
        assert!(!parsed.message.is_empty());
        assert!(parsed.message.chars().all(|c| c == 'x'));
    }

    #[test]
    fn test_shrink_respects_char_boundaries() {
        // Multibyte payload must not be cut mid-codepoint
        let packet = BroadcastPacket::new("alice", &"héllo wörld ".repeat(400));
        let json = packet.to_capped_json().unwrap();
        assert!(json.len() <= MAX_DATAGRAM_SIZE);
        let parsed: BroadcastPacket = serde_json::from_str(&json).unwrap();
        assert!(!parsed.message.is_empty());
    }

    #[test]
    fn test_packet_without_optional_fields_parses() {
        let parsed: BroadcastPacket =
            serde_json::from_str(r#"{"username": "bob", "message": "hi"}"#).unwrap();
        assert_eq!(parsed.username, "bob");
        assert!(parsed.timestamp.is_none());
        assert!(parsed.mac.is_none());
    }

    #[test]
    fn test_ble_message_has_fresh_id() {
        let a = BleMessage::new("alice", "hi");
        let b = BleMessage::new("alice", "hi");
        assert_ne!(a.id, b.id);
        assert!(a.timestamp > 0);
    }
}
