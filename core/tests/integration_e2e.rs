//! End-to-End Integration Tests for Roomcast
//!
//! These tests verify the complete message flow across layers:
//! 1. Outbound encryption and envelope serialization
//! 2. The UDP wire format, including size capping
//! 3. Inbound extraction, decryption and placeholder handling
//! 4. Persistence through the store seam
//!
//! Run with: cargo test --test integration_e2e

use roomcast_core::message::MAX_DATAGRAM_SIZE;
use roomcast_core::store::{MemoryStore, MessageStore, StoredMessage};
use roomcast_core::{
    content_key, prepare_outbound, BodyKind, BroadcastPacket, InboundPipeline, LocalIdentity,
    WRONG_PASSWORD_PLACEHOLDER,
};

/// One simulated receiving device: a pipeline plus a store.
struct Device {
    pipeline: InboundPipeline,
    store: MemoryStore,
}

impl Device {
    fn new(username: &str, password: Option<&str>) -> Self {
        Self {
            pipeline: InboundPipeline::new(LocalIdentity::new(username, password)),
            store: MemoryStore::new(),
        }
    }

    /// What a broadcast listener does with a datagram body.
    fn receive(&self, wire: &str) -> Option<String> {
        let packet: BroadcastPacket = serde_json::from_str(wire).expect("valid wire JSON");
        let key = content_key(&[
            &packet.username,
            packet.timestamp.as_deref().unwrap_or(""),
            &packet.message,
        ]);
        let incoming = self
            .pipeline
            .process(&packet.message, Some(packet.username), key)?;

        self.store
            .save(&StoredMessage::received(
                incoming.sender.as_deref().unwrap_or("unknown"),
                &incoming.body,
                None,
            ))
            .expect("store accepts message");
        Some(incoming.body)
    }
}

#[test]
fn test_e2e_password_scenario_three_devices() {
    // Device A encrypts "hello" for the shared password and broadcasts it.
    let body = prepare_outbound("hello", Some("secret123"), None).expect("encryption works");
    let packet = BroadcastPacket::new("alice", &body);
    let wire = packet.to_capped_json().expect("serializes");

    // Device B shares the password and reads the plaintext.
    let device_b = Device::new("bob", Some("secret123"));
    assert_eq!(device_b.receive(&wire).as_deref(), Some("hello"));
    let stored = device_b.store.list().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].message, "hello");
    assert_eq!(stored[0].sender, "alice");

    // Device C has a different password: placeholder, never plaintext or
    // raw ciphertext.
    let device_c = Device::new("carol", Some("hunter2"));
    let shown = device_c.receive(&wire).expect("still delivered");
    assert_eq!(shown, WRONG_PASSWORD_PLACEHOLDER);
    assert!(!shown.contains("hello"));
    let stored = device_c.store.list().unwrap();
    assert!(!stored[0].message.contains("authTag"));
}

#[test]
fn test_e2e_plaintext_broadcast_roundtrip() {
    let packet = BroadcastPacket::new("alice", "lunch at noon?");
    let wire = packet.to_capped_json().unwrap();

    let device = Device::new("bob", None);
    assert_eq!(device.receive(&wire).as_deref(), Some("lunch at noon?"));
}

#[test]
fn test_e2e_duplicate_datagram_is_delivered_once() {
    let packet = BroadcastPacket::new("alice", "only once please");
    let wire = packet.to_capped_json().unwrap();

    let device = Device::new("bob", None);
    assert!(device.receive(&wire).is_some());
    assert!(device.receive(&wire).is_none());
    assert_eq!(device.store.list().unwrap().len(), 1);
}

#[test]
fn test_e2e_oversized_encrypted_broadcast_stays_under_mtu() {
    // A long plaintext inflates through encryption and base64; the wire
    // format must still cap the datagram and the receiver must not panic.
    let long_plaintext = "roger ".repeat(100);
    let body = prepare_outbound(&long_plaintext, Some("pw"), None).unwrap();
    let packet = BroadcastPacket::new("alice", &body);
    let wire = packet.to_capped_json().unwrap();
    assert!(wire.len() <= MAX_DATAGRAM_SIZE);

    // Capping truncated the ciphertext JSON, so it no longer parses as a
    // cipher payload; the receiver treats it as opaque text rather than
    // crashing or mis-decrypting.
    let device = Device::new("bob", Some("pw"));
    assert!(device.receive(&wire).is_some());
}

#[test]
fn test_e2e_encrypted_message_with_embedded_sender() {
    // Sender identity inside the ciphertext, nothing useful outside
    let body = prepare_outbound("alice: code green", Some("pw"), Some("bob")).unwrap();
    let packet = BroadcastPacket::new("anon", &body);
    let wire = packet.to_capped_json().unwrap();

    let device = Device::new("bob", Some("pw"));
    let packet: BroadcastPacket = serde_json::from_str(&wire).unwrap();
    let incoming = device
        .pipeline
        .process(&packet.message, Some(packet.username), "k".to_string())
        .unwrap();

    assert_eq!(incoming.kind, BodyKind::Decrypted);
    assert_eq!(incoming.sender.as_deref(), Some("alice"));
    assert_eq!(incoming.body, "code green");
    assert_eq!(incoming.target_user.as_deref(), Some("bob"));
}
