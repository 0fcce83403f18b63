// Roomcast core — serverless room-scale messaging
//
// UDP broadcast when devices share a network, BLE GATT when they don't,
// optional password-derived encryption on both. The host application owns
// persistence, identity and UI; this crate owns the transports and crypto.

pub mod crypto;
pub mod message;
pub mod session;
pub mod store;
pub mod transport;

pub use crypto::{CipherPayload, CryptoError};
pub use message::{extract_sender_and_body, BleMessage, BroadcastPacket};
pub use session::{
    content_key, prepare_outbound, BodyKind, InboundPipeline, IncomingMessage, LocalIdentity,
    NO_PASSWORD_PLACEHOLDER, WRONG_PASSWORD_PLACEHOLDER,
};
pub use store::{MemoryStore, MessageStore, StoredMessage};
pub use transport::{
    BleError, BlePeer, BleTransport, BroadcastError, BroadcastTransport, PeerConnectionState,
    SenderInfo,
};
