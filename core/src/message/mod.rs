// Message module — wire types and envelope parsing shared by both transports

pub mod envelope;
pub mod types;

pub use envelope::{extract_sender_and_body, ExtractedMessage};
pub use types::{BleMessage, BroadcastPacket, MAX_DATAGRAM_SIZE};
