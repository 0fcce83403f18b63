// Message characteristic codec — UTF-8 JSON with a conservative size cap

use super::bridge::BleError;
use crate::message::types::BleMessage;

/// Conservative cap on the message text carried in one characteristic
/// write/notification. The negotiated MTU bounds the real limit; anything
/// over this is rejected before the write, never silently truncated.
pub const MAX_BLE_PAYLOAD: usize = 200;

/// Serialize a message for the characteristic. Rejects oversized text with
/// `PayloadTooLarge` before any radio traffic happens.
pub fn encode_message(message: &BleMessage) -> Result<Vec<u8>, BleError> {
    if message.message.len() > MAX_BLE_PAYLOAD {
        return Err(BleError::PayloadTooLarge(message.message.len()));
    }
    serde_json::to_vec(message).map_err(|_| BleError::MalformedPayload)
}

/// Decode a characteristic update back into a message. Anything that is not
/// UTF-8 JSON with the expected fields is `MalformedPayload` — callers drop
/// it and keep listening.
pub fn decode_message(data: &[u8]) -> Result<BleMessage, BleError> {
    serde_json::from_slice(data).map_err(|_| BleError::MalformedPayload)
}
