// Transport module — UDP broadcast and BLE GATT

pub mod ble;
pub mod broadcast;

pub use ble::{
    BleConfig, BleError, BlePeer, BlePlatformBridge, BleTransport, PeerConnectionState,
    ServiceState,
};
pub use broadcast::{
    BroadcastCallback, BroadcastError, BroadcastTransport, SenderInfo, BROADCAST_PORT,
};
