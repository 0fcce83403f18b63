/// BLE (Bluetooth Low Energy) Transport Module
///
/// Protocol-level logic for BLE GATT messaging: discovery classification,
/// the auto-connect policy, GATT service verification, and the message
/// characteristic codec. Platform glue (CoreBluetooth, Android BLE, BlueZ)
/// implements `BlePlatformBridge` and handles the actual radio; everything
/// here is testable without BLE hardware.

pub mod bridge;
pub mod codec;
pub mod transport;

pub use bridge::{
    AdapterState, Advertisement, BleBridgeEvent, BleError, BlePlatformBridge, GattService,
    LOCAL_NAME_PREFIX, MESSAGE_CHARACTERISTIC_UUID, SERVICE_UUID, USERNAME_CHARACTERISTIC_UUID,
};
pub use codec::{decode_message, encode_message, MAX_BLE_PAYLOAD};
pub use transport::{
    BleConfig, BlePeer, BleTransport, DiscoveryCallback, MessageCallback, PeerConnectionState,
    ServiceState,
};
