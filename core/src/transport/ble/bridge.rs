// Platform bridge for the BLE radio
//
// The core never touches the radio directly. Platform glue (CoreBluetooth,
// Android BLE, BlueZ) implements this trait; hardware events flow back
// through a channel into the transport's single event loop, so every
// peer-table mutation happens on one task. All of the protocol logic is
// testable without BLE hardware.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

/// Fixed application service UUID — peers recognize each other by this
pub const SERVICE_UUID: &str = "8a1c9e04-7d2b-4d6f-9b7a-5e3f1c2d8a46";

/// Message characteristic: readable/writable/notifiable, UTF-8 JSON payload
pub const MESSAGE_CHARACTERISTIC_UUID: &str = "8a1c9e04-7d2b-4d6f-9b7a-5e3f1c2d8a47";

/// Read-only username characteristic
pub const USERNAME_CHARACTERISTIC_UUID: &str = "8a1c9e04-7d2b-4d6f-9b7a-5e3f1c2d8a48";

/// Advertised local-name prefix: `Roomcast-<username>`
pub const LOCAL_NAME_PREFIX: &str = "Roomcast-";

/// Errors for BLE operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("bluetooth permissions denied")]
    PermissionDenied,
    #[error("bluetooth radio unavailable: {0}")]
    RadioUnavailable(String),
    #[error("transport is not active")]
    NotActive,
    #[error("transport is already running")]
    AlreadyRunning,
    #[error("connection attempt timed out")]
    ConnectTimeout,
    #[error("connected device lacks the expected service or characteristic")]
    PeerVerificationFailure,
    #[error("payload of {0} bytes exceeds the characteristic limit")]
    PayloadTooLarge(usize),
    #[error("malformed characteristic payload")]
    MalformedPayload,
    #[error("no connected peers")]
    NoPeersConnected,
    #[error("platform bridge error: {0}")]
    Bridge(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// Radio power/authorization state as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
    Unknown,
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterState::PoweredOn => write!(f, "PoweredOn"),
            AdapterState::PoweredOff => write!(f, "PoweredOff"),
            AdapterState::Unauthorized => write!(f, "Unauthorized"),
            AdapterState::Unsupported => write!(f, "Unsupported"),
            AdapterState::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A GATT service reported by discovery on a connected device
#[derive(Debug, Clone)]
pub struct GattService {
    pub uuid: String,
    /// Characteristic UUIDs under this service
    pub characteristics: Vec<String>,
}

/// One scan sighting
#[derive(Debug, Clone)]
pub struct Advertisement {
    /// Platform device/peripheral identifier
    pub device_id: String,
    pub local_name: Option<String>,
    /// Signal strength in dBm
    pub rssi: i16,
    /// Service UUIDs carried in the advertisement, if any
    pub service_uuids: Vec<String>,
}

/// Events pushed by platform glue into the transport event loop
#[derive(Debug, Clone)]
pub enum BleBridgeEvent {
    DeviceDiscovered(Advertisement),
    /// Notification/indication on the message characteristic
    CharacteristicUpdate { device_id: String, data: Vec<u8> },
    DeviceDisconnected { device_id: String },
    AdapterStateChanged(AdapterState),
}

/// Platform-specific BLE API abstraction.
///
/// Implementers provide the actual radio operations; the transport drives
/// them and owns all connection policy. Operations are individually
/// fallible — a failure against one device must not affect others.
#[async_trait]
pub trait BlePlatformBridge: Send + Sync {
    /// Current radio state
    async fn adapter_state(&self) -> AdapterState;

    /// Negotiate BLE/location permissions. False means denied.
    async fn request_permissions(&self) -> Result<bool, BleError>;

    /// Advertise the service UUID with the given local name
    async fn start_advertising(&self, local_name: &str, service_uuid: &str)
        -> Result<(), BleError>;

    async fn stop_advertising(&self) -> Result<(), BleError>;

    /// Scan for peripherals advertising the service UUID. Platforms that
    /// cannot filter by UUID may deliver everything; the transport filters.
    async fn start_scan(&self, service_uuid: &str) -> Result<(), BleError>;

    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Open a GATT connection. The transport applies its own timeout on top.
    async fn connect(&self, device_id: &str) -> Result<(), BleError>;

    /// Enumerate GATT services and characteristics on a connected device
    async fn discover_services(&self, device_id: &str) -> Result<Vec<GattService>, BleError>;

    /// Subscribe to notifications on a characteristic
    async fn subscribe(&self, device_id: &str, characteristic_uuid: &str)
        -> Result<(), BleError>;

    /// Write to a characteristic on a connected device
    async fn write(
        &self,
        device_id: &str,
        characteristic_uuid: &str,
        data: &[u8],
    ) -> Result<(), BleError>;

    async fn disconnect(&self, device_id: &str) -> Result<(), BleError>;

    /// Register the channel bridge events flow through. Called on every
    /// transport start; replaces any previous sender.
    fn set_event_sender(&self, sender: UnboundedSender<BleBridgeEvent>);
}

// ============================================================================
// MOCK BRIDGE (for tests)
// ============================================================================
