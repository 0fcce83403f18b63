// BLE transport — peer discovery, auto-connect policy, GATT messaging
//
// The bridge delivers radio events into a single event-loop task; all peer
// table mutations happen there or behind its locks, since discovery and
// connection attempts interleave. Connection attempts are debounced so a
// burst of scan sightings does not storm the radio, and every connected
// device must prove it carries the application service and message
// characteristic before it counts as a peer.

use super::bridge::{
    AdapterState, Advertisement, BleBridgeEvent, BleError, BlePlatformBridge, GattService,
    LOCAL_NAME_PREFIX, MESSAGE_CHARACTERISTIC_UUID, SERVICE_UUID,
};
use super::codec;
use crate::message::types::BleMessage;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Weakest signal the low-confidence name heuristic will consider
const MIN_HEURISTIC_RSSI: i16 = -85;

/// Device-name fragments that mark a possible phone on platforms that hide
/// service UUIDs from scan responses. False positives are expected; GATT
/// verification sorts them out.
const MOBILE_NAME_PATTERNS: &[&str] = &[
    "android", "iphone", "ipad", "galaxy", "pixel", "sm-", "oneplus", "xiaomi", "redmi",
];

/// Transport lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Active,
    Stopping,
}

/// Connection lifecycle of a discovered peer. `Discovered` is re-entered on
/// every scan sighting regardless of prior state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
}

/// A remote device sighted by the scanner.
#[derive(Debug, Clone)]
pub struct BlePeer {
    /// Platform device/peripheral identifier
    pub id: String,
    /// Username parsed from the advertised local name, or the raw name
    pub display_name: Option<String>,
    pub rssi: i16,
    pub last_seen: Instant,
    pub state: PeerConnectionState,
    /// Sighted advertising our service UUID or local-name convention, as
    /// opposed to the low-confidence phone-name heuristic
    pub advertised_match: bool,
    /// GATT-verified: carries the application service and characteristic
    pub verified: bool,
}

/// How an advertisement qualified as a probable peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerMatch {
    /// Service UUID or `Roomcast-` local name — high confidence
    Advertised,
    /// Phone-name pattern within signal range — low confidence
    Heuristic,
}

/// Inbound message callback: (decoded message, source device id)
pub type MessageCallback = Arc<dyn Fn(BleMessage, String) + Send + Sync>;

/// Discovery callback, fired on every sighting upsert
pub type DiscoveryCallback = Arc<dyn Fn(BlePeer) + Send + Sync>;

/// Tunables for the auto-connect policy
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// Wait after a sighting before attempting a connection
    pub connect_debounce: Duration,
    /// Hard cap on a connection attempt — platform defaults hang silently
    pub connect_timeout: Duration,
    /// How long a device that failed verification is left alone
    pub verification_cooldown: Duration,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            connect_debounce: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(12),
            verification_cooldown: Duration::from_secs(30),
        }
    }
}

struct Inner {
    config: BleConfig,
    bridge: Arc<dyn BlePlatformBridge>,
    state: RwLock<ServiceState>,
    username: RwLock<String>,
    peers: RwLock<HashMap<String, BlePeer>>,
    connected: RwLock<HashSet<String>>,
    attempting: RwLock<HashSet<String>>,
    /// Device id → when verification last failed
    cooldowns: RwLock<HashMap<String, Instant>>,
    on_message: RwLock<Option<MessageCallback>>,
    on_discovery: RwLock<Option<DiscoveryCallback>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    /// Bumped on stop so in-flight attempts abandon without callbacks
    generation: AtomicU64,
}

/// BLE transport for point-to-point messaging when no shared network exists.
pub struct BleTransport {
    inner: Arc<Inner>,
}

impl BleTransport {
    pub fn new(bridge: Arc<dyn BlePlatformBridge>) -> Self {
        Self::with_config(bridge, BleConfig::default())
    }

    pub fn with_config(bridge: Arc<dyn BlePlatformBridge>, config: BleConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                bridge,
                state: RwLock::new(ServiceState::Stopped),
                username: RwLock::new(String::new()),
                peers: RwLock::new(HashMap::new()),
                connected: RwLock::new(HashSet::new()),
                attempting: RwLock::new(HashSet::new()),
                cooldowns: RwLock::new(HashMap::new()),
                on_message: RwLock::new(None),
                on_discovery: RwLock::new(None),
                event_task: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Register the inbound message handler. At most one; set replaces.
    pub fn set_on_message_received(&self, callback: MessageCallback) {
        *self.inner.on_message.write() = Some(callback);
    }

    /// Register the discovery handler. At most one; set replaces.
    pub fn set_on_device_discovered(&self, callback: DiscoveryCallback) {
        *self.inner.on_discovery.write() = Some(callback);
    }

    pub fn state(&self) -> ServiceState {
        *self.inner.state.read()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ServiceState::Active
    }

    /// Snapshot of the peer table
    pub fn peers(&self) -> Vec<BlePeer> {
        self.inner.peers.read().values().cloned().collect()
    }

    /// Device ids with a live, verified GATT connection
    pub fn connected_peer_ids(&self) -> Vec<String> {
        self.inner.connected.read().iter().cloned().collect()
    }

    /// Request permissions, verify the radio, start advertising
    /// `Roomcast-<username>` and scanning for the service UUID concurrently.
    ///
    /// Permission denial and a powered-off radio are distinct, fatal
    /// failures; everything after this runs on the event loop.
    pub async fn start(&self, username: &str) -> Result<(), BleError> {
        {
            let mut state = self.inner.state.write();
            if *state != ServiceState::Stopped {
                return Err(BleError::AlreadyRunning);
            }
            *state = ServiceState::Starting;
        }

        let receiver = match self.radio_setup(username).await {
            Ok(receiver) => receiver,
            Err(e) => {
                *self.inner.state.write() = ServiceState::Stopped;
                return Err(e);
            }
        };

        *self.inner.state.write() = ServiceState::Active;
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let task = tokio::spawn(Inner::event_loop(self.inner.clone(), receiver, generation));
        *self.inner.event_task.lock() = Some(task);

        info!("BLE transport active as {}{}", LOCAL_NAME_PREFIX, username);
        Ok(())
    }

    async fn radio_setup(
        &self,
        username: &str,
    ) -> Result<mpsc::UnboundedReceiver<BleBridgeEvent>, BleError> {
        let inner = &self.inner;

        if !inner.bridge.request_permissions().await? {
            return Err(BleError::PermissionDenied);
        }
        let adapter = inner.bridge.adapter_state().await;
        if adapter != AdapterState::PoweredOn {
            return Err(BleError::RadioUnavailable(adapter.to_string()));
        }

        *inner.username.write() = username.to_string();

        let (sender, receiver) = mpsc::unbounded_channel();
        inner.bridge.set_event_sender(sender);

        let local_name = format!("{LOCAL_NAME_PREFIX}{username}");
        inner
            .bridge
            .start_advertising(&local_name, SERVICE_UUID)
            .await?;
        inner.bridge.start_scan(SERVICE_UUID).await?;
        Ok(receiver)
    }

    /// Stop advertising and scanning, disconnect every peer, clear all
    /// discovered-peer state. Safe to call at any time; in-flight connection
    /// attempts are abandoned without their completion callbacks.
    pub async fn stop(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state.write();
            if *state == ServiceState::Stopped {
                return;
            }
            *state = ServiceState::Stopping;
        }

        inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = inner.event_task.lock().take() {
            task.abort();
        }

        let _ = inner.bridge.stop_scan().await;
        let _ = inner.bridge.stop_advertising().await;

        let connected: Vec<String> = inner.connected.read().iter().cloned().collect();
        for device_id in connected {
            let _ = inner.bridge.disconnect(&device_id).await;
        }

        inner.connected.write().clear();
        inner.peers.write().clear();
        inner.attempting.write().clear();
        inner.cooldowns.write().clear();
        *inner.state.write() = ServiceState::Stopped;
        info!("BLE transport stopped");
    }

    /// Write a message to every currently connected peer.
    ///
    /// Oversized text is rejected before any radio traffic. Writes are
    /// issued concurrently and fail in isolation: a peer whose write fails
    /// is dropped from the connected set, the others are unaffected.
    pub async fn send_message(&self, text: &str) -> Result<BleMessage, BleError> {
        let inner = &self.inner;
        if *inner.state.read() != ServiceState::Active {
            return Err(BleError::NotActive);
        }

        let username = inner.username.read().clone();
        let message = BleMessage::new(&username, text);
        let data = codec::encode_message(&message)?;

        let ids: Vec<String> = inner.connected.read().iter().cloned().collect();
        if ids.is_empty() {
            return Err(BleError::NoPeersConnected);
        }

        let writes = ids.into_iter().map(|device_id| {
            let bridge = inner.bridge.clone();
            let data = data.clone();
            async move {
                let result = bridge
                    .write(&device_id, MESSAGE_CHARACTERISTIC_UUID, &data)
                    .await;
                (device_id, result)
            }
        });

        for (device_id, result) in futures::future::join_all(writes).await {
            if let Err(e) = result {
                warn!("Write to {} failed, dropping connection: {}", device_id, e);
                let _ = inner.bridge.disconnect(&device_id).await;
                inner.connected.write().remove(&device_id);
                inner.set_peer_state(&device_id, PeerConnectionState::Disconnected);
            }
        }
        Ok(message)
    }
}

impl Inner {
    async fn event_loop(
        inner: Arc<Inner>,
        mut receiver: mpsc::UnboundedReceiver<BleBridgeEvent>,
        generation: u64,
    ) {
        while let Some(event) = receiver.recv().await {
            if !inner.is_current(generation) {
                break;
            }
            match event {
                BleBridgeEvent::DeviceDiscovered(advertisement) => {
                    Inner::handle_discovery(&inner, advertisement, generation);
                }
                BleBridgeEvent::CharacteristicUpdate { device_id, data } => {
                    inner.handle_update(&device_id, &data);
                }
                BleBridgeEvent::DeviceDisconnected { device_id } => {
                    inner.handle_peer_disconnect(&device_id);
                }
                BleBridgeEvent::AdapterStateChanged(state) => {
                    if state != AdapterState::PoweredOn {
                        warn!("Bluetooth adapter left PoweredOn: {}", state);
                    }
                }
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_peer_state(&self, device_id: &str, state: PeerConnectionState) {
        if let Some(peer) = self.peers.write().get_mut(device_id) {
            peer.state = state;
        }
    }

    fn handle_discovery(inner: &Arc<Inner>, advertisement: Advertisement, generation: u64) {
        let matched = match classify_advertisement(&advertisement) {
            Some(matched) => matched,
            None => {
                debug!("Ignoring scan result {}", advertisement.device_id);
                return;
            }
        };

        let peer = {
            let mut peers = inner.peers.write();
            let entry = peers
                .entry(advertisement.device_id.clone())
                .or_insert_with(|| BlePeer {
                    id: advertisement.device_id.clone(),
                    display_name: None,
                    rssi: advertisement.rssi,
                    last_seen: Instant::now(),
                    state: PeerConnectionState::Discovered,
                    advertised_match: false,
                    verified: false,
                });
            entry.last_seen = Instant::now();
            entry.rssi = advertisement.rssi;
            if let Some(name) = display_name(&advertisement) {
                entry.display_name = Some(name);
            }
            entry.state = PeerConnectionState::Discovered;
            entry.advertised_match |= matched == PeerMatch::Advertised;
            entry.clone()
        };

        debug!(
            "Sighted {} ({:?}, rssi {})",
            peer.id, peer.display_name, peer.rssi
        );
        if let Some(callback) = inner.on_discovery.read().clone() {
            callback(peer);
        }

        Inner::maybe_connect(inner, advertisement.device_id, generation);
    }

    /// Schedule a debounced connection attempt unless this device is already
    /// connected, mid-attempt, or cooling down after failed verification.
    fn maybe_connect(inner: &Arc<Inner>, device_id: String, generation: u64) {
        if *inner.state.read() != ServiceState::Active {
            return;
        }
        if inner.connected.read().contains(&device_id) {
            return;
        }
        if let Some(failed_at) = inner.cooldowns.read().get(&device_id) {
            if failed_at.elapsed() < inner.config.verification_cooldown {
                debug!("{} is cooling down, skipping connect", device_id);
                return;
            }
        }
        if !inner.attempting.write().insert(device_id.clone()) {
            return;
        }

        let inner = inner.clone();
        tokio::spawn(async move {
            inner.attempt_connection(device_id, generation).await;
        });
    }

    async fn attempt_connection(self: Arc<Self>, device_id: String, generation: u64) {
        tokio::time::sleep(self.config.connect_debounce).await;

        let result = self.connect_and_verify(&device_id, generation).await;
        self.attempting.write().remove(&device_id);

        match result {
            Ok(()) => {}
            Err(BleError::NotActive) => {
                // Stopped while in flight; abandon silently
            }
            Err(BleError::PeerVerificationFailure) => {
                warn!("{} lacks the application service, disconnected", device_id);
                self.cooldowns.write().insert(device_id.clone(), Instant::now());
                self.set_peer_state(&device_id, PeerConnectionState::Disconnected);
            }
            Err(e) => {
                debug!("Connection attempt to {} failed: {}", device_id, e);
                let _ = self.bridge.disconnect(&device_id).await;
                self.set_peer_state(&device_id, PeerConnectionState::Disconnected);
            }
        }
    }

    async fn connect_and_verify(&self, device_id: &str, generation: u64) -> Result<(), BleError> {
        if !self.is_current(generation) || *self.state.read() != ServiceState::Active {
            return Err(BleError::NotActive);
        }
        self.set_peer_state(device_id, PeerConnectionState::Connecting);

        match tokio::time::timeout(self.config.connect_timeout, self.bridge.connect(device_id))
            .await
        {
            Err(_) => {
                let _ = self.bridge.disconnect(device_id).await;
                return Err(BleError::ConnectTimeout);
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(())) => {}
        }

        if !self.is_current(generation) {
            let _ = self.bridge.disconnect(device_id).await;
            return Err(BleError::NotActive);
        }

        let services = self.bridge.discover_services(device_id).await?;
        if !has_expected_service(&services) {
            let _ = self.bridge.disconnect(device_id).await;
            return Err(BleError::PeerVerificationFailure);
        }

        self.bridge
            .subscribe(device_id, MESSAGE_CHARACTERISTIC_UUID)
            .await?;

        if !self.is_current(generation) {
            let _ = self.bridge.disconnect(device_id).await;
            return Err(BleError::NotActive);
        }

        {
            let mut peers = self.peers.write();
            if let Some(peer) = peers.get_mut(device_id) {
                peer.state = PeerConnectionState::Connected;
                peer.verified = true;
            }
        }
        self.connected.write().insert(device_id.to_string());
        info!("Connected to verified peer {}", device_id);
        Ok(())
    }

    fn handle_update(&self, device_id: &str, data: &[u8]) {
        let message = match codec::decode_message(data) {
            Ok(message) => message,
            Err(_) => {
                warn!("Discarding malformed characteristic payload from {}", device_id);
                return;
            }
        };
        if let Some(peer) = self.peers.write().get_mut(device_id) {
            peer.last_seen = Instant::now();
        }
        if let Some(callback) = self.on_message.read().clone() {
            callback(message, device_id.to_string());
        }
    }

    fn handle_peer_disconnect(&self, device_id: &str) {
        self.connected.write().remove(device_id);
        self.set_peer_state(device_id, PeerConnectionState::Disconnected);
        debug!("Peer {} disconnected", device_id);
    }
}

/// Decide whether a scan result is a probable application peer, and how
/// confidently.
fn classify_advertisement(advertisement: &Advertisement) -> Option<PeerMatch> {
    if advertisement
        .service_uuids
        .iter()
        .any(|uuid| uuid.eq_ignore_ascii_case(SERVICE_UUID))
    {
        return Some(PeerMatch::Advertised);
    }
    if let Some(name) = advertisement.local_name.as_deref() {
        if name.starts_with(LOCAL_NAME_PREFIX) {
            return Some(PeerMatch::Advertised);
        }
        if advertisement.rssi > MIN_HEURISTIC_RSSI {
            let lowered = name.to_lowercase();
            if MOBILE_NAME_PATTERNS
                .iter()
                .any(|pattern| lowered.contains(pattern))
            {
                return Some(PeerMatch::Heuristic);
            }
        }
    }
    None
}

fn display_name(advertisement: &Advertisement) -> Option<String> {
    let name = advertisement.local_name.as_deref()?;
    Some(
        name.strip_prefix(LOCAL_NAME_PREFIX)
            .unwrap_or(name)
            .to_string(),
    )
}

fn has_expected_service(services: &[GattService]) -> bool {
    services.iter().any(|service| {
        service.uuid.eq_ignore_ascii_case(SERVICE_UUID)
            && service
                .characteristics
                .iter()
                .any(|uuid| uuid.eq_ignore_ascii_case(MESSAGE_CHARACTERISTIC_UUID))
    })
}
