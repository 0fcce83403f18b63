// UDP broadcast transport — subnet fan-out with self-filtering
//
// One listening socket bound to the well-known port with address reuse, one
// lazily-created sender socket with SO_BROADCAST (separate sockets avoid
// self-bind races). Mobile stacks truncate or drop large broadcast
// datagrams, so the sender caps payloads pre-emptively and the receiver
// parses defensively, including a brace-repair pass for truncated JSON.

use crate::message::types::{BroadcastPacket, MAX_DATAGRAM_SIZE};
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Well-known broadcast port shared by all instances
pub const BROADCAST_PORT: u16 = 8081;

/// Subnet broadcast address
pub const BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::BROADCAST;

#[derive(Debug, Error, Clone)]
pub enum BroadcastError {
    #[error("failed to bind listening socket: {0}")]
    SocketBind(String),
    #[error("payload cannot be shrunk under {MAX_DATAGRAM_SIZE} bytes")]
    PayloadTooLarge,
    #[error("send failed: {0}")]
    Send(String),
}

/// Where a datagram came from, as handed to the message callback.
#[derive(Debug, Clone)]
pub struct SenderInfo {
    pub address: IpAddr,
    pub port: u16,
    /// Username from the envelope
    pub username: Option<String>,
    /// Sender-supplied timestamp from the envelope
    pub timestamp: Option<String>,
}

/// Message callback: (plain-or-cipher body, sender info).
pub type BroadcastCallback = Arc<dyn Fn(String, SenderInfo) + Send + Sync>;

/// Receive-side datagram processing, separated from the socket loop so it is
/// testable without network hardware.
struct DatagramHandler {
    own_ip: Option<IpAddr>,
    callback: Arc<RwLock<Option<BroadcastCallback>>>,
}

impl DatagramHandler {
    /// True when a source address is this device talking to itself.
    fn is_self(&self, source: IpAddr) -> bool {
        source.is_loopback() || Some(source) == self.own_ip
    }

    fn handle(&self, data: &[u8], from: SocketAddr) {
        if self.is_self(from.ip()) {
            debug!("Discarding own broadcast from {}", from);
            return;
        }

        let raw = String::from_utf8_lossy(data);
        let packet = match parse_datagram(&raw) {
            Some(packet) => packet,
            None => {
                warn!("Discarding malformed datagram from {} ({} bytes)", from, data.len());
                return;
            }
        };

        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            let info = SenderInfo {
                address: from.ip(),
                port: from.port(),
                username: Some(packet.username),
                timestamp: packet.timestamp,
            };
            callback(packet.message, info);
        }
    }
}

/// Parse a datagram into a `BroadcastPacket`, attempting truncation repair
/// before giving up. Returns None for anything unusable.
fn parse_datagram(raw: &str) -> Option<BroadcastPacket> {
    if let Ok(packet) = serde_json::from_str(raw) {
        return Some(packet);
    }
    repair_truncated_json(raw).and_then(|fixed| serde_json::from_str(&fixed).ok())
}

/// Best-effort repair of a platform-truncated JSON datagram: cut trailing
/// garbage after the last `}`, close a dangling string, balance braces.
fn repair_truncated_json(raw: &str) -> Option<String> {
    let start = raw.find('{')?;

    // Trailing garbage (NUL padding from fixed buffers) after complete JSON
    if let Some(end) = raw.rfind('}') {
        if end > start {
            let candidate = &raw[start..=end];
            if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
                return Some(candidate.to_string());
            }
        }
    }

    let mut repaired = raw[start..].trim_end().to_string();

    let mut in_string = false;
    let mut escaped = false;
    let mut depth = 0i32;
    for c in repaired.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => depth -= 1,
            _ => {}
        }
    }

    if depth <= 0 && !in_string {
        return None;
    }

    if in_string {
        repaired.push('"');
    }
    while repaired.ends_with(',') || repaired.ends_with(':') {
        repaired.pop();
    }
    for _ in 0..depth.max(0) {
        repaired.push('}');
    }
    Some(repaired)
}

/// Detect the IPv4 address the OS would route LAN traffic through.
///
/// A connected UDP socket never sends packets; it only asks the routing
/// table which local address would be used. Interfaces change between app
/// launches, so this runs on every `start_listening`.
async fn detect_local_ip() -> Option<IpAddr> {
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    probe.connect(("8.8.8.8", 80)).await.ok()?;
    probe.local_addr().ok().map(|addr| addr.ip())
}

/// UDP broadcast transport. `Idle -> Listening -> Idle`, plus an independent
/// sender socket usable in either state.
pub struct BroadcastTransport {
    port: u16,
    /// Where outbound datagrams go. Overridable for tests.
    target: SocketAddr,
    listen_task: Mutex<Option<JoinHandle<()>>>,
    listen_socket: Mutex<Option<Arc<UdpSocket>>>,
    sender_socket: tokio::sync::Mutex<Option<Arc<UdpSocket>>>,
    own_ip: Arc<RwLock<Option<IpAddr>>>,
    callback: Arc<RwLock<Option<BroadcastCallback>>>,
}

impl BroadcastTransport {
    pub fn new() -> Self {
        Self::with_port(BROADCAST_PORT)
    }

    /// Bind to a non-default port (tests, co-located instances).
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            target: SocketAddr::from((BROADCAST_ADDR, port)),
            listen_task: Mutex::new(None),
            listen_socket: Mutex::new(None),
            sender_socket: tokio::sync::Mutex::new(None),
            own_ip: Arc::new(RwLock::new(None)),
            callback: Arc::new(RwLock::new(None)),
        }
    }

    /// Redirect outbound datagrams, e.g. at a loopback listener in tests.
    pub fn set_target(&mut self, target: SocketAddr) {
        self.target = target;
    }

    pub fn is_listening(&self) -> bool {
        self.listen_task.lock().is_some()
    }

    /// The device IP detected at `start_listening` time, if any.
    pub fn detected_ip(&self) -> Option<IpAddr> {
        *self.own_ip.read()
    }

    /// The port the listening socket actually bound (differs from the
    /// configured port when binding port 0).
    pub fn local_port(&self) -> Option<u16> {
        self.listen_socket
            .lock()
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
            .map(|addr| addr.port())
    }

    /// Bind the listening socket and start delivering datagrams to
    /// `on_message`. Resolves once the socket is listening; idempotent while
    /// already listening.
    pub async fn start_listening(&self, on_message: BroadcastCallback) -> Result<(), BroadcastError> {
        if self.is_listening() {
            *self.callback.write() = Some(on_message);
            return Ok(());
        }

        let own_ip = detect_local_ip().await;
        if own_ip.is_none() {
            warn!("Could not detect local IP; only loopback traffic will be filtered");
        }
        *self.own_ip.write() = own_ip;

        let socket = bind_reusable(self.port).map_err(|e| BroadcastError::SocketBind(e.to_string()))?;
        let socket = Arc::new(socket);
        info!(
            "Broadcast listener bound on port {} (own ip: {:?})",
            self.local_port_of(&socket),
            own_ip
        );

        *self.callback.write() = Some(on_message);
        let handler = DatagramHandler {
            own_ip,
            callback: self.callback.clone(),
        };

        let recv_socket = socket.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((len, from)) => handler.handle(&buf[..len], from),
                    Err(e) => {
                        warn!("Broadcast receive error, stopping listener: {}", e);
                        break;
                    }
                }
            }
        });

        *self.listen_socket.lock() = Some(socket);
        *self.listen_task.lock() = Some(task);
        Ok(())
    }

    fn local_port_of(&self, socket: &UdpSocket) -> u16 {
        socket.local_addr().map(|a| a.port()).unwrap_or(self.port)
    }

    /// Close the listening socket. Idempotent; no callback fires after this
    /// returns. Safe to call while a receive is in flight.
    pub fn stop_listening(&self) {
        if let Some(task) = self.listen_task.lock().take() {
            task.abort();
            info!("Broadcast listener stopped");
        }
        *self.listen_socket.lock() = None;
        *self.callback.write() = None;
    }

    /// Serialize `{username, message, timestamp}` and send it to the subnet
    /// broadcast address. Payloads that cannot fit a single datagram are
    /// shrunk; a payload that cannot be shrunk enough is rejected.
    pub async fn send_broadcast(&self, message: &str, username: &str) -> Result<(), BroadcastError> {
        let packet = BroadcastPacket::new(username, message);
        let json = packet
            .to_capped_json()
            .map_err(|e| BroadcastError::Send(e.to_string()))?;
        if json.len() > MAX_DATAGRAM_SIZE {
            return Err(BroadcastError::PayloadTooLarge);
        }

        let socket = self.sender().await?;
        socket
            .send_to(json.as_bytes(), self.target)
            .await
            .map_err(|e| BroadcastError::Send(e.to_string()))?;
        debug!("Broadcast sent ({} bytes)", json.len());
        Ok(())
    }

    /// The shared sender socket, created on first use.
    async fn sender(&self) -> Result<Arc<UdpSocket>, BroadcastError> {
        let mut guard = self.sender_socket.lock().await;
        if let Some(socket) = guard.as_ref() {
            return Ok(socket.clone());
        }
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|e| BroadcastError::SocketBind(e.to_string()))?;
        socket
            .set_broadcast(true)
            .map_err(|e| BroadcastError::SocketBind(e.to_string()))?;
        let socket = Arc::new(socket);
        *guard = Some(socket.clone());
        Ok(socket)
    }

    /// Stop listening and release the sender socket.
    pub async fn cleanup(&self) {
        self.stop_listening();
        *self.sender_socket.lock().await = None;
    }
}

impl Default for BroadcastTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Bind a UDP socket with address reuse so a restarted instance (or a second
/// one on the same machine) can share the well-known port.
fn bind_reusable(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn handler_with_channel(
        own_ip: Option<IpAddr>,
    ) -> (DatagramHandler, mpsc::UnboundedReceiver<(String, SenderInfo)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: BroadcastCallback = Arc::new(move |body, info| {
            let _ = tx.send((body, info));
        });
        let handler = DatagramHandler {
            own_ip,
            callback: Arc::new(RwLock::new(Some(callback))),
        };
        (handler, rx)
    }

    fn from_addr(ip: &str) -> SocketAddr {
        SocketAddr::new(ip.parse().unwrap(), 8081)
    }

    #[test]
    fn test_valid_datagram_is_delivered() {
        let (handler, mut rx) = handler_with_channel(Some("192.168.1.10".parse().unwrap()));
        handler.handle(
            br#"{"username": "alice", "message": "hello"}"#,
            from_addr("192.168.1.20"),
        );

        let (body, info) = rx.try_recv().unwrap();
        assert_eq!(body, "hello");
        assert_eq!(info.username.as_deref(), Some("alice"));
        assert_eq!(info.address, "192.168.1.20".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_own_ip_is_filtered() {
        let (handler, mut rx) = handler_with_channel(Some("192.168.1.10".parse().unwrap()));
        handler.handle(
            br#"{"username": "alice", "message": "echo"}"#,
            from_addr("192.168.1.10"),
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_loopback_is_filtered() {
        let (handler, mut rx) = handler_with_channel(None);
        handler.handle(
            br#"{"username": "alice", "message": "echo"}"#,
            from_addr("127.0.0.1"),
        );
        handler.handle(
            br#"{"username": "alice", "message": "echo"}"#,
            from_addr("::1"),
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_malformed_datagram_is_dropped_without_panic() {
        let (handler, mut rx) = handler_with_channel(None);
        handler.handle(b"not json at all", from_addr("192.168.1.20"));
        handler.handle(br#"{"username": "no message field"}"#, from_addr("192.168.1.20"));
        handler.handle(&[0xFF, 0xFE, 0x00], from_addr("192.168.1.20"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_truncated_datagram_is_repaired() {
        // Missing final brace — the repair heuristic recovers it
        let (handler, mut rx) = handler_with_channel(None);
        handler.handle(
            br#"{"username": "alice", "message": "cut short""#,
            from_addr("192.168.1.20"),
        );
        let (body, info) = rx.try_recv().unwrap();
        assert_eq!(body, "cut short");
        assert_eq!(info.username.as_deref(), Some("alice"));
    }

    #[test]
    fn test_truncation_mid_string_is_repaired() {
        let (handler, mut rx) = handler_with_channel(None);
        handler.handle(
            br#"{"username": "alice", "message": "hel"#,
            from_addr("192.168.1.20"),
        );
        let (body, _) = rx.try_recv().unwrap();
        assert_eq!(body, "hel");
    }

    #[test]
    fn test_unrepairable_datagram_is_dropped() {
        // Truncated before the message field even starts — repair yields
        // JSON lacking required fields, so it is dropped, not delivered
        let (handler, mut rx) = handler_with_channel(None);
        handler.handle(br#"{"username": "ali"#, from_addr("192.168.1.20"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_trailing_padding_is_stripped() {
        let (handler, mut rx) = handler_with_channel(None);
        let mut data = br#"{"username": "alice", "message": "padded"}"#.to_vec();
        data.extend_from_slice(&[0u8; 16]);
        handler.handle(&data, from_addr("192.168.1.20"));
        let (body, _) = rx.try_recv().unwrap();
        assert_eq!(body, "padded");
    }

    #[test]
    fn test_repair_heuristic_direct() {
        assert_eq!(
            repair_truncated_json(r#"{"a": "b""#).as_deref(),
            Some(r#"{"a": "b"}"#)
        );
        // Already balanced and unparseable → nothing to repair
        assert!(repair_truncated_json(r#"{"a" "b"}"#).is_none());
        assert!(repair_truncated_json("no braces here").is_none());
    }

    #[tokio::test]
    async fn test_listen_lifecycle() {
        let transport = BroadcastTransport::with_port(0);
        assert!(!transport.is_listening());

        let callback: BroadcastCallback = Arc::new(|_, _| {});
        transport.start_listening(callback.clone()).await.unwrap();
        assert!(transport.is_listening());
        assert!(transport.local_port().is_some());

        // Idempotent second start
        transport.start_listening(callback).await.unwrap();
        assert!(transport.is_listening());

        transport.stop_listening();
        assert!(!transport.is_listening());
        // Idempotent second stop
        transport.stop_listening();
        assert!(!transport.is_listening());
    }

    #[tokio::test]
    async fn test_restart_rebinds() {
        let transport = BroadcastTransport::with_port(0);
        let callback: BroadcastCallback = Arc::new(|_, _| {});

        transport.start_listening(callback.clone()).await.unwrap();
        transport.stop_listening();
        transport.start_listening(callback).await.unwrap();
        assert!(transport.is_listening());
        transport.cleanup().await;
    }

    #[tokio::test]
    async fn test_send_reaches_a_listener_and_parses() {
        // Raw loopback listener standing in for a remote device
        let receiver = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let target = receiver.local_addr().unwrap();

        let mut transport = BroadcastTransport::with_port(0);
        transport.set_target(target);
        transport.send_broadcast("hello room", "alice").await.unwrap();

        let mut buf = vec![0u8; 2048];
        let (len, _) = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            receiver.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();

        let packet: BroadcastPacket = serde_json::from_str(
            std::str::from_utf8(&buf[..len]).unwrap(),
        )
        .unwrap();
        assert_eq!(packet.username, "alice");
        assert_eq!(packet.message, "hello room");
        transport.cleanup().await;
    }

    #[tokio::test]
    async fn test_oversized_send_is_shrunk_and_still_parses() {
        let receiver = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let target = receiver.local_addr().unwrap();

        let mut transport = BroadcastTransport::with_port(0);
        transport.set_target(target);
        let long_message = "z".repeat(5000);
        transport.send_broadcast(&long_message, "alice").await.unwrap();

        let mut buf = vec![0u8; 65536];
        let (len, _) = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            receiver.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(len <= MAX_DATAGRAM_SIZE);
        let packet: BroadcastPacket = serde_json::from_str(
            std::str::from_utf8(&buf[..len]).unwrap(),
        )
        .unwrap();
        assert_eq!(packet.username, "alice");
        assert!(!packet.message.is_empty());
    }
}
