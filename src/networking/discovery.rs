use log::{debug, error, info, trace, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::error::DiscoveryError;
use super::events::EventSink;
use super::interface;

/// Prefix of every announcement datagram
pub const DISCOVERY_MAGIC: &str = "SHAREIT_DISCOVERY";
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 0, 0, 1);
pub const DEFAULT_MULTICAST_PORT: u16 = 9999;
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2);
pub const PEER_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_DATAGRAM_SIZE: usize = 1024;
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Multicast discovery settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    pub announce_interval: Duration,
    /// Peers not heard from for this long are dropped. Also the sweep period.
    pub peer_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            multicast_group: DEFAULT_MULTICAST_GROUP,
            multicast_port: DEFAULT_MULTICAST_PORT,
            announce_interval: ANNOUNCE_INTERVAL,
            peer_timeout: PEER_TIMEOUT,
        }
    }
}

impl DiscoveryConfig {
    pub fn group_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.multicast_group, self.multicast_port)
    }
}

/// Build the announcement for `address`
pub fn encode_announcement(address: &str) -> String {
    format!("{}|{}", DISCOVERY_MAGIC, address)
}

/// Extract the announced address, or `None` for anything that is not an
/// announcement.
pub fn parse_announcement(datagram: &[u8]) -> Option<&str> {
    let message = std::str::from_utf8(datagram).ok()?;
    let mut parts = message.split('|');
    if parts.next()? != DISCOVERY_MAGIC {
        return None;
    }
    let address = parts.next()?;
    if address.is_empty() || parts.next().is_some() {
        return None;
    }
    Some(address)
}

/// A peer as seen by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub address: String,
    pub last_seen: Instant,
}

/// Peers heard from within the timeout window, keyed by address.
///
/// The lock is only held for the map operation and the snapshot taken for
/// the change callback.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, Instant>>,
    timeout: Duration,
}

impl PeerRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an announcement from `address` at `now`.
    ///
    /// Calls `on_new` with the full address list only when the address was
    /// not yet known. Returns whether it was new.
    pub fn observe<F>(&self, address: &str, now: Instant, on_new: F) -> bool
    where
        F: FnOnce(Vec<String>),
    {
        let mut peers = self.lock();
        let is_new = peers.insert(address.to_string(), now).is_none();
        if is_new {
            on_new(peers.keys().cloned().collect());
        }
        is_new
    }

    /// Drop every peer whose last announcement is older than the timeout.
    ///
    /// Calls `on_shrunk` once with the remaining addresses if anything was
    /// removed. Returns the number removed.
    pub fn sweep<F>(&self, now: Instant, on_shrunk: F) -> usize
    where
        F: FnOnce(Vec<String>),
    {
        let mut peers = self.lock();
        let before = peers.len();
        peers.retain(|address, last_seen| {
            let expired = now.saturating_duration_since(*last_seen) > self.timeout;
            if expired {
                info!("Peer timed out and was removed: {}", address);
            }
            !expired
        });

        let removed = before - peers.len();
        if removed > 0 {
            on_shrunk(peers.keys().cloned().collect());
        }
        removed
    }

    pub fn addresses(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.lock()
            .iter()
            .map(|(address, last_seen)| PeerRecord {
                address: address.clone(),
                last_seen: *last_seen,
            })
            .collect()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.lock().contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Multicast peer discovery: announces this node and tracks the others
pub struct PeerDiscovery {
    config: DiscoveryConfig,
    self_address: String,
    registry: Arc<PeerRegistry>,
    events: EventSink,
}

impl PeerDiscovery {
    /// `self_address` is the `host:port` peers should connect to
    pub fn new(
        config: DiscoveryConfig,
        self_address: impl Into<String>,
        events: EventSink,
    ) -> Self {
        let registry = Arc::new(PeerRegistry::new(config.peer_timeout));
        Self {
            config,
            self_address: self_address.into(),
            registry,
            events,
        }
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        self.registry.clone()
    }

    pub fn self_address(&self) -> &str {
        &self.self_address
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Spawn the announce and listen loops
    pub fn start(self: &Arc<Self>, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let announcer = self.clone();
        let announce_token = shutdown.clone();
        let listener = self.clone();
        let listen_token = shutdown.clone();

        vec![
            tokio::spawn(async move { announcer.announce(announce_token).await }),
            tokio::spawn(async move { listener.listen(listen_token).await }),
        ]
    }

    /// Handle one received datagram. Returns true if it introduced a new peer.
    pub fn handle_datagram(&self, datagram: &[u8], now: Instant) -> bool {
        let Some(address) = parse_announcement(datagram) else {
            trace!("Ignoring unrelated multicast datagram ({} bytes)", datagram.len());
            return false;
        };

        if address == self.self_address {
            trace!("Ignoring own announcement from {}", address);
            return false;
        }

        let events = &self.events;
        self.registry.observe(address, now, |peers| {
            info!("New peer found: {}", address);
            events.peers_changed(peers);
        })
    }

    /// Evict stale peers, emitting a peer list if the set shrank
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let events = &self.events;
        self.registry.sweep(now, |peers| events.peers_changed(peers))
    }

    /// Send an announcement every `announce_interval` until cancelled.
    /// Send failures are logged and retried on the next tick.
    pub async fn announce(&self, shutdown: CancellationToken) {
        let socket = match bind_announcer().await {
            Ok(socket) => socket,
            Err(e) => {
                error!("Failed to create announce socket: {}", e);
                self.events.notice(format!("Discovery announcements disabled: {}", e));
                return;
            }
        };

        let message = encode_announcement(&self.self_address);
        let target = SocketAddr::V4(self.config.group_addr());
        info!("Starting to announce my address ({}) on {}", self.self_address, target);

        let mut ticker = time::interval(self.config.announce_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Stopping announcements");
                    break;
                }
                _ = ticker.tick() => {
                    match socket.send_to(message.as_bytes(), target).await {
                        Ok(_) => trace!("Sent announcement to {}", target),
                        Err(e) => warn!("{}", DiscoveryError::AnnounceSend(e)),
                    }
                }
            }
        }
    }

    /// Receive announcements and sweep stale peers until cancelled
    pub async fn listen(&self, shutdown: CancellationToken) {
        let socket = match self.bind_listener().await {
            Ok(socket) => socket,
            Err(e) => {
                error!("Failed to listen for peer announcements: {}", e);
                self.events.notice(format!("Peer discovery disabled: {}", e));
                return;
            }
        };
        info!("Listening for peer announcements on {}", self.config.group_addr());

        let receive = async {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((n, from)) => {
                            debug!(
                                "Received multicast message from {}: {:?}",
                                from,
                                String::from_utf8_lossy(&buf[..n])
                            );
                            self.handle_datagram(&buf[..n], Instant::now());
                        }
                        Err(e) => {
                            warn!("Error reading from multicast socket: {}", e);
                            time::sleep(RECEIVE_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        };

        let sweep = async {
            let period = self.config.peer_timeout;
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep_expired(Instant::now());
                    }
                }
            }
        };

        tokio::join!(receive, sweep);
        info!("Stopped listening for peer announcements");
    }

    async fn bind_listener(&self) -> Result<UdpSocket, DiscoveryError> {
        let group = self.config.multicast_group;
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

        // Several instances on one host share the port
        socket.set_reuse_address(true)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true)?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.config.multicast_port);
        socket.bind(&SockAddr::from(bind_addr))?;

        let interfaces = interface::multicast_interfaces().unwrap_or_else(|e| {
            warn!("Failed to enumerate network interfaces: {}", e);
            Vec::new()
        });

        let mut joined = 0;
        for iface in &interfaces {
            match socket.join_multicast_v4(&group, &iface.ip) {
                Ok(()) => {
                    info!("Joined multicast group {} on interface {}", group, iface.name);
                    joined += 1;
                }
                Err(e) => debug!("Could not join {} on {}: {}", group, iface.name, e),
            }
        }

        if joined == 0 {
            warn!("Could not join multicast group on any suitable interface. Discovery may not work.");
            self.events
                .notice("Could not join the discovery group on any interface; this node is not discoverable");
        }

        if let Err(e) = socket.set_multicast_loop_v4(true) {
            warn!("Could not enable multicast loopback: {}", e);
        }

        socket.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(socket.into())?)
    }
}

async fn bind_announcer() -> Result<UdpSocket, DiscoveryError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_multicast_loop_v4(true)?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::events::AppEvent;
    use tokio::sync::mpsc::UnboundedReceiver;

    const SELF_ADDR: &str = "192.168.1.10:8000";

    fn discovery() -> (PeerDiscovery, UnboundedReceiver<AppEvent>) {
        let (events, rx) = EventSink::channel();
        (PeerDiscovery::new(DiscoveryConfig::default(), SELF_ADDR, events), rx)
    }

    fn peer_events(rx: &mut UnboundedReceiver<AppEvent>) -> Vec<Vec<String>> {
        let mut lists = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AppEvent::PeersChanged { mut peer_addresses } = event {
                peer_addresses.sort();
                lists.push(peer_addresses);
            }
        }
        lists
    }

    #[test]
    fn test_parse_announcement() {
        assert_eq!(
            parse_announcement(b"SHAREIT_DISCOVERY|10.0.0.5:8000"),
            Some("10.0.0.5:8000")
        );
        assert_eq!(encode_announcement("10.0.0.5:8000"), "SHAREIT_DISCOVERY|10.0.0.5:8000");
        assert_eq!(parse_announcement(b"OTHER_APP|10.0.0.5:8000"), None);
        assert_eq!(parse_announcement(b"SHAREIT_DISCOVERY"), None);
        assert_eq!(parse_announcement(b"SHAREIT_DISCOVERY|"), None);
        assert_eq!(parse_announcement(b"SHAREIT_DISCOVERY|a|b"), None);
        assert_eq!(parse_announcement(b"SHAREIT_DISCOVERYX|10.0.0.5:8000"), None);
        assert_eq!(parse_announcement(&[0xff, 0xfe, b'|']), None);
    }

    #[test]
    fn test_new_peer_fires_event_refresh_does_not() {
        let (discovery, mut rx) = discovery();
        let now = Instant::now();

        assert!(discovery.handle_datagram(b"SHAREIT_DISCOVERY|10.0.0.2:8000", now));
        let later = now + Duration::from_secs(1);
        assert!(!discovery.handle_datagram(b"SHAREIT_DISCOVERY|10.0.0.2:8000", later));
        assert!(discovery.handle_datagram(b"SHAREIT_DISCOVERY|10.0.0.3:8000", now));

        assert_eq!(
            peer_events(&mut rx),
            vec![
                vec!["10.0.0.2:8000".to_string()],
                vec!["10.0.0.2:8000".to_string(), "10.0.0.3:8000".to_string()],
            ]
        );

        let refreshed = discovery
            .registry()
            .snapshot()
            .into_iter()
            .find(|p| p.address == "10.0.0.2:8000")
            .map(|p| p.last_seen);
        assert_eq!(refreshed, Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_own_announcement_is_ignored() {
        let (discovery, mut rx) = discovery();
        let message = encode_announcement(SELF_ADDR);

        assert!(!discovery.handle_datagram(message.as_bytes(), Instant::now()));
        assert!(discovery.registry().is_empty());
        assert!(peer_events(&mut rx).is_empty());
    }

    #[test]
    fn test_unrelated_traffic_is_ignored() {
        let (discovery, mut rx) = discovery();
        assert!(!discovery.handle_datagram(b"M-SEARCH * HTTP/1.1", Instant::now()));
        assert!(discovery.registry().is_empty());
        assert!(peer_events(&mut rx).is_empty());
    }

    #[test]
    fn test_sweep_evicts_only_expired_peers() {
        let (discovery, mut rx) = discovery();
        let timeout = discovery.config().peer_timeout;
        // Offset so subtracting the timeout can never underflow
        let now = Instant::now() + Duration::from_secs(60);
        let second = Duration::from_secs(1);

        discovery.handle_datagram(b"SHAREIT_DISCOVERY|10.0.0.2:8000", now - timeout - second);
        discovery.handle_datagram(b"SHAREIT_DISCOVERY|10.0.0.3:8000", now - timeout + second);
        peer_events(&mut rx);

        assert_eq!(discovery.sweep_expired(now), 1);
        let registry = discovery.registry();
        assert!(!registry.contains("10.0.0.2:8000"));
        assert!(registry.contains("10.0.0.3:8000"));
        assert_eq!(peer_events(&mut rx), vec![vec!["10.0.0.3:8000".to_string()]]);

        // Nothing left to expire, so no event
        assert_eq!(discovery.sweep_expired(now), 0);
        assert!(peer_events(&mut rx).is_empty());
    }

    #[test]
    fn test_sweep_to_empty_reports_empty_list() {
        let registry = PeerRegistry::new(Duration::from_secs(5));
        let start = Instant::now();
        registry.observe("10.0.0.9:8000", start, |_| {});

        let mut reported = None;
        let removed =
            registry.sweep(start + Duration::from_secs(6), |peers| reported = Some(peers));
        assert_eq!(removed, 1);
        assert_eq!(reported, Some(Vec::new()));
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_loops_stop_on_cancellation() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (events, _rx) = EventSink::channel();
        let config = DiscoveryConfig {
            multicast_port: 0,
            ..DiscoveryConfig::default()
        };
        let discovery = Arc::new(PeerDiscovery::new(config, SELF_ADDR, events));
        let shutdown = CancellationToken::new();

        let handles = discovery.start(&shutdown);
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("loop did not stop")
                .expect("loop panicked");
        }
    }
}
