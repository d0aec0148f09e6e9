//! Cluster discovery: UDP beacons plus a service pub/sub channel
//!
//! Peer discovery and the service registry need no central coordination:
//! every node broadcasts a small beacon at 2 Hz (jittered) and publishes
//! service lifecycle messages on a separate topic-filtered channel. The
//! local [`ClusterRegistry`] is the projection of everything heard, and
//! the [`EventBridge`] carries its changes to subscribers.

mod beacon;
mod channel;
mod registry;
mod types;

pub use beacon::{decode_beacon, encode_frame, Beacon, FrameKind, MAGIC, WIRE_VERSION};
pub use channel::{
    decode_service_message, encode_service_message, ChannelPublisher, ServiceAction,
    ServiceMessage, TopicFilter,
};
pub use registry::ClusterRegistry;
pub use types::{
    Availability, Health, NodeDescriptor, NodeRole, NodeStatus, ServiceDescriptor, ServiceType,
};

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::clock::wall_micros;
use crate::events::EventBridge;
use crate::{Error, Result};

/// Default beacon port
pub const DEFAULT_BEACON_PORT: u16 = 5557;

/// Default service channel port
pub const DEFAULT_CHANNEL_PORT: u16 = 5558;

/// Discovery timing and addressing
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    /// Local bind port for beacons
    pub beacon_port: u16,
    /// Local bind port for the service channel
    pub channel_port: u16,
    /// Where beacons are sent (LAN broadcast in production)
    pub beacon_target: SocketAddr,
    /// Where service messages are sent
    pub channel_target: SocketAddr,
    pub beacon_interval: Duration,
    /// Upper bound of the random per-beacon jitter
    pub beacon_jitter: Duration,
    /// Heartbeat silence after which a node is offline
    pub liveness_window: Duration,
    /// How often local services are re-announced
    pub reannounce_interval: Duration,
    /// Service channel topics this node follows
    pub topic_filter: TopicFilter,
}

impl Default for DiscoverySettings {
    /// LAN defaults: 2 s beacons with up to 250 ms jitter, 10 s liveness
    fn default() -> Self {
        Self {
            beacon_port: DEFAULT_BEACON_PORT,
            channel_port: DEFAULT_CHANNEL_PORT,
            beacon_target: SocketAddr::from(([255, 255, 255, 255], DEFAULT_BEACON_PORT)),
            channel_target: SocketAddr::from(([255, 255, 255, 255], DEFAULT_CHANNEL_PORT)),
            beacon_interval: Duration::from_secs(2),
            beacon_jitter: Duration::from_millis(250),
            liveness_window: Duration::from_secs(10),
            reannounce_interval: Duration::from_secs(10),
            topic_filter: TopicFilter::Wildcard,
        }
    }
}

/// Discovery service: beacon loops, service channel, liveness sweeper
pub struct DiscoveryService {
    settings: DiscoverySettings,
    registry: Arc<ClusterRegistry>,
    bridge: EventBridge,
    local_services: Mutex<BTreeMap<String, ServiceDescriptor>>,
    publisher: Mutex<Option<ChannelPublisher>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    malformed: Arc<AtomicU64>,
}

impl DiscoveryService {
    /// Create a stopped discovery service
    #[must_use]
    pub fn new(
        settings: DiscoverySettings,
        registry: Arc<ClusterRegistry>,
        bridge: EventBridge,
    ) -> Self {
        Self {
            settings,
            registry,
            bridge,
            local_services: Mutex::new(BTreeMap::new()),
            publisher: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            malformed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The registry this service maintains
    #[must_use]
    pub fn registry(&self) -> Arc<ClusterRegistry> {
        Arc::clone(&self.registry)
    }

    /// Datagrams dropped as malformed since start
    #[must_use]
    pub fn malformed_frames(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Bind sockets and start the discovery loops.
    ///
    /// # Errors
    ///
    /// Returns an error if a socket cannot be bound.
    pub async fn start(&self) -> Result<()> {
        let beacon_socket = Arc::new(
            UdpSocket::bind(("0.0.0.0", self.settings.beacon_port))
                .await
                .map_err(|e| Error::Discovery(format!("beacon bind failed: {e}")))?,
        );
        beacon_socket
            .set_broadcast(true)
            .map_err(|e| Error::Discovery(e.to_string()))?;

        let channel_socket = Arc::new(
            UdpSocket::bind(("0.0.0.0", self.settings.channel_port))
                .await
                .map_err(|e| Error::Discovery(format!("channel bind failed: {e}")))?,
        );
        channel_socket
            .set_broadcast(true)
            .map_err(|e| Error::Discovery(e.to_string()))?;

        *self.publisher.lock().expect("publisher lock") = Some(ChannelPublisher::new(
            Arc::clone(&channel_socket),
            self.settings.channel_target,
        ));

        let mut tasks = self.tasks.lock().expect("tasks lock");
        tasks.push(self.spawn_beacon_sender(Arc::clone(&beacon_socket)));
        tasks.push(self.spawn_beacon_listener(beacon_socket));
        tasks.push(self.spawn_channel_listener(channel_socket));
        tasks.push(self.spawn_sweeper());
        tasks.push(self.spawn_reannouncer());

        tracing::info!(
            beacon_port = self.settings.beacon_port,
            channel_port = self.settings.channel_port,
            node_id = %self.registry.local_node_id(),
            "discovery started"
        );
        Ok(())
    }

    /// Unregister local services and stop all loops
    pub async fn stop(&self) {
        let services: Vec<ServiceDescriptor> = self
            .local_services
            .lock()
            .expect("services lock")
            .values()
            .cloned()
            .collect();
        for service in services {
            let _ = self.unregister_service(&service.service_name).await;
        }

        for task in self.tasks.lock().expect("tasks lock").drain(..) {
            task.abort();
        }
        tracing::info!("discovery stopped");
    }

    /// Register (or re-register) a service owned by this node.
    ///
    /// # Errors
    ///
    /// Returns an error if publishing fails after its retries; the local
    /// projection is updated regardless.
    pub async fn register_service(&self, mut service: ServiceDescriptor) -> Result<()> {
        service.node_id = self.registry.local_node_id().to_string();
        self.local_services
            .lock()
            .expect("services lock")
            .insert(service.service_name.clone(), service.clone());

        let message = ServiceMessage {
            action: ServiceAction::Registered,
            service,
        };
        self.bridge
            .publish_all(self.registry.apply_service(message.clone()));
        self.publish(&message).await
    }

    /// Update a service's descriptor (availability, health, capabilities).
    ///
    /// # Errors
    ///
    /// Returns an error if publishing fails after its retries.
    pub async fn update_service(&self, mut service: ServiceDescriptor) -> Result<()> {
        service.node_id = self.registry.local_node_id().to_string();
        self.local_services
            .lock()
            .expect("services lock")
            .insert(service.service_name.clone(), service.clone());

        let message = ServiceMessage {
            action: ServiceAction::Updated,
            service,
        };
        self.bridge
            .publish_all(self.registry.apply_service(message.clone()));
        self.publish(&message).await
    }

    /// Unregister a service owned by this node.
    ///
    /// Unknown names are a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if publishing fails after its retries.
    pub async fn unregister_service(&self, service_name: &str) -> Result<()> {
        let Some(service) = self
            .local_services
            .lock()
            .expect("services lock")
            .remove(service_name)
        else {
            return Ok(());
        };

        let message = ServiceMessage {
            action: ServiceAction::Unregistered,
            service,
        };
        self.bridge
            .publish_all(self.registry.apply_service(message.clone()));
        self.publish(&message).await
    }

    /// Warm the service cache from a peer's gateway snapshot.
    ///
    /// Returns the number of services merged.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot request fails.
    pub async fn warm_from_peer(
        &self,
        http: &reqwest::Client,
        host: &str,
        control_port: u16,
    ) -> Result<usize> {
        let url = format!("http://{host}:{control_port}/api/services");
        let snapshot: BTreeMap<String, Vec<ServiceDescriptor>> = http
            .get(&url)
            .timeout(Duration::from_secs(3))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut merged = 0;
        for service in snapshot.into_values().flatten() {
            if self.registry.is_local(&service.node_id) {
                continue;
            }
            let events = self.registry.apply_service(ServiceMessage {
                action: ServiceAction::Updated,
                service,
            });
            self.bridge.publish_all(events);
            merged += 1;
        }
        tracing::debug!(host, merged, "warmed service cache from peer");
        Ok(merged)
    }

    async fn publish(&self, message: &ServiceMessage) -> Result<()> {
        let publisher = self
            .publisher
            .lock()
            .expect("publisher lock")
            .clone()
            .ok_or_else(|| Error::Discovery("discovery not started".to_string()))?;
        publisher.publish(message).await
    }

    fn spawn_beacon_sender(&self, socket: Arc<UdpSocket>) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let target = self.settings.beacon_target;
        let interval = self.settings.beacon_interval;
        let jitter = self.settings.beacon_jitter;

        tokio::spawn(async move {
            loop {
                let now_ms = wall_micros() / 1000;
                registry.touch_local(now_ms);
                if let Some(node) = registry.node(registry.local_node_id()) {
                    match encode_frame(FrameKind::Beacon, &Beacon::announce(&node, now_ms)) {
                        Ok(frame) => {
                            if let Err(e) = socket.send_to(&frame, target).await {
                                tracing::warn!(error = %e, "beacon send failed");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "beacon encode failed"),
                    }
                }

                let jitter_ms = u64::try_from(jitter.as_millis()).unwrap_or(0);
                let extra = if jitter_ms == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=jitter_ms)
                };
                tokio::time::sleep(interval + Duration::from_millis(extra)).await;
            }
        })
    }

    fn spawn_beacon_listener(&self, socket: Arc<UdpSocket>) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let bridge = self.bridge.clone();
        let malformed = Arc::clone(&self.malformed);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                    continue;
                };
                match decode_beacon(&buf[..n]) {
                    Ok(beacon) => {
                        let now_ms = wall_micros() / 1000;
                        bridge.publish_all(registry.apply_beacon(beacon, now_ms));
                    }
                    Err(e) => {
                        malformed.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!(%from, error = %e, "dropping malformed beacon");
                    }
                }
            }
        })
    }

    fn spawn_channel_listener(&self, socket: Arc<UdpSocket>) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let bridge = self.bridge.clone();
        let malformed = Arc::clone(&self.malformed);
        let filter = self.settings.topic_filter.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                    continue;
                };
                match decode_service_message(&buf[..n]) {
                    Ok(message) => {
                        // Our own announcements loop back over broadcast
                        if registry.is_local(&message.service.node_id) {
                            continue;
                        }
                        if !filter.accepts(message.topic()) {
                            continue;
                        }
                        bridge.publish_all(registry.apply_service(message));
                    }
                    Err(e) => {
                        malformed.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!(%from, error = %e, "dropping malformed service message");
                    }
                }
            }
        })
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let bridge = self.bridge.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let now_ms = wall_micros() / 1000;
                bridge.publish_all(registry.sweep(now_ms));
            }
        })
    }

    fn spawn_reannouncer(&self) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let publisher = self
            .publisher
            .lock()
            .expect("publisher lock")
            .clone()
            .expect("started before spawning reannouncer");
        let interval = self.settings.reannounce_interval;
        let local_id = registry.local_node_id().to_string();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for service in registry.services_by_node(&local_id) {
                    let message = ServiceMessage {
                        action: ServiceAction::Updated,
                        service,
                    };
                    if let Err(e) = publisher.publish(&message).await {
                        tracing::warn!(error = %e, "service re-announcement failed");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn local_node(control_port: u16) -> NodeDescriptor {
        NodeDescriptor {
            id: "indigo".to_string(),
            name: "Indigo".to_string(),
            host: "127.0.0.1".to_string(),
            control_port,
            roles: BTreeSet::from([NodeRole::AudioHub]),
            tags: BTreeMap::new(),
            status: NodeStatus::Online,
            last_seen_ms: 0,
        }
    }

    async fn service_on_loopback() -> (Arc<DiscoveryService>, UdpSocket, UdpSocket) {
        // The "LAN" is a pair of test sockets standing in for peers
        let peer_beacon = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_channel = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Bind the service on ephemeral ports, targeting the test sockets
        let probe_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let probe_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let beacon_port = probe_a.local_addr().unwrap().port();
        let channel_port = probe_b.local_addr().unwrap().port();
        drop((probe_a, probe_b));

        let settings = DiscoverySettings {
            beacon_port,
            channel_port,
            beacon_target: peer_beacon.local_addr().unwrap(),
            channel_target: peer_channel.local_addr().unwrap(),
            beacon_interval: Duration::from_millis(50),
            beacon_jitter: Duration::from_millis(5),
            liveness_window: Duration::from_secs(10),
            reannounce_interval: Duration::from_secs(60),
            topic_filter: TopicFilter::Wildcard,
        };

        let registry = Arc::new(ClusterRegistry::new(
            local_node(8070),
            settings.liveness_window,
        ));
        let service = Arc::new(DiscoveryService::new(
            settings,
            registry,
            EventBridge::new(),
        ));
        service.start().await.unwrap();
        (service, peer_beacon, peer_channel)
    }

    #[tokio::test]
    async fn beacons_are_broadcast_periodically() {
        let (service, peer_beacon, _peer_channel) = service_on_loopback().await;

        let mut buf = vec![0u8; 4096];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), peer_beacon.recv_from(&mut buf))
            .await
            .expect("no beacon within deadline")
            .unwrap();

        let beacon = decode_beacon(&buf[..n]).unwrap();
        assert_eq!(beacon.node_id, "indigo");
        assert_eq!(beacon.wire_version, WIRE_VERSION);
        assert!(beacon.roles.contains(&NodeRole::AudioHub));

        service.stop().await;
    }

    #[tokio::test]
    async fn incoming_beacon_updates_registry() {
        let (service, _peer_beacon, _peer_channel) = service_on_loopback().await;
        let beacon_port = service.settings.beacon_port;

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let beacon = Beacon {
            wire_version: WIRE_VERSION,
            node_id: "karate".to_string(),
            node_name: "Karate".to_string(),
            host: "192.168.32.11".to_string(),
            control_port: 8070,
            roles: BTreeSet::new(),
            tags: BTreeMap::new(),
            timestamp_ms: wall_micros() / 1000,
        };
        let frame = encode_frame(FrameKind::Beacon, &beacon).unwrap();
        sender
            .send_to(&frame, ("127.0.0.1", beacon_port))
            .await
            .unwrap();

        // Wait for the listener to apply it
        let registry = service.registry();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while registry.node("karate").is_none() {
            assert!(std::time::Instant::now() < deadline, "node never discovered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.node("karate").unwrap().host, "192.168.32.11");

        service.stop().await;
    }

    #[tokio::test]
    async fn register_service_publishes_on_channel() {
        let (service, _peer_beacon, peer_channel) = service_on_loopback().await;

        service
            .register_service(ServiceDescriptor::new(
                "ignored",
                ServiceType::JackClient,
                "jack",
                "local",
            ))
            .await
            .unwrap();

        let mut buf = vec![0u8; 4096];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), peer_channel.recv_from(&mut buf))
            .await
            .expect("no service message")
            .unwrap();
        let message = decode_service_message(&buf[..n]).unwrap();
        assert_eq!(message.action, ServiceAction::Registered);
        // Owner is forced to the local node
        assert_eq!(message.service.node_id, "indigo");

        service.stop().await;
    }

    #[tokio::test]
    async fn malformed_datagrams_bump_counter() {
        let (service, _pb, _pc) = service_on_loopback().await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(b"not a frame", ("127.0.0.1", service.settings.beacon_port))
            .await
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while service.malformed_frames() == 0 {
            assert!(std::time::Instant::now() < deadline, "counter never bumped");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        service.stop().await;
    }
}
