//! Cluster registry: node table and service projection
//!
//! The registry is the local view of the LAN. Writers (beacon listener,
//! service channel, liveness sweeper) take a short exclusive lock and
//! return the events their mutation produced; readers get cloned
//! snapshots. Effective service availability is derived from the owning
//! node's status at read time, so a lost node leaves its services visible
//! but labeled unavailable rather than silently gone.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::Duration;

use crate::events::Event;

use super::beacon::Beacon;
use super::channel::{ServiceAction, ServiceMessage};
use super::types::{Availability, NodeDescriptor, NodeRole, NodeStatus, ServiceDescriptor};

#[derive(Default)]
struct State {
    nodes: HashMap<String, NodeDescriptor>,
    /// node id -> service name -> descriptor
    services: HashMap<String, BTreeMap<String, ServiceDescriptor>>,
}

/// Thread-safe registry of nodes and services
pub struct ClusterRegistry {
    local_node_id: String,
    local_host: String,
    liveness: Duration,
    state: RwLock<State>,
}

impl ClusterRegistry {
    /// Create a registry seeded with the local node
    #[must_use]
    pub fn new(local: NodeDescriptor, liveness: Duration) -> Self {
        let mut state = State::default();
        let local_node_id = local.id.clone();
        let local_host = local.host.clone();
        state.nodes.insert(local.id.clone(), local);
        Self {
            local_node_id,
            local_host,
            liveness,
            state: RwLock::new(state),
        }
    }

    /// Id of the local node
    #[must_use]
    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    /// Whether `node_id` refers to the local node
    #[must_use]
    pub fn is_local(&self, node_id: &str) -> bool {
        node_id == self.local_node_id
    }

    /// Apply a received beacon. Returns the events the update produced.
    ///
    /// Own broadcasts are ignored by id match; a foreign node claiming our
    /// id is reported as a collision and otherwise ignored. For remote
    /// nodes the later heartbeat wins name and address.
    pub fn apply_beacon(&self, beacon: Beacon, now_ms: u64) -> Vec<Event> {
        if beacon.node_id == self.local_node_id {
            if beacon.host == self.local_host {
                return Vec::new();
            }
            tracing::warn!(
                node_id = %beacon.node_id,
                host = %beacon.host,
                "foreign node claims our id"
            );
            return vec![Event::IdCollision {
                node_id: beacon.node_id,
                host: beacon.host,
            }];
        }

        let liveness_ms = u64::try_from(self.liveness.as_millis()).unwrap_or(u64::MAX);
        let mut state = self.state.write().expect("registry lock");

        match state.nodes.get_mut(&beacon.node_id) {
            None => {
                // An unknown node's beacon is accepted even if its clock is
                // behind; there is no fresher information to protect.
                let node = beacon.into_descriptor();
                let event = Event::NodeDiscovered { node: node.clone() };
                tracing::info!(node_id = %node.id, host = %node.host, "node discovered");
                state.nodes.insert(node.id.clone(), node);
                vec![event]
            }
            Some(existing) => {
                // A beacon older than the liveness window cannot revive or
                // rewrite a node unless it is still the freshest we have.
                let stale = now_ms.saturating_sub(beacon.timestamp_ms) > liveness_ms;
                if stale && beacon.timestamp_ms <= existing.last_seen_ms {
                    tracing::trace!(node_id = %beacon.node_id, "ignoring stale beacon");
                    return Vec::new();
                }

                let mut events = Vec::new();
                let address_changed = existing.host != beacon.host;
                if address_changed && existing.status == NodeStatus::Online {
                    events.push(Event::IdCollision {
                        node_id: beacon.node_id.clone(),
                        host: beacon.host.clone(),
                    });
                    tracing::warn!(
                        node_id = %beacon.node_id,
                        old_host = %existing.host,
                        new_host = %beacon.host,
                        "node id collision, later heartbeat wins"
                    );
                }

                let changed = address_changed
                    || existing.name != beacon.node_name
                    || existing.control_port != beacon.control_port
                    || existing.roles != beacon.roles
                    || existing.tags != beacon.tags
                    || existing.status != NodeStatus::Online;

                existing.name = beacon.node_name;
                existing.host = beacon.host;
                existing.control_port = beacon.control_port;
                existing.roles = beacon.roles;
                existing.tags = beacon.tags;
                existing.status = NodeStatus::Online;
                existing.last_seen_ms = beacon.timestamp_ms.max(existing.last_seen_ms);

                if changed {
                    events.push(Event::NodeUpdated {
                        node: existing.clone(),
                    });
                }
                events
            }
        }
    }

    /// Transition nodes whose heartbeats stopped to offline.
    ///
    /// Services of a lost node stay in the projection; readers see them
    /// labeled unavailable.
    pub fn sweep(&self, now_ms: u64) -> Vec<Event> {
        let liveness_ms = u64::try_from(self.liveness.as_millis()).unwrap_or(u64::MAX);
        let mut events = Vec::new();
        let mut state = self.state.write().expect("registry lock");

        for node in state.nodes.values_mut() {
            if node.id == self.local_node_id || node.status == NodeStatus::Offline {
                continue;
            }
            if now_ms.saturating_sub(node.last_seen_ms) > liveness_ms {
                node.status = NodeStatus::Offline;
                tracing::info!(node_id = %node.id, "node lost");
                events.push(Event::NodeLost {
                    node_id: node.id.clone(),
                });
            }
        }
        events
    }

    /// Seed the table with previously known peers, marked offline until
    /// their next heartbeat. Existing entries win over seeds.
    pub fn seed(&self, nodes: Vec<NodeDescriptor>) {
        let mut state = self.state.write().expect("registry lock");
        for mut node in nodes {
            if node.id == self.local_node_id {
                continue;
            }
            node.status = NodeStatus::Offline;
            state.nodes.entry(node.id.clone()).or_insert(node);
        }
    }

    /// Refresh the local node's heartbeat time
    pub fn touch_local(&self, now_ms: u64) {
        let mut state = self.state.write().expect("registry lock");
        if let Some(node) = state.nodes.get_mut(&self.local_node_id) {
            node.last_seen_ms = now_ms;
            node.status = NodeStatus::Online;
        }
    }

    /// Apply a service channel message. Returns the events it produced;
    /// a re-announcement that changes nothing produces none.
    pub fn apply_service(&self, message: ServiceMessage) -> Vec<Event> {
        let mut state = self.state.write().expect("registry lock");
        let service = message.service;
        let node_services = state.services.entry(service.node_id.clone()).or_default();

        match message.action {
            ServiceAction::Unregistered => {
                if node_services.remove(&service.service_name).is_some() {
                    vec![Event::ServiceUnregistered {
                        node_id: service.node_id,
                        service_name: service.service_name,
                    }]
                } else {
                    Vec::new()
                }
            }
            ServiceAction::Registered | ServiceAction::Updated => {
                let known = node_services.insert(service.service_name.clone(), service.clone());
                match known {
                    None => vec![Event::ServiceRegistered { service }],
                    Some(prev) if !same_service(&prev, &service) => {
                        vec![Event::ServiceUpdated { service }]
                    }
                    Some(_) => Vec::new(),
                }
            }
        }
    }

    /// Look up a node by id
    #[must_use]
    pub fn node(&self, node_id: &str) -> Option<NodeDescriptor> {
        self.state
            .read()
            .expect("registry lock")
            .nodes
            .get(node_id)
            .cloned()
    }

    /// List nodes, optionally filtered by role and status
    #[must_use]
    pub fn nodes(&self, role: Option<NodeRole>, status: Option<NodeStatus>) -> Vec<NodeDescriptor> {
        let state = self.state.read().expect("registry lock");
        let mut nodes: Vec<NodeDescriptor> = state
            .nodes
            .values()
            .filter(|n| role.map_or(true, |r| n.has_role(r)))
            .filter(|n| status.map_or(true, |s| n.status == s))
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Services advertised by `node_id`, availability derived from the
    /// node's current status
    #[must_use]
    pub fn services_by_node(&self, node_id: &str) -> Vec<ServiceDescriptor> {
        let state = self.state.read().expect("registry lock");
        let node_status = state.nodes.get(node_id).map(|n| n.status);
        state
            .services
            .get(node_id)
            .map(|services| {
                services
                    .values()
                    .map(|s| derive_availability(s, node_status))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All services of one type across the cluster
    #[must_use]
    pub fn services_by_type(&self, service_type: super::types::ServiceType) -> Vec<ServiceDescriptor> {
        let state = self.state.read().expect("registry lock");
        let mut out = Vec::new();
        for (node_id, services) in &state.services {
            let node_status = state.nodes.get(node_id).map(|n| n.status);
            out.extend(
                services
                    .values()
                    .filter(|s| s.service_type == service_type)
                    .map(|s| derive_availability(s, node_status)),
            );
        }
        out.sort_by(|a, b| (a.node_id.as_str(), a.service_name.as_str())
            .cmp(&(b.node_id.as_str(), b.service_name.as_str())));
        out
    }

    /// Every known service grouped by node
    #[must_use]
    pub fn all_services(&self) -> BTreeMap<String, Vec<ServiceDescriptor>> {
        let state = self.state.read().expect("registry lock");
        state
            .services
            .iter()
            .map(|(node_id, services)| {
                let node_status = state.nodes.get(node_id).map(|n| n.status);
                (
                    node_id.clone(),
                    services
                        .values()
                        .map(|s| derive_availability(s, node_status))
                        .collect(),
                )
            })
            .collect()
    }
}

fn derive_availability(
    service: &ServiceDescriptor,
    node_status: Option<NodeStatus>,
) -> ServiceDescriptor {
    let mut service = service.clone();
    if node_status != Some(NodeStatus::Online) {
        service.availability = Availability::Unavailable;
    }
    service
}

fn same_service(a: &ServiceDescriptor, b: &ServiceDescriptor) -> bool {
    a.service_type == b.service_type
        && a.endpoint == b.endpoint
        && a.capabilities == b.capabilities
        && a.availability == b.availability
        && a.health == b.health
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::types::ServiceType;
    use std::collections::BTreeSet;

    fn local() -> NodeDescriptor {
        NodeDescriptor {
            id: "indigo".to_string(),
            name: "Indigo".to_string(),
            host: "192.168.32.7".to_string(),
            control_port: 8070,
            roles: BTreeSet::new(),
            tags: BTreeMap::new(),
            status: NodeStatus::Online,
            last_seen_ms: 0,
        }
    }

    fn beacon(id: &str, host: &str, timestamp_ms: u64) -> Beacon {
        Beacon {
            wire_version: 1,
            node_id: id.to_string(),
            node_name: id.to_string(),
            host: host.to_string(),
            control_port: 8070,
            roles: BTreeSet::new(),
            tags: BTreeMap::new(),
            timestamp_ms,
        }
    }

    fn registry() -> ClusterRegistry {
        ClusterRegistry::new(local(), Duration::from_secs(10))
    }

    #[test]
    fn first_beacon_discovers_node() {
        let reg = registry();
        let events = reg.apply_beacon(beacon("karate", "192.168.32.11", 1_000), 1_000);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "node_discovered");
        assert_eq!(reg.node("karate").unwrap().status, NodeStatus::Online);
    }

    #[test]
    fn own_beacon_is_ignored() {
        let reg = registry();
        let events = reg.apply_beacon(beacon("indigo", "192.168.32.7", 1_000), 1_000);
        assert!(events.is_empty());
    }

    #[test]
    fn foreign_node_claiming_our_id_is_a_collision() {
        let reg = registry();
        let events = reg.apply_beacon(beacon("indigo", "192.168.32.99", 1_000), 1_000);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "id_collision");
        // Our own entry is untouched
        assert_eq!(reg.node("indigo").unwrap().host, "192.168.32.7");
    }

    #[test]
    fn heartbeat_expiry_marks_offline_and_heartbeat_revives() {
        let reg = registry();
        reg.apply_beacon(beacon("karate", "192.168.32.11", 1_000), 1_000);

        let events = reg.sweep(20_000);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "node_lost");
        assert_eq!(reg.node("karate").unwrap().status, NodeStatus::Offline);

        // Healed partition: fresh heartbeat refreshes to online
        let events = reg.apply_beacon(beacon("karate", "192.168.32.11", 21_000), 21_000);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "node_updated");
        assert_eq!(reg.node("karate").unwrap().status, NodeStatus::Online);
    }

    #[test]
    fn stale_beacon_does_not_revive_offline_node() {
        let reg = registry();
        reg.apply_beacon(beacon("karate", "192.168.32.11", 5_000), 5_000);
        reg.sweep(30_000);

        // Timestamp older than the one we already hold, and outside the window
        let events = reg.apply_beacon(beacon("karate", "192.168.32.11", 4_000), 30_000);
        assert!(events.is_empty());
        assert_eq!(reg.node("karate").unwrap().status, NodeStatus::Offline);
    }

    #[test]
    fn address_change_while_online_reports_collision_and_wins() {
        let reg = registry();
        reg.apply_beacon(beacon("karate", "192.168.32.11", 1_000), 1_000);

        let events = reg.apply_beacon(beacon("karate", "192.168.32.50", 2_000), 2_000);
        let kinds: Vec<&str> = events.iter().map(Event::kind).collect();
        assert!(kinds.contains(&"id_collision"));
        assert!(kinds.contains(&"node_updated"));
        assert_eq!(reg.node("karate").unwrap().host, "192.168.32.50");
    }

    #[test]
    fn control_port_change_is_an_update_not_a_new_node() {
        let reg = registry();
        reg.apply_beacon(beacon("karate", "192.168.32.11", 1_000), 1_000);

        let mut b = beacon("karate", "192.168.32.11", 2_000);
        b.control_port = 9000;
        let events = reg.apply_beacon(b, 2_000);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "node_updated");
        assert_eq!(reg.nodes(None, None).iter().filter(|n| n.id == "karate").count(), 1);
    }

    #[test]
    fn service_register_unregister_round_trip() {
        let reg = registry();
        reg.apply_beacon(beacon("karate", "192.168.32.11", 1_000), 1_000);

        let before = reg.services_by_node("karate");
        let svc = ServiceDescriptor::new("karate", ServiceType::JackClient, "jack", "local");

        let events = reg.apply_service(ServiceMessage {
            action: ServiceAction::Registered,
            service: svc.clone(),
        });
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "service_registered");

        let events = reg.apply_service(ServiceMessage {
            action: ServiceAction::Unregistered,
            service: svc,
        });
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "service_unregistered");
        assert_eq!(reg.services_by_node("karate"), before);
    }

    #[test]
    fn reannouncement_without_change_is_silent() {
        let reg = registry();
        let svc = ServiceDescriptor::new("karate", ServiceType::SttEngine, "vosk", "local");
        reg.apply_service(ServiceMessage {
            action: ServiceAction::Registered,
            service: svc.clone(),
        });
        let events = reg.apply_service(ServiceMessage {
            action: ServiceAction::Updated,
            service: svc,
        });
        assert!(events.is_empty());
    }

    #[test]
    fn offline_node_services_stay_visible_but_unavailable() {
        let reg = registry();
        reg.apply_beacon(beacon("karate", "192.168.32.11", 1_000), 1_000);
        reg.apply_service(ServiceMessage {
            action: ServiceAction::Registered,
            service: ServiceDescriptor::new("karate", ServiceType::JackClient, "jack", "local"),
        });

        reg.sweep(30_000);

        let services = reg.services_by_node("karate");
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].availability, Availability::Unavailable);
    }
}
