//! Shared test utilities

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use skeleton_crew::discovery::{ClusterRegistry, NodeStatus};
use skeleton_crew::{NodeDescriptor, NodeRole};

/// Build a node descriptor on the test LAN
#[must_use]
pub fn node(id: &str, host: &str) -> NodeDescriptor {
    NodeDescriptor {
        id: id.to_string(),
        name: format!("Node {id}"),
        host: host.to_string(),
        control_port: 8070,
        roles: BTreeSet::from([NodeRole::AudioHub, NodeRole::TransportAgent]),
        tags: BTreeMap::new(),
        status: NodeStatus::Online,
        last_seen_ms: 0,
    }
}

/// Cluster registry with a 10 s liveness window seeded with `local`
#[must_use]
pub fn registry(local: NodeDescriptor) -> ClusterRegistry {
    ClusterRegistry::new(local, Duration::from_secs(10))
}
