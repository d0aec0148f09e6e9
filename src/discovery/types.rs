//! Cluster data model: nodes and the services they advertise

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Roles a node can declare in its beacon
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    AudioHub,
    SttRealtime,
    SttBatch,
    Tts,
    Llm,
    Rag,
    TransportAgent,
    TransportCoordinator,
}

/// Node liveness as seen by the local registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Degraded,
    Offline,
}

/// Types of services a node can advertise.
///
/// `Recording`, `Playback`, and `Custom` are reserved for tooling that
/// registers ad-hoc services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    SttEngine,
    TtsEngine,
    JackClient,
    TransportAgent,
    TransportCoordinator,
    VoiceCommand,
    RemoteJack,
    Recording,
    Playback,
    Custom,
}

impl ServiceType {
    /// Topic string used on the service channel
    #[must_use]
    pub const fn topic(self) -> &'static str {
        match self {
            Self::SttEngine => "stt_engine",
            Self::TtsEngine => "tts_engine",
            Self::JackClient => "jack_client",
            Self::TransportAgent => "transport_agent",
            Self::TransportCoordinator => "transport_coordinator",
            Self::VoiceCommand => "voice_command",
            Self::RemoteJack => "remote_jack",
            Self::Recording => "recording",
            Self::Playback => "playback",
            Self::Custom => "custom",
        }
    }
}

/// Whether a service can take work right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    Busy,
    Unavailable,
}

/// Service health as reported by its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
}

/// A node known to the cluster registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Stable identifier, unique on the LAN
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Reachable host address
    pub host: String,
    /// Gateway port for remote invocations and snapshots
    pub control_port: u16,
    pub roles: BTreeSet<NodeRole>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub status: NodeStatus,
    /// Wall-clock milliseconds of the last heartbeat
    pub last_seen_ms: u64,
}

impl NodeDescriptor {
    /// Whether the node declared `role`
    #[must_use]
    pub fn has_role(&self, role: NodeRole) -> bool {
        self.roles.contains(&role)
    }
}

/// A capability advertised by a node.
///
/// Owned by the advertising node; its lifetime is bounded by that node's
/// liveness, and callers derive effective availability from the owning
/// node's status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub node_id: String,
    pub service_type: ServiceType,
    /// Unique per node
    pub service_name: String,
    /// `host:port`, or `local` for in-process services
    pub endpoint: String,
    #[serde(default)]
    pub capabilities: BTreeMap<String, serde_json::Value>,
    pub availability: Availability,
    pub health: Health,
}

impl ServiceDescriptor {
    /// Minimal descriptor with healthy/available defaults
    #[must_use]
    pub fn new(node_id: &str, service_type: ServiceType, service_name: &str, endpoint: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            service_type,
            service_name: service_name.to_string(),
            endpoint: endpoint.to_string(),
            capabilities: BTreeMap::new(),
            availability: Availability::Available,
            health: Health::Healthy,
        }
    }
}
