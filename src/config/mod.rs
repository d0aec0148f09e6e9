//! Configuration management for the Skeleton Crew daemon

pub mod file;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::discovery::{
    DiscoverySettings, NodeDescriptor, NodeRole, NodeStatus, TopicFilter, DEFAULT_BEACON_PORT,
    DEFAULT_CHANNEL_PORT,
};
use crate::transport::DEFAULT_SKEW_WARN_MS;
use crate::voice::AliasTable;
use crate::{Error, Result};

use file::ConfigFile;

/// Default gateway port
pub const DEFAULT_CONTROL_PORT: u16 = 8070;

/// Default transport agent port
pub const DEFAULT_AGENT_PORT: u16 = 5555;

/// Default coordinator reply port
pub const DEFAULT_COORDINATOR_PORT: u16 = 5556;

/// Node identity and declared roles
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: String,
    pub name: String,
    pub host: String,
    pub control_port: u16,
    pub roles: BTreeSet<NodeRole>,
    pub tags: BTreeMap<String, String>,
}

/// JACK client settings
#[derive(Debug, Clone)]
pub struct JackConfig {
    pub client_name: String,
    pub auto_connect: bool,
}

/// A seeded coordinator agent
#[derive(Debug, Clone)]
pub struct AgentSeed {
    pub host: String,
    pub port: u16,
    pub name: String,
}

/// Transport agent/coordinator settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub agent_port: u16,
    pub coordinator_port: u16,
    pub skew_warn_ms: f64,
    pub default_pre_roll: f64,
    pub agents: Vec<AgentSeed>,
}

/// Voice pipeline settings
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub enabled: bool,
    pub recognizer_endpoint: Option<String>,
    pub recognizer_sample_rate: u32,
    pub window: Duration,
    pub wake_words: HashMap<String, String>,
    pub aliases: BTreeMap<String, String>,
    pub node_aliases: BTreeMap<String, BTreeMap<String, String>>,
}

/// Resolved daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub node: NodeConfig,
    pub discovery: DiscoverySettings,
    pub jack: JackConfig,
    pub transport: TransportConfig,
    pub voice: VoiceConfig,
    pub database_path: Option<PathBuf>,
    pub recording_dir: PathBuf,
}

impl Config {
    /// Load configuration, overlaying the optional TOML file on defaults.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file is unreadable, a role or
    /// address fails to parse, or the node id resolves to empty.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                toml::from_str::<ConfigFile>(&raw)?
            }
            None => ConfigFile::default(),
        };
        Self::from_file(file)
    }

    fn from_file(file: ConfigFile) -> Result<Self> {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "skeleton".to_string());

        let id = file
            .node
            .id
            .or_else(|| std::env::var("SKELETON_NODE_ID").ok())
            .unwrap_or_else(|| hostname.clone());
        if id.trim().is_empty() {
            return Err(Error::Config("node id must not be empty".to_string()));
        }

        let mut roles = BTreeSet::new();
        for role in file.node.roles.unwrap_or_default() {
            let parsed: NodeRole = serde_json::from_value(serde_json::json!(role))
                .map_err(|_| Error::Config(format!("unknown role: {role}")))?;
            roles.insert(parsed);
        }

        let node = NodeConfig {
            name: file.node.name.unwrap_or_else(|| id.clone()),
            host: file.node.host.unwrap_or_else(detect_local_host),
            control_port: file.node.control_port.unwrap_or(DEFAULT_CONTROL_PORT),
            roles,
            tags: file.node.tags,
            id,
        };

        let beacon_port = file.discovery.beacon_port.unwrap_or(DEFAULT_BEACON_PORT);
        let channel_port = file.discovery.channel_port.unwrap_or(DEFAULT_CHANNEL_PORT);
        let broadcast: IpAddr = file
            .discovery
            .broadcast_addr
            .as_deref()
            .unwrap_or("255.255.255.255")
            .parse()
            .map_err(|_| Error::Config("invalid broadcast address".to_string()))?;

        let discovery = DiscoverySettings {
            beacon_port,
            channel_port,
            beacon_target: SocketAddr::new(broadcast, beacon_port),
            channel_target: SocketAddr::new(broadcast, channel_port),
            beacon_interval: Duration::from_millis(
                file.discovery.beacon_interval_ms.unwrap_or(2_000),
            ),
            beacon_jitter: Duration::from_millis(file.discovery.beacon_jitter_ms.unwrap_or(250)),
            liveness_window: Duration::from_secs(
                file.discovery.liveness_window_secs.unwrap_or(10),
            ),
            reannounce_interval: Duration::from_secs(file.discovery.reannounce_secs.unwrap_or(10)),
            topic_filter: TopicFilter::Wildcard,
        };

        let jack = JackConfig {
            client_name: file
                .jack
                .client_name
                .unwrap_or_else(|| "skeleton_crew".to_string()),
            auto_connect: file.jack.auto_connect.unwrap_or(true),
        };

        let transport = TransportConfig {
            agent_port: file.transport.agent_port.unwrap_or(DEFAULT_AGENT_PORT),
            coordinator_port: file
                .transport
                .coordinator_port
                .unwrap_or(DEFAULT_COORDINATOR_PORT),
            skew_warn_ms: file.transport.skew_warn_ms.unwrap_or(DEFAULT_SKEW_WARN_MS),
            default_pre_roll: file.transport.default_pre_roll.unwrap_or(3.0),
            agents: file
                .transport
                .agents
                .into_iter()
                .map(|seed| AgentSeed {
                    name: seed.name.unwrap_or_else(|| seed.host.clone()),
                    port: seed.port.unwrap_or(DEFAULT_AGENT_PORT),
                    host: seed.host,
                })
                .collect(),
        };

        let voice = VoiceConfig {
            enabled: file.voice.enabled.unwrap_or(true),
            recognizer_endpoint: file.voice.recognizer_endpoint,
            recognizer_sample_rate: file.voice.recognizer_sample_rate.unwrap_or(16_000),
            window: Duration::from_secs(file.voice.window_secs.unwrap_or(5)),
            wake_words: file.voice.wake_words.into_iter().collect(),
            aliases: file.voice.aliases,
            node_aliases: file.voice.node_aliases,
        };

        let recording_dir = file
            .recording
            .output_dir
            .unwrap_or_else(|| std::env::temp_dir().join("skeleton-crew"));

        Ok(Self {
            node,
            discovery,
            jack,
            transport,
            voice,
            database_path: file.database.path,
            recording_dir,
        })
    }

    /// Descriptor of the local node, marked online
    #[must_use]
    pub fn local_node(&self) -> NodeDescriptor {
        NodeDescriptor {
            id: self.node.id.clone(),
            name: self.node.name.clone(),
            host: self.node.host.clone(),
            control_port: self.node.control_port,
            roles: self.node.roles.clone(),
            tags: self.node.tags.clone(),
            status: NodeStatus::Online,
            last_seen_ms: 0,
        }
    }

    /// Alias table: stock defaults plus configured entries
    #[must_use]
    pub fn alias_table(&self) -> AliasTable {
        let mut table = AliasTable::with_defaults();
        for (phrase, command) in &self.voice.aliases {
            table.insert_global(phrase, command);
        }
        for (node_id, aliases) in &self.voice.node_aliases {
            for (phrase, command) in aliases {
                table.insert_node(node_id, phrase, command);
            }
        }
        table
    }
}

/// Best-effort local address detection: route a throwaway datagram and
/// read the chosen source address.
fn detect_local_host() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_without_a_file() {
        let config = Config::load(None).unwrap();
        assert!(!config.node.id.is_empty());
        assert_eq!(config.node.control_port, DEFAULT_CONTROL_PORT);
        assert_eq!(config.discovery.beacon_port, DEFAULT_BEACON_PORT);
        assert_eq!(config.discovery.beacon_interval, Duration::from_secs(2));
        assert_eq!(config.discovery.liveness_window, Duration::from_secs(10));
        assert_eq!(config.transport.agent_port, DEFAULT_AGENT_PORT);
        assert!(config.voice.enabled);
        assert!(config.database_path.is_none());
    }

    #[test]
    fn unknown_role_is_a_config_error() {
        let file: ConfigFile = toml::from_str(
            r#"
            [node]
            id = "indigo"
            roles = ["audio_hub", "time_traveler"]
            "#,
        )
        .unwrap();
        let err = Config::from_file(file).unwrap_err();
        assert!(err.to_string().contains("time_traveler"));
    }

    #[test]
    fn roles_parse_from_wire_names() {
        let file: ConfigFile = toml::from_str(
            r#"
            [node]
            id = "indigo"
            roles = ["audio_hub", "stt_realtime", "transport_coordinator"]
            "#,
        )
        .unwrap();
        let config = Config::from_file(file).unwrap();
        assert!(config.node.roles.contains(&NodeRole::AudioHub));
        assert!(config.node.roles.contains(&NodeRole::SttRealtime));
        assert!(config.node.roles.contains(&NodeRole::TransportCoordinator));
    }

    #[test]
    fn alias_table_merges_defaults_and_file_entries() {
        let file: ConfigFile = toml::from_str(
            r#"
            [node]
            id = "indigo"

            [voice.aliases]
            rewind = "jack_transport_locate"

            [voice.node_aliases.karate]
            play = "record_start"
            "#,
        )
        .unwrap();
        let table = Config::from_file(file).unwrap().alias_table();

        // Stock default still present
        assert_eq!(table.resolve("indigo", "play"), Some("jack_transport_start"));
        // File-global addition
        assert_eq!(table.resolve("indigo", "rewind"), Some("jack_transport_locate"));
        // Node scope shadows
        assert_eq!(table.resolve("karate", "play"), Some("record_start"));
    }

    #[test]
    fn empty_node_id_is_rejected() {
        let file: ConfigFile = toml::from_str(
            r#"
            [node]
            id = "  "
            "#,
        )
        .unwrap();
        assert!(Config::from_file(file).is_err());
    }
}
