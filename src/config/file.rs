//! TOML configuration file loading
//!
//! All fields are optional - the file is a partial overlay on top of the
//! built-in defaults and environment variables.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub node: NodeFileConfig,

    #[serde(default)]
    pub discovery: DiscoveryFileConfig,

    #[serde(default)]
    pub jack: JackFileConfig,

    #[serde(default)]
    pub transport: TransportFileConfig,

    #[serde(default)]
    pub voice: VoiceFileConfig,

    #[serde(default)]
    pub database: DatabaseFileConfig,

    #[serde(default)]
    pub recording: RecordingFileConfig,
}

/// Node identity
#[derive(Debug, Default, Deserialize)]
pub struct NodeFileConfig {
    /// Stable node id; defaults to the hostname
    pub id: Option<String>,

    /// Human-readable name
    pub name: Option<String>,

    /// Reachable host address; autodetected when omitted
    pub host: Option<String>,

    /// Gateway port
    pub control_port: Option<u16>,

    /// Declared roles (e.g. "audio_hub", "transport_agent")
    pub roles: Option<Vec<String>>,

    /// Arbitrary tags published in beacons
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Discovery timing and addressing
#[derive(Debug, Default, Deserialize)]
pub struct DiscoveryFileConfig {
    pub beacon_port: Option<u16>,
    pub channel_port: Option<u16>,

    /// LAN broadcast address
    pub broadcast_addr: Option<String>,

    pub beacon_interval_ms: Option<u64>,
    pub beacon_jitter_ms: Option<u64>,
    pub liveness_window_secs: Option<u64>,
    pub reannounce_secs: Option<u64>,
}

/// JACK client settings
#[derive(Debug, Default, Deserialize)]
pub struct JackFileConfig {
    /// JACK client name
    pub client_name: Option<String>,

    /// Keep retrying the server connection in the background
    pub auto_connect: Option<bool>,
}

/// Transport agent/coordinator settings
#[derive(Debug, Default, Deserialize)]
pub struct TransportFileConfig {
    /// UDP port the transport agent listens on
    pub agent_port: Option<u16>,

    /// Port the coordinator receives state replies on
    pub coordinator_port: Option<u16>,

    /// Skew warning threshold in milliseconds
    pub skew_warn_ms: Option<f64>,

    /// Default pre-roll for coordinated commands, seconds
    pub default_pre_roll: Option<f64>,

    /// Agents the coordinator should address at startup
    #[serde(default)]
    pub agents: Vec<AgentSeedConfig>,
}

/// A seeded transport agent endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSeedConfig {
    pub host: String,
    pub port: Option<u16>,
    pub name: Option<String>,
}

/// Voice pipeline settings
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// Enable the voice pipeline
    pub enabled: Option<bool>,

    /// Recognizer daemon endpoint (host:port); voice is disabled without it
    pub recognizer_endpoint: Option<String>,

    /// PCM rate the recognizer expects
    pub recognizer_sample_rate: Option<u32>,

    /// Listening window after a wake phrase, seconds
    pub window_secs: Option<u64>,

    /// node id -> wake phrase
    #[serde(default)]
    pub wake_words: BTreeMap<String, String>,

    /// Global aliases: spoken phrase -> command name
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,

    /// Node-scoped aliases: node id -> (phrase -> command)
    #[serde(default)]
    pub node_aliases: BTreeMap<String, BTreeMap<String, String>>,
}

/// Persistence settings
#[derive(Debug, Default, Deserialize)]
pub struct DatabaseFileConfig {
    /// SQLite path; persistence is disabled when omitted
    pub path: Option<PathBuf>,
}

/// Recording settings
#[derive(Debug, Default, Deserialize)]
pub struct RecordingFileConfig {
    /// Directory recordings are written into
    pub output_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_parses_to_defaults() {
        let file: ConfigFile = toml::from_str("").unwrap();
        assert!(file.node.id.is_none());
        assert!(file.transport.agents.is_empty());
        assert!(file.voice.wake_words.is_empty());
    }

    #[test]
    fn full_file_parses() {
        let file: ConfigFile = toml::from_str(
            r#"
            [node]
            id = "indigo"
            name = "Indigo"
            host = "192.168.32.7"
            control_port = 8070
            roles = ["audio_hub", "transport_agent"]

            [node.tags]
            room = "studio-a"

            [discovery]
            beacon_port = 5557
            liveness_window_secs = 10

            [jack]
            client_name = "skeleton_crew"

            [transport]
            agent_port = 5555
            skew_warn_ms = 5.0

            [[transport.agents]]
            host = "192.168.32.11"
            port = 5555
            name = "karate"

            [voice]
            enabled = true
            recognizer_endpoint = "127.0.0.1:2700"

            [voice.wake_words]
            indigo = "computer indigo"

            [voice.aliases]
            play = "jack_transport_start"

            [voice.node_aliases.karate]
            "solo me" = "jack_transport_start"

            [database]
            path = "/var/lib/skeleton/skeleton.db"
            "#,
        )
        .unwrap();

        assert_eq!(file.node.id.as_deref(), Some("indigo"));
        assert_eq!(file.node.roles.as_ref().unwrap().len(), 2);
        assert_eq!(file.transport.agents.len(), 1);
        assert_eq!(file.transport.agents[0].host, "192.168.32.11");
        assert_eq!(
            file.voice.wake_words.get("indigo").unwrap(),
            "computer indigo"
        );
        assert_eq!(
            file.voice.node_aliases["karate"]["solo me"],
            "jack_transport_start"
        );
        assert!(file.database.path.is_some());
    }
}
