//! JACK graph and transport types

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// JACK transport states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Stopped,
    Rolling,
    Starting,
    Stopping,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Rolling => "rolling",
            Self::Starting => "starting",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TransportState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(Self::Stopped),
            "rolling" => Ok(Self::Rolling),
            "starting" => Ok(Self::Starting),
            "stopping" => Ok(Self::Stopping),
            other => Err(format!("unknown transport state: {other}")),
        }
    }
}

/// Direction of a JACK port, from the graph's point of view.
///
/// A source produces audio (a JACK output port); a sink consumes it
/// (a JACK input port). Connections always run source to sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    Source,
    Sink,
}

/// Payload type of a JACK port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortType {
    Audio,
    Midi,
}

/// A port in the JACK graph, fully qualified as `client:port`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JackPort {
    pub name: String,
    pub direction: PortDirection,
    pub port_type: PortType,
    pub physical: bool,
    pub terminal: bool,
}

/// Filter for port listings; `None` fields match everything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortFilter {
    /// Substring match on the fully qualified name
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub port_type: Option<PortType>,
    #[serde(default)]
    pub direction: Option<PortDirection>,
}

impl PortFilter {
    /// Whether `port` passes this filter
    #[must_use]
    pub fn matches(&self, port: &JackPort) -> bool {
        if let Some(pattern) = &self.pattern {
            if !port.name.contains(pattern.as_str()) {
                return false;
            }
        }
        if let Some(pt) = self.port_type {
            if port.port_type != pt {
                return false;
            }
        }
        if let Some(dir) = self.direction {
            if port.direction != dir {
                return false;
            }
        }
        true
    }
}

/// Whether the JACK server connection is up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    NotRunning,
}

/// Port listing split by direction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortSummary {
    pub source: Vec<String>,
    pub sink: Vec<String>,
    pub total: usize,
}

/// Snapshot of the local JACK server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JackStatus {
    pub status: RunState,
    pub sample_rate: u32,
    pub buffer_size: u32,
    pub transport_state: TransportState,
    pub transport_frame: u64,
    pub ports: PortSummary,
    /// Connection map: source port to the sinks it feeds
    pub connections: BTreeMap<String, Vec<String>>,
}

impl JackStatus {
    /// Synthetic status returned while the JACK server is unreachable
    #[must_use]
    pub fn not_running() -> Self {
        Self {
            status: RunState::NotRunning,
            sample_rate: 0,
            buffer_size: 0,
            transport_state: TransportState::Stopped,
            transport_frame: 0,
            ports: PortSummary::default(),
            connections: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, direction: PortDirection, port_type: PortType) -> JackPort {
        JackPort {
            name: name.to_string(),
            direction,
            port_type,
            physical: false,
            terminal: false,
        }
    }

    #[test]
    fn filter_matches_on_all_axes() {
        let p = port("system:capture_1", PortDirection::Source, PortType::Audio);

        assert!(PortFilter::default().matches(&p));
        assert!(PortFilter {
            pattern: Some("capture".to_string()),
            ..Default::default()
        }
        .matches(&p));
        assert!(!PortFilter {
            pattern: Some("playback".to_string()),
            ..Default::default()
        }
        .matches(&p));
        assert!(!PortFilter {
            direction: Some(PortDirection::Sink),
            ..Default::default()
        }
        .matches(&p));
        assert!(!PortFilter {
            port_type: Some(PortType::Midi),
            ..Default::default()
        }
        .matches(&p));
    }

    #[test]
    fn not_running_snapshot_matches_wire_shape() {
        let status = JackStatus::not_running();
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "not_running");
        assert_eq!(json["transport_state"], "stopped");
        assert_eq!(json["ports"]["total"], 0);
        assert!(json["connections"].as_object().unwrap().is_empty());
    }

    #[test]
    fn transport_state_round_trips_through_str() {
        for state in [
            TransportState::Stopped,
            TransportState::Rolling,
            TransportState::Starting,
            TransportState::Stopping,
        ] {
            let parsed: TransportState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("paused".parse::<TransportState>().is_err());
    }
}
