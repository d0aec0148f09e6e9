//! Event bridge - typed fan-out of core events to subscribers
//!
//! Every component publishes through one [`EventBridge`]; subscribers pull a
//! receiver and drain it on whatever executor they choose (UI main thread,
//! worker task). The bridge owns nothing beyond the channel, never blocks a
//! publisher, and drops laggy subscribers with a warning rather than letting
//! them back up the daemon.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::discovery::{NodeDescriptor, ServiceDescriptor};
use crate::error::ErrorKind;
use crate::jack::TransportState;

/// Channel capacity for core events
const CHANNEL_CAPACITY: usize = 256;

/// Core daemon events
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A new node appeared on the LAN
    NodeDiscovered { node: NodeDescriptor },
    /// A known node changed name, address, roles, or status
    NodeUpdated { node: NodeDescriptor },
    /// A node's heartbeats stopped for longer than the liveness window
    NodeLost { node_id: String },
    /// Two nodes claimed the same id; the later heartbeat won
    IdCollision { node_id: String, host: String },

    /// A service was registered on some node
    ServiceRegistered { service: ServiceDescriptor },
    /// A service descriptor changed
    ServiceUpdated { service: ServiceDescriptor },
    /// A service was unregistered
    ServiceUnregistered {
        node_id: String,
        service_name: String,
    },

    /// A port appeared in or vanished from the local JACK graph
    JackPortChanged { port: String, registered: bool },
    /// A connection was made or broken in the local JACK graph
    JackConnectionChanged {
        source_port: String,
        sink_port: String,
        connected: bool,
    },
    /// Local JACK transport changed state
    JackTransportChanged { state: TransportState, frame: u64 },

    /// A scheduled transport action fired; skew is actual minus target
    TransportSkewReported {
        action: String,
        target_micros: u64,
        skew_ms: f64,
    },

    /// A wake phrase opened a listening window for a node
    VoiceWake { node_id: String },
    /// A spoken command resolved through the alias table
    VoiceCommand {
        target_node: String,
        command: String,
        raw_text: String,
        confidence: f64,
    },
    /// A listening window closed without a command
    WakeTimeout { node_id: String },

    /// A tool invocation began
    ToolInvocationStarted {
        invocation_id: String,
        tool: String,
        caller_id: String,
    },
    /// A tool invocation finished
    ToolInvocationFinished {
        invocation_id: String,
        tool: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_kind: Option<ErrorKind>,
    },
}

impl Event {
    /// Short label for logging and subscriber filters
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NodeDiscovered { .. } => "node_discovered",
            Self::NodeUpdated { .. } => "node_updated",
            Self::NodeLost { .. } => "node_lost",
            Self::IdCollision { .. } => "id_collision",
            Self::ServiceRegistered { .. } => "service_registered",
            Self::ServiceUpdated { .. } => "service_updated",
            Self::ServiceUnregistered { .. } => "service_unregistered",
            Self::JackPortChanged { .. } => "jack_port_changed",
            Self::JackConnectionChanged { .. } => "jack_connection_changed",
            Self::JackTransportChanged { .. } => "jack_transport_changed",
            Self::TransportSkewReported { .. } => "transport_skew_reported",
            Self::VoiceWake { .. } => "voice_wake",
            Self::VoiceCommand { .. } => "voice_command",
            Self::WakeTimeout { .. } => "wake_timeout",
            Self::ToolInvocationStarted { .. } => "tool_invocation_started",
            Self::ToolInvocationFinished { .. } => "tool_invocation_finished",
        }
    }
}

/// Typed publish-subscribe hub for daemon events
#[derive(Debug, Clone)]
pub struct EventBridge {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBridge {
    /// Create a new bridge with no subscribers
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Never blocks; an event with no subscribers is dropped silently.
    pub fn publish(&self, event: Event) {
        tracing::trace!(event = event.kind(), "publishing event");
        let _ = self.tx.send(event);
    }

    /// Publish a batch of events in order
    pub fn publish_all<I: IntoIterator<Item = Event>>(&self, events: I) {
        for event in events {
            self.publish(event);
        }
    }

    /// Subscribe to all events from this point on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Spawn a task that delivers events of the given kinds to `handler`.
    ///
    /// Passing an empty `kinds` slice delivers everything. Events are
    /// delivered to one handler in publish order; a handler that falls
    /// behind the channel capacity loses the oldest events and a warning
    /// is logged with the lag count.
    pub fn spawn_handler<F>(&self, kinds: &[&'static str], mut handler: F) -> tokio::task::JoinHandle<()>
    where
        F: FnMut(Event) + Send + 'static,
    {
        let mut rx = self.subscribe();
        let kinds: Vec<&'static str> = kinds.to_vec();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if kinds.is_empty() || kinds.contains(&event.kind()) {
                            handler(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "event subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
