//! Skeleton Crew - distributed control plane for JACK audio workstations
//!
//! Every machine on the LAN runs one node daemon. Nodes find each other
//! through UDP beacons, advertise services on a pub/sub channel, start and
//! stop JACK transport together against a shared wall-clock instant, and
//! expose their audio graph to peers through an audited tool registry.
//! A real-time voice pipeline turns a JACK input port into node-addressed
//! commands gated by wake words.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       Subscribers                          │
//! │      GUI canvas  │  docks  │  logs  │  tests               │
//! └───────────────────────────┬────────────────────────────────┘
//!                             │ events
//! ┌───────────────────────────▼────────────────────────────────┐
//! │                       Event Bridge                         │
//! └───────────────────────────┬────────────────────────────────┘
//!                             │
//! ┌───────────┬───────────────┼───────────────┬────────────────┐
//! │ Discovery │ Tool Registry │ Voice Pipeline│ Transport      │
//! │ beacons + │ schema + audit│ capture →     │ agent +        │
//! │ services  │               │ wake → command│ coordinator    │
//! └─────┬─────┴───────┬───────┴───────┬───────┴────────┬───────┘
//!       │             │               │                │
//! ┌─────▼─────┐ ┌─────▼──────┐ ┌──────▼──────┐ ┌───────▼──────┐
//! │ UDP LAN   │ │ Gateway    │ │ JACK Adapter│ │ Scheduler    │
//! │ broadcast │ │ (HTTP)     │ │ (one client)│ │ (min-heap)   │
//! └───────────┘ └────────────┘ └─────────────┘ └──────────────┘
//! ```

pub mod clock;
pub mod config;
pub mod daemon;
pub mod db;
pub mod discovery;
pub mod error;
pub mod events;
pub mod gateway;
pub mod jack;
pub mod scheduler;
pub mod tools;
pub mod transport;
pub mod voice;

pub use config::Config;
pub use daemon::Daemon;
pub use db::{DbConn, DbPool};
pub use discovery::{
    ClusterRegistry, DiscoveryService, NodeDescriptor, NodeRole, NodeStatus, ServiceDescriptor,
    ServiceType,
};
pub use error::{Error, ErrorKind, FieldDiagnostic, Result};
pub use events::{Event, EventBridge};
pub use gateway::{GatewayClient, GatewayServer, InvokeRequest, InvokeResponse};
pub use jack::{JackAdapter, JackStatus, TransportState};
pub use scheduler::{ScheduleHandle, Scheduler};
pub use tools::{ToolInvocation, ToolRegistry, ToolSpec};
pub use transport::{TransportAgent, TransportCommand, TransportCoordinator};
pub use voice::{AliasTable, StreamingRecognizer, VoicePipeline, WakeGate};
