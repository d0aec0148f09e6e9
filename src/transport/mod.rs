//! Coordinated transport: wire protocol, agent, coordinator

mod agent;
mod coordinator;
mod wire;

pub use agent::{TransportAgent, DEFAULT_SKEW_WARN_MS};
pub use coordinator::{AgentEndpoint, TransportCoordinator, TransportSnapshot};
pub use wire::{
    TransportCommand, ADDR_LOCATE, ADDR_LOCATE_START, ADDR_QUERY, ADDR_START, ADDR_STATE,
    ADDR_STOP,
};
