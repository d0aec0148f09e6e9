//! JACK adapter and graph types

mod adapter;
mod types;

pub use adapter::{reconnect_backoff, JackAdapter};
pub use types::{
    JackPort, JackStatus, PortDirection, PortFilter, PortSummary, PortType, RunState,
    TransportState,
};
