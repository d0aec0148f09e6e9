//! Remote invocation gateway: HTTP server and client

mod client;
mod server;

pub use client::{GatewayClient, DEFAULT_TIMEOUT};
pub use server::{GatewayServer, InvokeOutcome, InvokeRequest, InvokeResponse};
