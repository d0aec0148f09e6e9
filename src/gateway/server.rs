//! Gateway HTTP server
//!
//! Exposes the tool registry and cluster registry to peers. Callers are
//! identified by the node id they send; the LAN is trusted, so there is no
//! further authentication. Every remote invocation lands in the local
//! audit history with the caller id preserved.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::discovery::ClusterRegistry;
use crate::error::ErrorKind;
use crate::tools::{HistoryFilter, InvocationOutcome, ToolRegistry};
use crate::{Error, Result};

/// Remote invocation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub request_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
    pub caller_id: String,
}

/// Invocation outcome discriminator on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvokeOutcome {
    Ok,
    Error,
}

/// Remote invocation response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub request_id: String,
    pub outcome: InvokeOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl InvokeResponse {
    /// Whether the remote invocation succeeded
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.outcome == InvokeOutcome::Ok
    }
}

#[derive(Clone)]
struct AppState {
    registry: Arc<ToolRegistry>,
    cluster: Arc<ClusterRegistry>,
}

/// Running gateway server
pub struct GatewayServer {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl GatewayServer {
    /// Bind and serve the gateway on `port` (0 for ephemeral).
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn serve(
        port: u16,
        registry: Arc<ToolRegistry>,
        cluster: Arc<ClusterRegistry>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| Error::Config(format!("gateway bind failed: {e}")))?;
        let addr = listener.local_addr()?;

        let state = AppState { registry, cluster };
        let app = Router::new()
            .route("/api/invoke", post(invoke))
            .route("/api/services", get(services))
            .route("/api/nodes", get(nodes))
            .route("/api/tools", get(tools))
            .route("/api/history", get(history))
            .route("/api/health", get(health))
            .with_state(state);

        let (shutdown, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = rx.changed().await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "gateway server exited with error");
            }
        });

        tracing::info!(port = addr.port(), "invocation gateway listening");

        Ok(Self {
            addr,
            shutdown,
            task,
        })
    }

    /// Bound address
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Gracefully stop the server
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
        tracing::info!("invocation gateway stopped");
    }
}

async fn invoke(
    State(state): State<AppState>,
    Json(request): Json<InvokeRequest>,
) -> Json<InvokeResponse> {
    tracing::debug!(
        tool = %request.tool_name,
        caller = %request.caller_id,
        request_id = %request.request_id,
        "remote invocation"
    );

    let record = state
        .registry
        .execute(&request.tool_name, request.args, &request.caller_id)
        .await;

    let response = match record.outcome {
        InvocationOutcome::Ok { result } => InvokeResponse {
            request_id: request.request_id,
            outcome: InvokeOutcome::Ok,
            result: Some(result),
            error_kind: None,
            message: None,
            retryable: None,
        },
        InvocationOutcome::Error {
            error_kind,
            message,
            retryable,
        } => InvokeResponse {
            request_id: request.request_id,
            outcome: InvokeOutcome::Error,
            result: None,
            error_kind: Some(error_kind),
            message: Some(message),
            retryable: Some(retryable),
        },
    };
    Json(response)
}

#[derive(Debug, Deserialize)]
struct ServicesQuery {
    node: Option<String>,
}

async fn services(
    State(state): State<AppState>,
    Query(query): Query<ServicesQuery>,
) -> Json<Value> {
    match query.node {
        Some(node_id) => {
            let mut snapshot = std::collections::BTreeMap::new();
            snapshot.insert(node_id.clone(), state.cluster.services_by_node(&node_id));
            Json(serde_json::to_value(snapshot).unwrap_or_default())
        }
        None => Json(serde_json::to_value(state.cluster.all_services()).unwrap_or_default()),
    }
}

async fn nodes(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.cluster.nodes(None, None)).unwrap_or_default())
}

async fn tools(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.registry.describe()).unwrap_or_default())
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    tool: Option<String>,
    caller: Option<String>,
    limit: Option<usize>,
}

async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<Value> {
    let filter = HistoryFilter {
        tool: query.tool,
        caller_id: query.caller,
        limit: query.limit,
    };
    Json(serde_json::to_value(state.registry.history(&filter)).unwrap_or_default())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "node_id": state.cluster.local_node_id(),
    }))
}
