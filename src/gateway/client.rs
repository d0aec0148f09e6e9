//! Gateway client for invoking tools on remote nodes

use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use crate::discovery::NodeDescriptor;
use crate::{Error, Result};

use super::server::{InvokeRequest, InvokeResponse};

/// Default caller-side timeout for remote invocations
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client for remote tool invocation
#[derive(Debug, Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    caller_id: String,
}

impl GatewayClient {
    /// Create a client identifying itself as `caller_id`
    #[must_use]
    pub fn new(caller_id: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            caller_id: caller_id.to_string(),
        }
    }

    /// Invoke `tool_name` on the node reachable at `host:port`.
    ///
    /// The timeout is enforced locally: on expiry this returns
    /// `remote_timeout` while the server side still completes and records
    /// its own history.
    ///
    /// # Errors
    ///
    /// Returns `remote_timeout` on timeout or an http error on transport
    /// failure. A delivered error envelope is returned as `Ok` - the
    /// caller inspects the outcome.
    pub async fn invoke(
        &self,
        host: &str,
        port: u16,
        tool_name: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<InvokeResponse> {
        let request = InvokeRequest {
            request_id: Uuid::new_v4().to_string(),
            tool_name: tool_name.to_string(),
            args,
            caller_id: self.caller_id.clone(),
        };
        let url = format!("http://{host}:{port}/api/invoke");

        let result = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                tracing::warn!(
                    host,
                    port,
                    tool = tool_name,
                    timeout_ms = timeout.as_millis() as u64,
                    "remote invocation timed out"
                );
                return Err(Error::RemoteTimeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let envelope: InvokeResponse = response.error_for_status()?.json().await?;
        if envelope.request_id != request.request_id {
            tracing::warn!(
                sent = %request.request_id,
                got = %envelope.request_id,
                "response correlates to a different request"
            );
        }
        Ok(envelope)
    }

    /// Invoke a tool on a node from the cluster registry
    ///
    /// # Errors
    ///
    /// Same as [`invoke`](Self::invoke).
    pub async fn invoke_node(
        &self,
        node: &NodeDescriptor,
        tool_name: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<InvokeResponse> {
        self.invoke(&node.host, node.control_port, tool_name, args, timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{ClusterRegistry, NodeStatus};
    use crate::events::EventBridge;
    use crate::gateway::GatewayServer;
    use crate::tools::{HistoryFilter, ParamType, ToolParameter, ToolRegistry, ToolSpec};
    use crate::ErrorKind;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;

    fn cluster() -> Arc<ClusterRegistry> {
        Arc::new(ClusterRegistry::new(
            NodeDescriptor {
                id: "indigo".to_string(),
                name: "Indigo".to_string(),
                host: "127.0.0.1".to_string(),
                control_port: 0,
                roles: BTreeSet::new(),
                tags: BTreeMap::new(),
                status: NodeStatus::Online,
                last_seen_ms: 0,
            },
            Duration::from_secs(10),
        ))
    }

    async fn server_with_tools() -> (GatewayServer, Arc<ToolRegistry>) {
        let registry = Arc::new(ToolRegistry::new(EventBridge::new()));
        registry
            .register(
                ToolSpec::new("echo", "echo", "test", |args| async move {
                    Ok(Value::Object(args))
                })
                .param(ToolParameter::new("text", ParamType::String, "t").required()),
            )
            .unwrap();
        registry
            .register(ToolSpec::new("slow", "sleeps", "test", |_| async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(serde_json::json!({"done": true}))
            }))
            .unwrap();

        let server = GatewayServer::serve(0, Arc::clone(&registry), cluster())
            .await
            .unwrap();
        (server, registry)
    }

    #[tokio::test]
    async fn round_trip_invocation() {
        let (server, _registry) = server_with_tools().await;
        let client = GatewayClient::new("karate");

        let response = client
            .invoke(
                "127.0.0.1",
                server.addr().port(),
                "echo",
                serde_json::json!({"text": "hello"}),
                DEFAULT_TIMEOUT,
            )
            .await
            .unwrap();

        assert!(response.is_ok());
        assert_eq!(response.result.unwrap()["text"], "hello");
        server.shutdown().await;
    }

    #[tokio::test]
    async fn error_envelope_carries_stable_kind() {
        let (server, registry) = server_with_tools().await;
        let client = GatewayClient::new("karate");

        let response = client
            .invoke(
                "127.0.0.1",
                server.addr().port(),
                "no_such_tool",
                serde_json::json!({}),
                DEFAULT_TIMEOUT,
            )
            .await
            .unwrap();

        assert!(!response.is_ok());
        assert_eq!(response.error_kind, Some(ErrorKind::ToolNotFound));

        // Caller identity is preserved in the server-side audit
        let history = registry.history(&HistoryFilter::default());
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].caller_id, "karate");
        server.shutdown().await;
    }

    #[tokio::test]
    async fn caller_timeout_is_remote_timeout_but_server_still_records() {
        let (server, registry) = server_with_tools().await;
        let client = GatewayClient::new("karate");

        let err = client
            .invoke(
                "127.0.0.1",
                server.addr().port(),
                "slow",
                serde_json::json!({}),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteTimeout);

        // The server side completes and records its own history
        tokio::time::sleep(Duration::from_millis(600)).await;
        let history = registry.history(&HistoryFilter {
            tool: Some("slow".to_string()),
            ..Default::default()
        });
        assert_eq!(history.len(), 1);
        assert!(history[0].outcome.is_ok());
        server.shutdown().await;
    }
}
