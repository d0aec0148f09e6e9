//! Built-in tool set: JACK control, recording, cluster queries, voice
//!
//! These are the operations reachable from voice commands and from remote
//! nodes through the invocation gateway, all dispatched through the
//! audited registry.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::{json, Value};

use crate::discovery::{ClusterRegistry, NodeStatus, ServiceType};
use crate::error::FieldDiagnostic;
use crate::jack::{JackAdapter, PortDirection, PortFilter, PortType};
use crate::transport::TransportCoordinator;
use crate::voice::{normalize, AliasTable};
use crate::{Error, Result};

use super::record::Recorder;
use super::registry::{ParamType, ToolParameter, ToolRegistry, ToolSpec};

/// Shared dependencies of the built-in tools
pub struct BuiltinDeps {
    pub adapter: Arc<JackAdapter>,
    pub cluster: Arc<ClusterRegistry>,
    pub recorder: Arc<Recorder>,
    pub aliases: Arc<AliasTable>,
}

/// Register the built-in tools.
///
/// # Errors
///
/// Returns `tool_exists` if any name is already taken.
#[allow(clippy::too_many_lines)]
pub fn register_builtin_tools(registry: &Arc<ToolRegistry>, deps: &BuiltinDeps) -> Result<()> {
    let adapter = Arc::clone(&deps.adapter);
    registry.register(ToolSpec::new(
        "jack_status",
        "Get JACK server status, ports, connections, and transport state",
        "jack",
        move |_args| {
            let adapter = Arc::clone(&adapter);
            async move { Ok(serde_json::to_value(adapter.status())?) }
        },
    ))?;

    let adapter = Arc::clone(&deps.adapter);
    registry.register(
        ToolSpec::new(
            "list_jack_ports",
            "List JACK ports, optionally filtered",
            "jack",
            move |args| {
                let adapter = Arc::clone(&adapter);
                async move {
                    let filter = PortFilter {
                        pattern: args
                            .get("pattern")
                            .and_then(Value::as_str)
                            .map(ToString::to_string),
                        port_type: match args.get("port_type").and_then(Value::as_str) {
                            Some("audio") => Some(PortType::Audio),
                            Some("midi") => Some(PortType::Midi),
                            _ => None,
                        },
                        direction: match args.get("direction").and_then(Value::as_str) {
                            Some("source") => Some(PortDirection::Source),
                            Some("sink") => Some(PortDirection::Sink),
                            _ => None,
                        },
                    };
                    let ports = adapter.list_ports(&filter)?;
                    Ok(json!({ "total": ports.len(), "ports": ports }))
                }
            },
        )
        .param(
            ToolParameter::new("port_type", ParamType::String, "audio, midi, or all")
                .one_of(&["audio", "midi", "all"])
                .with_default(json!("all")),
        )
        .param(
            ToolParameter::new("direction", ParamType::String, "source, sink, or all")
                .one_of(&["source", "sink", "all"])
                .with_default(json!("all")),
        )
        .param(ToolParameter::new(
            "pattern",
            ParamType::String,
            "substring match on the port name",
        )),
    )?;

    let adapter = Arc::clone(&deps.adapter);
    registry.register(
        ToolSpec::new(
            "connect_jack_ports",
            "Create a connection between two JACK ports",
            "jack",
            move |args| {
                let adapter = Arc::clone(&adapter);
                async move {
                    let source = required_str(&args, "source")?;
                    let sink = required_str(&args, "sink")?;
                    adapter.connect_ports(&source, &sink)?;
                    Ok(json!({ "source": source, "sink": sink, "connected": true }))
                }
            },
        )
        .dangerous()
        .param(
            ToolParameter::new("source", ParamType::String, "source port, e.g. system:capture_1")
                .required(),
        )
        .param(
            ToolParameter::new("sink", ParamType::String, "sink port, e.g. voice_in:in_1")
                .required(),
        ),
    )?;

    let adapter = Arc::clone(&deps.adapter);
    registry.register(
        ToolSpec::new(
            "disconnect_jack_ports",
            "Remove a connection between two JACK ports",
            "jack",
            move |args| {
                let adapter = Arc::clone(&adapter);
                async move {
                    let source = required_str(&args, "source")?;
                    let sink = required_str(&args, "sink")?;
                    adapter.disconnect_ports(&source, &sink)?;
                    Ok(json!({ "source": source, "sink": sink, "connected": false }))
                }
            },
        )
        .dangerous()
        .param(ToolParameter::new("source", ParamType::String, "source port").required())
        .param(ToolParameter::new("sink", ParamType::String, "sink port").required()),
    )?;

    let adapter = Arc::clone(&deps.adapter);
    registry.register(
        ToolSpec::new(
            "jack_transport_start",
            "Start the local JACK transport",
            "transport",
            move |_args| {
                let adapter = Arc::clone(&adapter);
                async move {
                    adapter.transport_start()?;
                    Ok(json!({ "transport": "started" }))
                }
            },
        )
        .dangerous(),
    )?;

    let adapter = Arc::clone(&deps.adapter);
    registry.register(
        ToolSpec::new(
            "jack_transport_stop",
            "Stop the local JACK transport",
            "transport",
            move |_args| {
                let adapter = Arc::clone(&adapter);
                async move {
                    adapter.transport_stop()?;
                    Ok(json!({ "transport": "stopped" }))
                }
            },
        )
        .dangerous(),
    )?;

    let adapter = Arc::clone(&deps.adapter);
    registry.register(
        ToolSpec::new(
            "jack_transport_locate",
            "Locate the local JACK transport to a frame",
            "transport",
            move |args| {
                let adapter = Arc::clone(&adapter);
                async move {
                    let frame = args.get("frame").and_then(Value::as_i64).unwrap_or(0);
                    let frame = u64::try_from(frame).map_err(|_| {
                        Error::InvalidArgs(vec![FieldDiagnostic {
                            field: "frame".to_string(),
                            problem: "must be non-negative".to_string(),
                        }])
                    })?;
                    adapter.transport_locate(frame)?;
                    Ok(json!({ "transport": "located", "frame": frame }))
                }
            },
        )
        .dangerous()
        .param(ToolParameter::new("frame", ParamType::Integer, "target frame").required()),
    )?;

    let adapter = Arc::clone(&deps.adapter);
    let recorder = Arc::clone(&deps.recorder);
    registry.register(
        ToolSpec::new(
            "record_start",
            "Start recording the voice input port to a WAV file",
            "recording",
            move |args| {
                let adapter = Arc::clone(&adapter);
                let recorder = Arc::clone(&recorder);
                async move {
                    let filename = args.get("filename").and_then(Value::as_str);
                    let duration = args
                        .get("duration_seconds")
                        .and_then(Value::as_u64);
                    let sample_rate = adapter.status().sample_rate;
                    let path = recorder.start(sample_rate, filename, duration)?;
                    Ok(json!({ "recording": true, "path": path }))
                }
            },
        )
        .dangerous()
        .param(ToolParameter::new(
            "filename",
            ParamType::String,
            "output filename, defaults to a timestamped name",
        ))
        .param(ToolParameter::new(
            "duration_seconds",
            ParamType::Integer,
            "maximum duration before the recording stops on its own",
        )),
    )?;

    let recorder = Arc::clone(&deps.recorder);
    registry.register(
        ToolSpec::new(
            "record_stop",
            "Stop the active recording",
            "recording",
            move |_args| {
                let recorder = Arc::clone(&recorder);
                async move {
                    let summary = recorder.stop()?;
                    Ok(serde_json::to_value(summary)?)
                }
            },
        )
        .dangerous(),
    )?;

    let cluster = Arc::clone(&deps.cluster);
    registry.register(
        ToolSpec::new(
            "get_node_status",
            "Get status of cluster nodes",
            "cluster",
            move |args| {
                let cluster = Arc::clone(&cluster);
                async move {
                    if let Some(node_id) = args.get("node_id").and_then(Value::as_str) {
                        let node = cluster.node(node_id);
                        return Ok(json!({
                            "node": node,
                            "services": cluster.services_by_node(node_id),
                        }));
                    }
                    let nodes = cluster.nodes(None, None);
                    let online = nodes
                        .iter()
                        .filter(|n| n.status == NodeStatus::Online)
                        .count();
                    Ok(json!({
                        "total_nodes": nodes.len(),
                        "online_nodes": online,
                        "nodes": nodes,
                    }))
                }
            },
        )
        .param(ToolParameter::new(
            "node_id",
            ParamType::String,
            "specific node to inspect",
        )),
    )?;

    let cluster = Arc::clone(&deps.cluster);
    registry.register(
        ToolSpec::new(
            "list_services",
            "List services advertised across the cluster",
            "cluster",
            move |args| {
                let cluster = Arc::clone(&cluster);
                async move {
                    if let Some(node_id) = args.get("node_id").and_then(Value::as_str) {
                        let services = cluster.services_by_node(node_id);
                        return Ok(json!({ "total": services.len(), "services": services }));
                    }
                    if let Some(topic) = args.get("service_type").and_then(Value::as_str) {
                        let service_type: ServiceType =
                            serde_json::from_value(json!(topic)).map_err(|_| {
                                Error::InvalidArgs(vec![FieldDiagnostic {
                                    field: "service_type".to_string(),
                                    problem: format!("unknown service type: {topic}"),
                                }])
                            })?;
                        let services = cluster.services_by_type(service_type);
                        return Ok(json!({ "total": services.len(), "services": services }));
                    }
                    let all = cluster.all_services();
                    let total: usize = all.values().map(Vec::len).sum();
                    Ok(json!({ "total": total, "services_by_node": all }))
                }
            },
        )
        .param(ToolParameter::new(
            "node_id",
            ParamType::String,
            "restrict to one node",
        ))
        .param(ToolParameter::new(
            "service_type",
            ParamType::String,
            "restrict to one service type",
        )),
    )?;

    let aliases = Arc::clone(&deps.aliases);
    let registry_weak: Weak<ToolRegistry> = Arc::downgrade(registry);
    registry.register(
        ToolSpec::new(
            "trigger_voice_command",
            "Execute a voice command alias through the registry",
            "voice",
            move |args| {
                let aliases = Arc::clone(&aliases);
                let registry_weak = registry_weak.clone();
                async move {
                    let alias = required_str(&args, "command_alias")?;
                    let target = args
                        .get("target_node")
                        .and_then(Value::as_str)
                        .unwrap_or("local")
                        .to_string();

                    let normalized = normalize(&alias);
                    let command = aliases
                        .resolve(&target, &normalized)
                        .map_or_else(|| alias.clone(), ToString::to_string);

                    let registry = registry_weak
                        .upgrade()
                        .ok_or_else(|| Error::Internal("registry dropped".to_string()))?;
                    let record = registry
                        .execute(&command, json!({}), "voice_command")
                        .await;

                    Ok(json!({
                        "alias": alias,
                        "command": command,
                        "target": target,
                        "invocation": record,
                    }))
                }
            },
        )
        .dangerous()
        .param(
            ToolParameter::new("command_alias", ParamType::String, "alias to execute").required(),
        )
        .param(ToolParameter::new(
            "target_node",
            ParamType::String,
            "node the command addresses, defaults to local",
        )),
    )?;

    tracing::info!(count = registry.tool_names().len(), "registered built-in tools");
    Ok(())
}

/// Register the coordinator tools on nodes carrying that role.
///
/// # Errors
///
/// Returns `tool_exists` if any name is already taken.
pub fn register_coordinator_tools(
    registry: &Arc<ToolRegistry>,
    coordinator: Arc<TransportCoordinator>,
    default_pre_roll: f64,
) -> Result<()> {
    let coord = Arc::clone(&coordinator);
    registry.register(
        ToolSpec::new(
            "transport_start_all",
            "Start transport on every registered agent at now + pre_roll",
            "transport",
            move |args| {
                let coord = Arc::clone(&coord);
                async move {
                    let pre_roll = args
                        .get("pre_roll")
                        .and_then(Value::as_f64)
                        .unwrap_or(default_pre_roll);
                    let target = coord.start_all(pre_roll).await;
                    Ok(json!({ "target_instant": target, "agents": coord.agents().len() }))
                }
            },
        )
        .dangerous()
        .param(ToolParameter::new(
            "pre_roll",
            ParamType::Number,
            "seconds of lead time before the coordinated start",
        )),
    )?;

    let coord = Arc::clone(&coordinator);
    registry.register(
        ToolSpec::new(
            "transport_stop_all",
            "Stop transport on every registered agent",
            "transport",
            move |args| {
                let coord = Arc::clone(&coord);
                async move {
                    let pre_roll = args.get("pre_roll").and_then(Value::as_f64).unwrap_or(0.0);
                    let target = coord.stop_all(pre_roll).await;
                    Ok(json!({ "target_instant": target, "agents": coord.agents().len() }))
                }
            },
        )
        .dangerous()
        .param(ToolParameter::new(
            "pre_roll",
            ParamType::Number,
            "seconds of lead time; zero stops immediately",
        )),
    )?;

    let coord = Arc::clone(&coordinator);
    registry.register(
        ToolSpec::new(
            "transport_locate_start_all",
            "Locate every agent to a frame and start at now + pre_roll",
            "transport",
            move |args| {
                let coord = Arc::clone(&coord);
                async move {
                    let frame = args.get("frame").and_then(Value::as_i64).unwrap_or(0);
                    let pre_roll = args
                        .get("pre_roll")
                        .and_then(Value::as_f64)
                        .unwrap_or(default_pre_roll);
                    let target = coord.locate_and_start_all(frame, pre_roll).await;
                    Ok(json!({
                        "target_instant": target,
                        "frame": frame,
                        "agents": coord.agents().len(),
                    }))
                }
            },
        )
        .dangerous()
        .param(ToolParameter::new("frame", ParamType::Integer, "target frame").required())
        .param(ToolParameter::new(
            "pre_roll",
            ParamType::Number,
            "seconds of lead time before the coordinated start",
        )),
    )?;

    let coord = coordinator;
    registry.register(
        ToolSpec::new(
            "transport_query_all",
            "Collect transport state from every registered agent",
            "transport",
            move |args| {
                let coord = Arc::clone(&coord);
                async move {
                    let timeout_ms = args
                        .get("timeout_ms")
                        .and_then(Value::as_u64)
                        .unwrap_or(1_000);
                    let replies = coord.query_all(Duration::from_millis(timeout_ms)).await;
                    let by_endpoint: BTreeMap<String, Value> = replies
                        .into_iter()
                        .map(|(addr, snapshot)| {
                            (addr.to_string(), serde_json::to_value(snapshot).unwrap_or_default())
                        })
                        .collect();
                    Ok(json!({ "agents": by_endpoint.len(), "states": by_endpoint }))
                }
            },
        )
        .param(ToolParameter::new(
            "timeout_ms",
            ParamType::Integer,
            "per-query reply window in milliseconds",
        )),
    )?;

    Ok(())
}

fn required_str(args: &serde_json::Map<String, Value>, field: &str) -> Result<String> {
    args.get(field)
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| {
            Error::InvalidArgs(vec![FieldDiagnostic {
                field: field.to_string(),
                problem: "missing required parameter".to_string(),
            }])
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::NodeDescriptor;
    use crate::events::EventBridge;
    use crate::tools::registry::{HistoryFilter, InvocationOutcome};
    use crate::voice::RecorderTap;
    use crate::ErrorKind;
    use std::collections::{BTreeMap, BTreeSet};
    use std::time::Duration;

    fn deps() -> (Arc<ToolRegistry>, BuiltinDeps) {
        let bridge = EventBridge::new();
        let adapter = Arc::new(JackAdapter::new("skc_test", bridge.clone()));
        let local = NodeDescriptor {
            id: "indigo".to_string(),
            name: "Indigo".to_string(),
            host: "127.0.0.1".to_string(),
            control_port: 8070,
            roles: BTreeSet::new(),
            tags: BTreeMap::new(),
            status: crate::discovery::NodeStatus::Online,
            last_seen_ms: 0,
        };
        let cluster = Arc::new(ClusterRegistry::new(local, Duration::from_secs(10)));
        let tmp = std::env::temp_dir().join("skc-builtin-tests");
        let deps = BuiltinDeps {
            adapter: Arc::clone(&adapter),
            cluster,
            recorder: Arc::new(Recorder::new(RecorderTap::new(), &tmp)),
            aliases: Arc::new(AliasTable::with_defaults()),
        };
        let registry = Arc::new(ToolRegistry::new(bridge));
        register_builtin_tools(&registry, &deps).unwrap();
        (registry, deps)
    }

    #[tokio::test]
    async fn jack_status_without_server_is_ok_not_running() {
        let (registry, _deps) = deps();
        let record = registry.execute("jack_status", json!({}), "indigo").await;
        match record.outcome {
            InvocationOutcome::Ok { result } => {
                assert_eq!(result["status"], "not_running");
                assert_eq!(result["transport_state"], "stopped");
                assert_eq!(result["ports"]["total"], 0);
                assert!(result["connections"].as_object().unwrap().is_empty());
            }
            InvocationOutcome::Error { .. } => panic!("jack_status must not fail"),
        }
    }

    #[tokio::test]
    async fn connect_without_server_is_jack_unavailable() {
        let (registry, _deps) = deps();
        let record = registry
            .execute(
                "connect_jack_ports",
                json!({"source": "system:capture_1", "sink": "voice_in:in_1"}),
                "indigo",
            )
            .await;
        match record.outcome {
            InvocationOutcome::Error { error_kind, retryable, .. } => {
                assert_eq!(error_kind, ErrorKind::JackUnavailable);
                assert!(retryable);
            }
            InvocationOutcome::Ok { .. } => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn connect_missing_args_is_invalid_args() {
        let (registry, _deps) = deps();
        let record = registry
            .execute("connect_jack_ports", json!({"source": "a:out"}), "indigo")
            .await;
        match record.outcome {
            InvocationOutcome::Error { error_kind, .. } => {
                assert_eq!(error_kind, ErrorKind::InvalidArgs);
            }
            InvocationOutcome::Ok { .. } => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn get_node_status_reports_the_local_node() {
        let (registry, _deps) = deps();
        let record = registry.execute("get_node_status", json!({}), "indigo").await;
        match record.outcome {
            InvocationOutcome::Ok { result } => {
                assert_eq!(result["total_nodes"], 1);
                assert_eq!(result["online_nodes"], 1);
            }
            InvocationOutcome::Error { .. } => panic!("expected ok"),
        }
    }

    #[tokio::test]
    async fn list_services_rejects_unknown_type() {
        let (registry, _deps) = deps();
        let record = registry
            .execute("list_services", json!({"service_type": "telepathy"}), "indigo")
            .await;
        match record.outcome {
            InvocationOutcome::Error { error_kind, .. } => {
                assert_eq!(error_kind, ErrorKind::InvalidArgs);
            }
            InvocationOutcome::Ok { .. } => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn trigger_voice_command_resolves_alias_and_audits_inner_call() {
        let (registry, _deps) = deps();
        let record = registry
            .execute(
                "trigger_voice_command",
                json!({"command_alias": "play"}),
                "indigo",
            )
            .await;

        // The outer call succeeds even though the inner transport start
        // fails without JACK; the inner outcome is carried in the result
        match record.outcome {
            InvocationOutcome::Ok { result } => {
                assert_eq!(result["command"], "jack_transport_start");
                assert_eq!(result["invocation"]["outcome"], "error");
                assert_eq!(result["invocation"]["error_kind"], "jack_unavailable");
            }
            InvocationOutcome::Error { .. } => panic!("expected ok envelope"),
        }

        // Both invocations are in the audit history
        let history = registry.history(&HistoryFilter::default());
        let tools: Vec<&str> = history.iter().map(|h| h.tool.as_str()).collect();
        assert!(tools.contains(&"trigger_voice_command"));
        assert!(tools.contains(&"jack_transport_start"));
    }

    #[tokio::test]
    async fn all_core_tools_are_registered() {
        let (registry, _deps) = deps();
        let names = registry.tool_names();
        for expected in [
            "jack_status",
            "list_jack_ports",
            "connect_jack_ports",
            "disconnect_jack_ports",
            "jack_transport_start",
            "jack_transport_stop",
            "jack_transport_locate",
            "record_start",
            "record_stop",
            "get_node_status",
            "list_services",
            "trigger_voice_command",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }
}
