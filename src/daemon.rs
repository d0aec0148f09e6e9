//! Daemon - assembles and runs the node's components
//!
//! Construction wires the components together through handles (no
//! globals, so tests can build independent instances); `run` starts the
//! I/O loops, waits for the interrupt, and walks the ordered shutdown:
//! stop accepting invocations, cancel far-out scheduled actions, drain
//! the voice pipeline, close JACK, close sockets.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;

use crate::clock::wall_micros;
use crate::config::Config;
use crate::db::{self, HistoryStore, NodeStore};
use crate::discovery::{
    ClusterRegistry, DiscoveryService, NodeRole, NodeStatus, ServiceDescriptor, ServiceType,
};
use crate::events::{Event, EventBridge};
use crate::gateway::{GatewayClient, GatewayServer, DEFAULT_TIMEOUT};
use crate::jack::{reconnect_backoff, JackAdapter};
use crate::scheduler::Scheduler;
use crate::tools::{
    register_builtin_tools, register_coordinator_tools, BuiltinDeps, Recorder, ToolRegistry,
};
use crate::transport::{TransportAgent, TransportCoordinator};
use crate::voice::{
    capture_pair, AliasTable, CaptureConsumer, CommandDispatcher, SocketRecognizer, VoicePipeline,
    WakeGate, DEFAULT_QUEUE_CHUNKS,
};
use crate::{Error, Result};

/// Scheduled actions closer than this still fire during shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// The Skeleton Crew node daemon
pub struct Daemon {
    config: Config,
    bridge: EventBridge,
    cluster: Arc<ClusterRegistry>,
    adapter: Arc<JackAdapter>,
    scheduler: Arc<Scheduler>,
    registry: Arc<ToolRegistry>,
    discovery: Arc<DiscoveryService>,
    recorder: Arc<Recorder>,
    aliases: Arc<AliasTable>,
    node_store: Option<NodeStore>,
    capture: Option<CaptureConsumer>,
}

impl Daemon {
    /// Build the daemon's components from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a component fails to construct. An unreachable
    /// database is a degraded mode, not an error.
    pub fn new(config: Config) -> Result<Self> {
        let bridge = EventBridge::new();

        let (node_store, history_store) = match &config.database_path {
            Some(path) => match db::init(path) {
                Ok(pool) => (
                    Some(NodeStore::new(pool.clone())),
                    Some(HistoryStore::new(pool)),
                ),
                Err(e) => {
                    tracing::warn!(error = %e, "database unavailable, running without persistence");
                    (None, None)
                }
            },
            None => (None, None),
        };

        let cluster = Arc::new(ClusterRegistry::new(
            config.local_node(),
            config.discovery.liveness_window,
        ));
        if let Some(store) = &node_store {
            match store.load_all() {
                Ok(nodes) => {
                    tracing::info!(count = nodes.len(), "seeded peers from database");
                    cluster.seed(nodes);
                }
                Err(e) => tracing::warn!(error = %e, "could not seed peers from database"),
            }
        }

        let adapter = Arc::new(JackAdapter::new(&config.jack.client_name, bridge.clone()));
        let capture = if config.voice.enabled {
            let (sink, consumer) = capture_pair(DEFAULT_QUEUE_CHUNKS);
            adapter.set_capture_sink(sink);
            Some(consumer)
        } else {
            None
        };
        let recorder = Arc::new(Recorder::new(adapter.recorder_tap(), &config.recording_dir));

        let scheduler = Arc::new(Scheduler::new());
        let aliases = Arc::new(config.alias_table());

        let registry = Arc::new(ToolRegistry::new(bridge.clone()));
        if let Some(store) = history_store {
            registry.set_persist_hook(Arc::new(move |record| {
                if let Err(e) = store.append(record) {
                    tracing::warn!(error = %e, "failed to persist invocation");
                }
            }));
        }
        register_builtin_tools(
            &registry,
            &BuiltinDeps {
                adapter: Arc::clone(&adapter),
                cluster: Arc::clone(&cluster),
                recorder: Arc::clone(&recorder),
                aliases: Arc::clone(&aliases),
            },
        )?;

        let discovery = Arc::new(DiscoveryService::new(
            config.discovery.clone(),
            Arc::clone(&cluster),
            bridge.clone(),
        ));

        Ok(Self {
            config,
            bridge,
            cluster,
            adapter,
            scheduler,
            registry,
            discovery,
            recorder,
            aliases,
            node_store,
            capture,
        })
    }

    /// Event bridge for embedding UIs and tests
    #[must_use]
    pub fn bridge(&self) -> EventBridge {
        self.bridge.clone()
    }

    /// Run the daemon until interrupted.
    ///
    /// # Errors
    ///
    /// Returns `jack_unavailable` when JACK is unreachable at startup and
    /// this node declared the `audio_hub` role; other startup failures
    /// surface as their own errors.
    #[allow(clippy::too_many_lines)]
    pub async fn run(mut self) -> Result<()> {
        let local_id = self.config.node.id.clone();

        // JACK first: an audio hub without a server is a fatal misstart
        if let Err(e) = self.adapter.connect() {
            if self.config.node.roles.contains(&NodeRole::AudioHub) {
                tracing::error!(error = %e, "JACK unreachable and this node is an audio hub");
                return Err(e);
            }
            tracing::warn!(error = %e, "JACK unreachable, adapter will keep retrying");
        }

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        if self.config.jack.auto_connect {
            tasks.push(spawn_reconnect(Arc::clone(&self.adapter)));
        }
        tasks.push(self.adapter.spawn_transport_monitor());

        self.discovery.start().await?;
        self.register_local_services().await;

        if let Some(store) = self.node_store.clone() {
            let cluster = Arc::clone(&self.cluster);
            tasks.push(self.bridge.spawn_handler(
                &["node_discovered", "node_updated", "node_lost"],
                move |event| {
                    let node_id = match &event {
                        Event::NodeDiscovered { node } | Event::NodeUpdated { node } => {
                            node.id.clone()
                        }
                        Event::NodeLost { node_id } => node_id.clone(),
                        _ => return,
                    };
                    if let Some(node) = cluster.node(&node_id) {
                        if let Err(e) = store.upsert(&node) {
                            tracing::warn!(error = %e, "failed to mirror node");
                        }
                    }
                },
            ));
        }

        let agent = if self.config.node.roles.contains(&NodeRole::TransportAgent) {
            let agent = Arc::new(
                TransportAgent::bind(
                    self.config.transport.agent_port,
                    Arc::clone(&self.adapter),
                    Arc::clone(&self.scheduler),
                    self.bridge.clone(),
                    self.config.transport.skew_warn_ms,
                )
                .await?,
            );
            tasks.push(agent.spawn());
            Some(agent)
        } else {
            None
        };

        let _coordinator = if self
            .config
            .node
            .roles
            .contains(&NodeRole::TransportCoordinator)
        {
            let coordinator =
                Arc::new(TransportCoordinator::bind(self.config.transport.coordinator_port).await?);
            for seed in &self.config.transport.agents {
                match tokio::net::lookup_host((seed.host.as_str(), seed.port)).await {
                    Ok(mut addrs) => {
                        if let Some(addr) = addrs.next() {
                            coordinator.add_agent(addr, &seed.name);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(host = %seed.host, error = %e, "cannot resolve agent seed");
                    }
                }
            }
            register_coordinator_tools(
                &self.registry,
                Arc::clone(&coordinator),
                self.config.transport.default_pre_roll,
            )?;
            Some(coordinator)
        } else {
            None
        };

        let pipeline = self.start_voice_pipeline();

        let gateway = GatewayServer::serve(
            self.config.node.control_port,
            Arc::clone(&self.registry),
            Arc::clone(&self.cluster),
        )
        .await?;

        // Warm the service cache from peers we remember
        {
            let discovery = Arc::clone(&self.discovery);
            let peers = self.cluster.nodes(None, Some(NodeStatus::Offline));
            tasks.push(tokio::spawn(async move {
                let http = reqwest::Client::new();
                for peer in peers {
                    if let Err(e) = discovery
                        .warm_from_peer(&http, &peer.host, peer.control_port)
                        .await
                    {
                        tracing::debug!(peer = %peer.id, error = %e, "snapshot warm-up failed");
                    }
                }
            }));
        }

        match self.config.voice.wake_words.get(&local_id) {
            Some(phrase) if pipeline.is_some() => {
                tracing::info!(node_id = %local_id, "skeleton crew ready - say \"{phrase}\"");
            }
            _ => tracing::info!(node_id = %local_id, "skeleton crew ready"),
        }

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| Error::Internal(format!("signal handler failed: {e}")))?;
        tracing::info!("interrupt received, shutting down");

        // Ordered shutdown: no new invocations, then cancel far-out
        // actions, drain audio, close JACK, drop sockets.
        gateway.shutdown().await;

        let grace_micros =
            u64::try_from(SHUTDOWN_GRACE.as_micros()).unwrap_or(u64::MAX);
        self.scheduler.cancel_after(wall_micros() + grace_micros);
        if let Some(agent) = &agent {
            agent.disarm();
        }

        self.discovery.stop().await;

        if let Some(pipeline) = pipeline {
            pipeline.shutdown();
        }
        if self.recorder.is_recording() {
            if let Err(e) = self.recorder.stop() {
                tracing::warn!(error = %e, "failed to finalize recording");
            }
        }

        self.scheduler.shutdown();
        self.adapter.close();

        for task in tasks {
            task.abort();
        }

        tracing::info!("shutdown complete");
        Ok(())
    }

    async fn register_local_services(&self) {
        let node = self.config.local_node();
        let gateway_endpoint = format!("{}:{}", node.host, node.control_port);

        let mut services = vec![
            ServiceDescriptor::new(&node.id, ServiceType::RemoteJack, "remote_jack", &gateway_endpoint),
            ServiceDescriptor::new(&node.id, ServiceType::JackClient, "jack", "local"),
        ];
        if node.roles.contains(&NodeRole::TransportAgent) {
            services.push(ServiceDescriptor::new(
                &node.id,
                ServiceType::TransportAgent,
                "transport_agent",
                &format!("{}:{}", node.host, self.config.transport.agent_port),
            ));
        }
        if node.roles.contains(&NodeRole::TransportCoordinator) {
            services.push(ServiceDescriptor::new(
                &node.id,
                ServiceType::TransportCoordinator,
                "transport_coordinator",
                &gateway_endpoint,
            ));
        }
        if self.config.voice.enabled {
            services.push(ServiceDescriptor::new(
                &node.id,
                ServiceType::VoiceCommand,
                "voice_command",
                &gateway_endpoint,
            ));
        }

        for service in services {
            if let Err(e) = self.discovery.register_service(service).await {
                tracing::warn!(error = %e, "service registration failed");
            }
        }
    }

    fn start_voice_pipeline(&mut self) -> Option<VoicePipeline> {
        if !self.config.voice.enabled {
            tracing::info!("voice pipeline disabled by configuration");
            return None;
        }
        let Some(endpoint) = self.config.voice.recognizer_endpoint.clone() else {
            tracing::info!("no recognizer endpoint configured, voice pipeline disabled");
            return None;
        };
        let consumer = self.capture.take()?;

        let jack_rate = self.adapter.status().sample_rate;
        if jack_rate == 0 {
            tracing::warn!("JACK not running, voice pipeline disabled");
            return None;
        }

        let recognizer = match SocketRecognizer::connect(
            &endpoint,
            self.config.voice.recognizer_sample_rate,
        ) {
            Ok(recognizer) => recognizer,
            Err(e) => {
                tracing::warn!(endpoint, error = %e, "recognizer unreachable, voice pipeline disabled");
                return None;
            }
        };

        let gate = WakeGate::new(&self.config.voice.wake_words, self.config.voice.window);
        let dispatcher = self.command_dispatcher();

        match VoicePipeline::spawn(
            consumer,
            jack_rate,
            Box::new(recognizer),
            gate,
            (*self.aliases).clone(),
            self.bridge.clone(),
            dispatcher,
        ) {
            Ok(pipeline) => Some(pipeline),
            Err(e) => {
                tracing::error!(error = %e, "voice pipeline failed to start");
                None
            }
        }
    }

    /// Commands for the local node go to the local registry; others are
    /// forwarded to the target's gateway.
    fn command_dispatcher(&self) -> CommandDispatcher {
        let handle = tokio::runtime::Handle::current();
        let registry = Arc::clone(&self.registry);
        let cluster = Arc::clone(&self.cluster);
        let local_id = self.config.node.id.clone();
        let client = GatewayClient::new(&local_id);

        Box::new(move |msg| {
            let registry = Arc::clone(&registry);
            let cluster = Arc::clone(&cluster);
            let client = client.clone();
            let local_id = local_id.clone();

            handle.spawn(async move {
                let args = json!({
                    "command_alias": msg.raw_text,
                    "target_node": msg.target_node,
                });
                if msg.target_node == local_id {
                    let _ = registry
                        .execute("trigger_voice_command", args, "voice_pipeline")
                        .await;
                    return;
                }
                let Some(node) = cluster.node(&msg.target_node) else {
                    tracing::warn!(target = %msg.target_node, "voice command for unknown node");
                    return;
                };
                match client
                    .invoke_node(&node, "trigger_voice_command", args, DEFAULT_TIMEOUT)
                    .await
                {
                    Ok(response) if !response.is_ok() => {
                        tracing::warn!(
                            target = %msg.target_node,
                            error_kind = ?response.error_kind,
                            "remote voice command failed"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(target = %msg.target_node, error = %e, "remote voice command failed");
                    }
                }
            });
        })
    }
}

fn spawn_reconnect(adapter: Arc<JackAdapter>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut attempt: u32 = 0;
        loop {
            if adapter.is_running() {
                attempt = 0;
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
            match adapter.connect() {
                Ok(()) => {
                    attempt = 0;
                }
                Err(e) => {
                    let wait = reconnect_backoff(attempt);
                    tracing::debug!(
                        attempt,
                        wait_secs = wait.as_secs(),
                        error = %e,
                        "JACK reconnect failed"
                    );
                    attempt = attempt.saturating_add(1);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    })
}
