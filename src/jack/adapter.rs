//! JACK adapter - owns the daemon's single JACK client
//!
//! Every mutation of the local JACK graph funnels through this adapter so
//! that audit records, bridge events, and status queries stay consistent.
//! While the server is unreachable all operations fail with
//! `jack_unavailable` and `status()` returns a synthetic not-running
//! snapshot; a reconnect loop re-establishes the client with backoff.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::events::{Event, EventBridge};
use crate::voice::capture::{CaptureSink, RecorderTap};
use crate::{Error, Result};

use super::types::{
    JackPort, JackStatus, PortDirection, PortFilter, PortSummary, PortType, RunState,
    TransportState,
};

/// Reconnect backoff schedule in seconds; the last entry repeats
const RECONNECT_BACKOFF_SECS: [u64; 5] = [1, 2, 5, 10, 30];

/// Transport poll interval for change events
const TRANSPORT_POLL: Duration = Duration::from_millis(100);

/// Backoff delay for the given (0-based) failed attempt
#[must_use]
pub fn reconnect_backoff(attempt: u32) -> Duration {
    let idx = (attempt as usize).min(RECONNECT_BACKOFF_SECS.len() - 1);
    Duration::from_secs(RECONNECT_BACKOFF_SECS[idx])
}

/// Audio process handler: copies the capture port into the pipeline and
/// recorder queues. Runs on the JACK real-time thread, so it must not
/// allocate, block, or touch anything with a lock.
struct CaptureProcess {
    port: jack::Port<jack::AudioIn>,
    pipeline: Option<CaptureSink>,
    recorder: RecorderTap,
}

impl jack::ProcessHandler for CaptureProcess {
    fn process(&mut self, _: &jack::Client, ps: &jack::ProcessScope) -> jack::Control {
        let buf = self.port.as_slice(ps);
        if let Some(sink) = &self.pipeline {
            sink.push(buf);
        }
        self.recorder.push(buf);
        jack::Control::Continue
    }
}

/// Graph change notifications, forwarded to the event bridge.
///
/// Callbacks run on JACK's notification thread and must not panic.
struct Notifications {
    bridge: EventBridge,
    xruns: Arc<AtomicU64>,
}

impl jack::NotificationHandler for Notifications {
    fn port_registration(&mut self, client: &jack::Client, port_id: jack::PortId, is_registered: bool) {
        if let Some(port) = client.port_by_id(port_id) {
            if let Ok(name) = port.name() {
                self.bridge.publish(Event::JackPortChanged {
                    port: name,
                    registered: is_registered,
                });
            }
        }
    }

    fn ports_connected(
        &mut self,
        client: &jack::Client,
        port_a: jack::PortId,
        port_b: jack::PortId,
        are_connected: bool,
    ) {
        let name_of = |id| {
            client
                .port_by_id(id)
                .and_then(|p| p.name().ok().map(|n| (n, p.flags())))
        };
        let (Some((name_a, flags_a)), Some((name_b, _))) = (name_of(port_a), name_of(port_b))
        else {
            return;
        };
        // JACK reports the pair in registration order; orient by direction
        let (source_port, sink_port) = if flags_a.contains(jack::PortFlags::IS_OUTPUT) {
            (name_a, name_b)
        } else {
            (name_b, name_a)
        };
        self.bridge.publish(Event::JackConnectionChanged {
            source_port,
            sink_port,
            connected: are_connected,
        });
    }

    fn xrun(&mut self, _: &jack::Client) -> jack::Control {
        self.xruns.fetch_add(1, Ordering::Relaxed);
        jack::Control::Continue
    }
}

type ActiveClient = jack::AsyncClient<Notifications, CaptureProcess>;

enum Inner {
    Down { reason: String },
    Up(Box<ActiveClient>),
}

/// Adapter over the daemon's single JACK client
pub struct JackAdapter {
    client_name: String,
    capture_port_name: String,
    bridge: EventBridge,
    /// Pipeline capture sink, installed before the first connect
    pipeline_sink: Mutex<Option<CaptureSink>>,
    recorder_tap: RecorderTap,
    xruns: Arc<AtomicU64>,
    inner: Mutex<Inner>,
}

impl JackAdapter {
    /// Create an adapter in the disconnected state
    #[must_use]
    pub fn new(client_name: &str, bridge: EventBridge) -> Self {
        Self {
            client_name: client_name.to_string(),
            capture_port_name: "voice_in".to_string(),
            bridge,
            pipeline_sink: Mutex::new(None),
            recorder_tap: RecorderTap::new(),
            xruns: Arc::new(AtomicU64::new(0)),
            inner: Mutex::new(Inner::Down {
                reason: "not yet connected".to_string(),
            }),
        }
    }

    /// Install the voice pipeline's capture sink.
    ///
    /// Must be called before [`connect`](Self::connect); the sink is handed
    /// to the real-time callback at activation and cannot change afterwards.
    pub fn set_capture_sink(&self, sink: CaptureSink) {
        *self.pipeline_sink.lock().expect("capture sink lock") = Some(sink);
    }

    /// Recorder tap shared with the recording tools
    #[must_use]
    pub fn recorder_tap(&self) -> RecorderTap {
        self.recorder_tap.clone()
    }

    /// Fully qualified name of the voice capture port
    #[must_use]
    pub fn capture_port(&self) -> String {
        format!("{}:{}", self.client_name, self.capture_port_name)
    }

    /// Whether the JACK connection is currently up
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.inner.lock().expect("adapter lock"), Inner::Up(_))
    }

    /// Xruns observed since the client was activated
    #[must_use]
    pub fn xrun_count(&self) -> u64 {
        self.xruns.load(Ordering::Relaxed)
    }

    /// Connect to the JACK server and activate the client.
    ///
    /// Idempotent while up.
    ///
    /// # Errors
    ///
    /// Returns `jack_unavailable` if the server cannot be reached.
    pub fn connect(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("adapter lock");
        if matches!(*inner, Inner::Up(_)) {
            return Ok(());
        }

        let (client, _status) =
            jack::Client::new(&self.client_name, jack::ClientOptions::NO_START_SERVER).map_err(
                |e| {
                    let err = Error::JackUnavailable(e.to_string());
                    *inner = Inner::Down {
                        reason: e.to_string(),
                    };
                    err
                },
            )?;

        let sample_rate = client.sample_rate();
        let buffer_size = client.buffer_size();

        let port = client
            .register_port(&self.capture_port_name, jack::AudioIn::default())
            .map_err(|e| Error::JackUnavailable(format!("port registration failed: {e}")))?;

        let process = CaptureProcess {
            port,
            pipeline: self.pipeline_sink.lock().expect("capture sink lock").clone(),
            recorder: self.recorder_tap.clone(),
        };
        let notifications = Notifications {
            bridge: self.bridge.clone(),
            xruns: Arc::clone(&self.xruns),
        };

        let active = client
            .activate_async(notifications, process)
            .map_err(|e| Error::JackUnavailable(format!("activation failed: {e}")))?;

        tracing::info!(
            client = %self.client_name,
            sample_rate,
            buffer_size,
            "connected to JACK"
        );

        *inner = Inner::Up(Box::new(active));
        Ok(())
    }

    /// Deactivate and drop the JACK client
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("adapter lock");
        if let Inner::Up(active) = std::mem::replace(
            &mut *inner,
            Inner::Down {
                reason: "closed".to_string(),
            },
        ) {
            if let Err(e) = active.deactivate() {
                tracing::warn!(error = %e, "error deactivating JACK client");
            } else {
                tracing::info!("JACK client closed");
            }
        }
    }

    /// Snapshot the server state.
    ///
    /// Never fails: while JACK is unreachable this returns the synthetic
    /// not-running record instead.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn status(&self) -> JackStatus {
        let inner = self.inner.lock().expect("adapter lock");
        let Inner::Up(active) = &*inner else {
            return JackStatus::not_running();
        };
        let client = active.as_client();

        let all_ports = collect_ports(client);
        let mut summary = PortSummary::default();
        for port in &all_ports {
            match port.direction {
                PortDirection::Source => summary.source.push(port.name.clone()),
                PortDirection::Sink => summary.sink.push(port.name.clone()),
            }
        }
        summary.total = all_ports.len();

        let connections = collect_connections(client, &summary);
        let (transport_state, transport_frame) = query_transport(client);

        JackStatus {
            status: RunState::Running,
            sample_rate: client.sample_rate() as u32,
            buffer_size: client.buffer_size(),
            transport_state,
            transport_frame,
            ports: summary,
            connections,
        }
    }

    /// List ports passing `filter`.
    ///
    /// # Errors
    ///
    /// Returns `jack_unavailable` while the server is unreachable.
    pub fn list_ports(&self, filter: &PortFilter) -> Result<Vec<JackPort>> {
        let inner = self.inner.lock().expect("adapter lock");
        let Inner::Up(active) = &*inner else {
            return Err(self.unavailable(&inner));
        };
        let ports = collect_ports(active.as_client())
            .into_iter()
            .filter(|p| filter.matches(p))
            .collect();
        Ok(ports)
    }

    /// Connect `source` to `sink`.
    ///
    /// # Errors
    ///
    /// `jack_unavailable`, `endpoint_missing`, `direction_mismatch`, or
    /// `already_connected`.
    pub fn connect_ports(&self, source: &str, sink: &str) -> Result<()> {
        let inner = self.inner.lock().expect("adapter lock");
        let Inner::Up(active) = &*inner else {
            return Err(self.unavailable(&inner));
        };
        let client = active.as_client();

        let (src_port, snk_port) = resolve_pair(client, source, sink)?;

        if src_port.is_connected_to(sink).unwrap_or(false) {
            return Err(Error::AlreadyConnected {
                source_port: source.to_string(),
                sink_port: sink.to_string(),
            });
        }
        drop((src_port, snk_port));

        client
            .connect_ports_by_name(source, sink)
            .map_err(|e| Error::Internal(format!("jack connect failed: {e}")))?;

        tracing::info!(source, sink, "connected JACK ports");
        Ok(())
    }

    /// Disconnect `source` from `sink`.
    ///
    /// Disconnecting a pair that is not connected is an error, not a silent
    /// success.
    ///
    /// # Errors
    ///
    /// `jack_unavailable`, `endpoint_missing`, or `not_connected`.
    pub fn disconnect_ports(&self, source: &str, sink: &str) -> Result<()> {
        let inner = self.inner.lock().expect("adapter lock");
        let Inner::Up(active) = &*inner else {
            return Err(self.unavailable(&inner));
        };
        let client = active.as_client();

        let src_port = client
            .port_by_name(source)
            .ok_or_else(|| Error::EndpointMissing(source.to_string()))?;
        if client.port_by_name(sink).is_none() {
            return Err(Error::EndpointMissing(sink.to_string()));
        }

        if !src_port.is_connected_to(sink).unwrap_or(false) {
            return Err(Error::NotConnected {
                source_port: source.to_string(),
                sink_port: sink.to_string(),
            });
        }
        drop(src_port);

        client
            .disconnect_ports_by_name(source, sink)
            .map_err(|e| Error::Internal(format!("jack disconnect failed: {e}")))?;

        tracing::info!(source, sink, "disconnected JACK ports");
        Ok(())
    }

    /// Start the JACK transport.
    ///
    /// # Errors
    ///
    /// Returns `jack_unavailable` while the server is unreachable.
    pub fn transport_start(&self) -> Result<()> {
        self.with_transport("start", |t| t.start())
    }

    /// Stop the JACK transport.
    ///
    /// # Errors
    ///
    /// Returns `jack_unavailable` while the server is unreachable.
    pub fn transport_stop(&self) -> Result<()> {
        self.with_transport("stop", |t| t.stop())
    }

    /// Locate the transport to `frame`.
    ///
    /// # Errors
    ///
    /// Returns `jack_unavailable` while the server is unreachable.
    pub fn transport_locate(&self, frame: u64) -> Result<()> {
        // JACK frame positions are 32-bit on the wire to the server
        let frame = u32::try_from(frame).unwrap_or_else(|_| {
            tracing::warn!(frame, "locate frame exceeds u32, clamping");
            u32::MAX
        });
        self.with_transport("locate", |t| t.locate(frame))
    }

    /// Current transport state and frame.
    ///
    /// # Errors
    ///
    /// Returns `jack_unavailable` while the server is unreachable.
    pub fn transport_query(&self) -> Result<(TransportState, u64)> {
        let inner = self.inner.lock().expect("adapter lock");
        let Inner::Up(active) = &*inner else {
            return Err(self.unavailable(&inner));
        };
        Ok(query_transport(active.as_client()))
    }

    /// Spawn a task that polls the transport and publishes change events.
    ///
    /// JACK has no transport-change callback; the original frame counter
    /// moves every cycle, so changes are significant only on state
    /// transitions or locate jumps.
    pub fn spawn_transport_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let adapter = Arc::clone(self);
        tokio::spawn(async move {
            let mut last: Option<(TransportState, u64)> = None;
            let mut ticker = tokio::time::interval(TRANSPORT_POLL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Ok((state, frame)) = adapter.transport_query() else {
                    last = None;
                    continue;
                };
                let changed = match last {
                    None => true,
                    Some((prev_state, prev_frame)) => {
                        prev_state != state || frame.abs_diff(prev_frame) > 100_000
                    }
                };
                if changed {
                    adapter
                        .bridge
                        .publish(Event::JackTransportChanged { state, frame });
                    last = Some((state, frame));
                } else if state == TransportState::Rolling {
                    // Track the moving frame without emitting
                    last = Some((state, frame));
                }
            }
        })
    }

    fn with_transport<F>(&self, op: &str, f: F) -> Result<()>
    where
        F: FnOnce(&jack::Transport) -> std::result::Result<(), jack::Error>,
    {
        let inner = self.inner.lock().expect("adapter lock");
        let Inner::Up(active) = &*inner else {
            return Err(self.unavailable(&inner));
        };
        let transport = active.as_client().transport();
        f(&transport).map_err(|e| Error::Internal(format!("transport {op} failed: {e}")))?;
        tracing::debug!(op, "transport operation applied");
        Ok(())
    }

    fn unavailable(&self, inner: &Inner) -> Error {
        let reason = match inner {
            Inner::Down { reason } => reason.clone(),
            Inner::Up(_) => "unexpected".to_string(),
        };
        Error::JackUnavailable(reason)
    }
}

fn collect_ports(client: &jack::Client) -> Vec<JackPort> {
    let names = client.ports(None, None, jack::PortFlags::empty());
    let mut ports = Vec::with_capacity(names.len());
    for name in names {
        let Some(port) = client.port_by_name(&name) else {
            continue;
        };
        let flags = port.flags();
        let direction = if flags.contains(jack::PortFlags::IS_OUTPUT) {
            PortDirection::Source
        } else {
            PortDirection::Sink
        };
        let port_type = match port.port_type() {
            Ok(t) if t.contains("midi") => PortType::Midi,
            _ => PortType::Audio,
        };
        ports.push(JackPort {
            name,
            direction,
            port_type,
            physical: flags.contains(jack::PortFlags::IS_PHYSICAL),
            terminal: flags.contains(jack::PortFlags::IS_TERMINAL),
        });
    }
    ports
}

fn collect_connections(
    client: &jack::Client,
    summary: &PortSummary,
) -> BTreeMap<String, Vec<String>> {
    let mut connections = BTreeMap::new();
    for source in &summary.source {
        let Some(port) = client.port_by_name(source) else {
            continue;
        };
        if port.connected_count().unwrap_or(0) == 0 {
            continue;
        }
        let sinks: Vec<String> = summary
            .sink
            .iter()
            .filter(|sink| port.is_connected_to(sink).unwrap_or(false))
            .cloned()
            .collect();
        if !sinks.is_empty() {
            connections.insert(source.clone(), sinks);
        }
    }
    connections
}

fn resolve_pair<'c>(
    client: &'c jack::Client,
    source: &str,
    sink: &str,
) -> Result<(jack::Port<jack::Unowned>, jack::Port<jack::Unowned>)> {
    let src_port = client
        .port_by_name(source)
        .ok_or_else(|| Error::EndpointMissing(source.to_string()))?;
    let snk_port = client
        .port_by_name(sink)
        .ok_or_else(|| Error::EndpointMissing(sink.to_string()))?;

    if !src_port.flags().contains(jack::PortFlags::IS_OUTPUT) {
        return Err(Error::DirectionMismatch(format!(
            "{source} is not a source port"
        )));
    }
    if !snk_port.flags().contains(jack::PortFlags::IS_INPUT) {
        return Err(Error::DirectionMismatch(format!(
            "{sink} is not a sink port"
        )));
    }

    let src_type = src_port.port_type().unwrap_or_default();
    let snk_type = snk_port.port_type().unwrap_or_default();
    if src_type != snk_type {
        return Err(Error::DirectionMismatch(format!(
            "port type mismatch: {src_type} vs {snk_type}"
        )));
    }

    Ok((src_port, snk_port))
}

fn query_transport(client: &jack::Client) -> (TransportState, u64) {
    match client.transport().query() {
        Ok(tsp) => {
            let state = match tsp.state {
                jack::TransportState::Rolling => TransportState::Rolling,
                jack::TransportState::Starting => TransportState::Starting,
                _ => TransportState::Stopped,
            };
            (state, u64::from(tsp.pos.frame()))
        }
        Err(_) => (TransportState::Stopped, 0),
    }
}
