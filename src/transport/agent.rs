//! Transport agent - schedules coordinated transport actions
//!
//! Listens for OSC transport commands and drives the JACK adapter at the
//! requested wall-clock instant through the deadline scheduler. The agent
//! is a small state machine: idle, armed (an action is scheduled), firing.
//! A newer armed command supersedes the pending one; a target already in
//! the past is rejected outright.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::clock::{seconds_to_micros, wall_micros, wall_seconds};
use crate::events::{Event, EventBridge};
use crate::jack::{JackAdapter, TransportState};
use crate::scheduler::{ScheduleHandle, Scheduler};
use crate::{Error, Result};

use super::wire::TransportCommand;

/// Default skew threshold above which a warning is logged
pub const DEFAULT_SKEW_WARN_MS: f64 = 5.0;

/// What an armed action will do when it fires
#[derive(Debug, Clone, Copy)]
enum ArmedKind {
    Start,
    Stop,
    LocateStart { frame: u64 },
}

impl ArmedKind {
    const fn label(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::LocateStart { .. } => "locate_start",
        }
    }
}

enum AgentState {
    Idle,
    Armed {
        handle: ScheduleHandle,
        target_micros: u64,
        kind: ArmedKind,
    },
}

/// OSC-driven transport agent
pub struct TransportAgent {
    socket: Arc<UdpSocket>,
    adapter: Arc<JackAdapter>,
    scheduler: Arc<Scheduler>,
    bridge: EventBridge,
    state: Arc<Mutex<AgentState>>,
    skew_warn_ms: f64,
    malformed: Arc<AtomicU64>,
    rejected_past: Arc<AtomicU64>,
}

impl TransportAgent {
    /// Bind the agent's UDP socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub async fn bind(
        port: u16,
        adapter: Arc<JackAdapter>,
        scheduler: Arc<Scheduler>,
        bridge: EventBridge,
        skew_warn_ms: f64,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|e| Error::Wire(format!("agent bind failed: {e}")))?;

        tracing::info!(port = socket.local_addr()?.port(), "transport agent listening");

        Ok(Self {
            socket: Arc::new(socket),
            adapter,
            scheduler,
            bridge,
            state: Arc::new(Mutex::new(AgentState::Idle)),
            skew_warn_ms,
            malformed: Arc::new(AtomicU64::new(0)),
            rejected_past: Arc::new(AtomicU64::new(0)),
        })
    }

    /// The bound socket address
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Datagrams dropped as malformed
    #[must_use]
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Commands rejected because their target was in the past
    #[must_use]
    pub fn rejected_past_count(&self) -> u64 {
        self.rejected_past.load(Ordering::Relaxed)
    }

    /// Cancel any pending armed action
    pub fn disarm(&self) {
        let mut state = self.state.lock().expect("agent state lock");
        if let AgentState::Armed { handle, kind, .. } =
            std::mem::replace(&mut *state, AgentState::Idle)
        {
            tracing::info!(action = kind.label(), "disarming pending transport action");
            handle.cancel();
        }
    }

    /// Run the receive loop until aborted
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let Ok((n, from)) = agent.socket.recv_from(&mut buf).await else {
                    continue;
                };
                match TransportCommand::decode(&buf[..n]) {
                    Ok(command) => agent.handle_command(command, from).await,
                    Err(e) => {
                        agent.malformed.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(%from, error = %e, "dropping malformed transport message");
                    }
                }
            }
        })
    }

    async fn handle_command(&self, command: TransportCommand, from: SocketAddr) {
        match command {
            TransportCommand::Start { target: None } => {
                tracing::info!("immediate transport start");
                if let Err(e) = self.adapter.transport_start() {
                    tracing::warn!(error = %e, "transport start failed");
                }
            }
            TransportCommand::Start { target: Some(t) } => {
                self.arm(ArmedKind::Start, t);
            }
            TransportCommand::Stop { target: None } => {
                tracing::info!("immediate transport stop");
                if let Err(e) = self.adapter.transport_stop() {
                    tracing::warn!(error = %e, "transport stop failed");
                }
            }
            TransportCommand::Stop { target: Some(t) } => {
                self.arm(ArmedKind::Stop, t);
            }
            TransportCommand::Locate { frame } => {
                let frame = u64::try_from(frame).unwrap_or(0);
                tracing::info!(frame, "immediate locate");
                if let Err(e) = self.adapter.transport_locate(frame) {
                    tracing::warn!(error = %e, "locate failed");
                }
            }
            TransportCommand::LocateStart { frame, target } => {
                let frame = u64::try_from(frame).unwrap_or(0);
                self.arm(ArmedKind::LocateStart { frame }, target);
            }
            TransportCommand::Query => self.reply_state(from).await,
            TransportCommand::State { .. } => {
                // Replies are coordinator-bound; an agent receiving one is
                // a misdirected datagram
                tracing::debug!(%from, "ignoring state reply addressed to an agent");
            }
        }
    }

    fn arm(&self, kind: ArmedKind, target_seconds: f64) {
        let target_micros = seconds_to_micros(target_seconds);
        let now = wall_micros();
        if target_micros < now {
            self.rejected_past.fetch_add(1, Ordering::Relaxed);
            #[allow(clippy::cast_precision_loss)]
            let behind_ms = (now - target_micros) as f64 / 1000.0;
            tracing::warn!(
                action = kind.label(),
                behind_ms,
                "rejecting transport command with target in the past"
            );
            return;
        }

        let mut state = self.state.lock().expect("agent state lock");
        if let AgentState::Armed {
            handle,
            target_micros: old_target,
            kind: old_kind,
        } = &*state
        {
            tracing::info!(
                superseded = old_kind.label(),
                old_target = old_target,
                new = kind.label(),
                new_target = target_micros,
                "superseding armed transport action"
            );
            handle.cancel();
        }

        let adapter = Arc::clone(&self.adapter);
        let bridge = self.bridge.clone();
        let state_ref = Arc::clone(&self.state);
        let skew_warn_ms = self.skew_warn_ms;

        let handle = self.scheduler.schedule_at(target_micros, move |skew_us| {
            *state_ref.lock().expect("agent state lock") = AgentState::Idle;

            let result = match kind {
                ArmedKind::Start => adapter.transport_start(),
                ArmedKind::Stop => adapter.transport_stop(),
                ArmedKind::LocateStart { frame } => adapter
                    .transport_locate(frame)
                    .and_then(|()| adapter.transport_start()),
            };
            if let Err(e) = result {
                tracing::warn!(action = kind.label(), error = %e, "scheduled transport action failed");
            }

            #[allow(clippy::cast_precision_loss)]
            let skew_ms = skew_us as f64 / 1000.0;
            if skew_ms.abs() > skew_warn_ms {
                tracing::warn!(
                    action = kind.label(),
                    skew_ms,
                    "transport action fired outside skew budget"
                );
            } else {
                tracing::info!(action = kind.label(), skew_ms, "transport action fired");
            }
            bridge.publish(Event::TransportSkewReported {
                action: kind.label().to_string(),
                target_micros,
                skew_ms,
            });
        });

        #[allow(clippy::cast_precision_loss)]
        let lead_s = (target_micros - now) as f64 / 1_000_000.0;
        tracing::info!(action = kind.label(), lead_s, "armed transport action");
        *state = AgentState::Armed {
            handle,
            target_micros,
            kind,
        };
    }

    async fn reply_state(&self, to: SocketAddr) {
        let (state, frame) = self
            .adapter
            .transport_query()
            .unwrap_or((TransportState::Stopped, 0));
        let reply = TransportCommand::State {
            state,
            frame: i64::try_from(frame).unwrap_or(i64::MAX),
            reported_at: wall_seconds(),
        };
        match reply.encode() {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, to).await {
                    tracing::warn!(%to, error = %e, "state reply failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "state reply encode failed"),
        }
    }
}
