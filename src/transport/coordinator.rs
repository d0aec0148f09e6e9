//! Transport coordinator - fans timed commands out to agents
//!
//! The coordinator holds a set of agent endpoints and broadcasts each
//! command with a shared target instant of now plus the pre-roll. Sends
//! are best-effort UDP: a failure toward one agent is logged and the rest
//! still get the command. Confirmation, when needed, comes from
//! `query_all` after the target instant.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::net::UdpSocket;

use crate::clock::wall_seconds;
use crate::jack::TransportState;
use crate::{Error, Result};

use super::wire::TransportCommand;

/// A registered transport agent
#[derive(Debug, Clone, Serialize)]
pub struct AgentEndpoint {
    pub addr: SocketAddr,
    pub name: String,
}

/// One agent's reply to a fan-out query
#[derive(Debug, Clone, Serialize)]
pub struct TransportSnapshot {
    pub state: TransportState,
    pub frame: i64,
    /// Agent wall clock when the reply was produced
    pub reported_at: f64,
}

/// Coordinates JACK transport across agents on multiple machines
pub struct TransportCoordinator {
    socket: UdpSocket,
    agents: Mutex<BTreeMap<SocketAddr, String>>,
}

impl TransportCoordinator {
    /// Bind the coordinator's reply socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|e| Error::Wire(format!("coordinator bind failed: {e}")))?;
        Ok(Self {
            socket,
            agents: Mutex::new(BTreeMap::new()),
        })
    }

    /// Add an agent endpoint. Returns false if it was already present.
    pub fn add_agent(&self, addr: SocketAddr, name: &str) -> bool {
        let mut agents = self.agents.lock().expect("agents lock");
        let added = agents.insert(addr, name.to_string()).is_none();
        if added {
            tracing::info!(%addr, name, "added transport agent");
        } else {
            tracing::debug!(%addr, "agent already registered");
        }
        added
    }

    /// Remove an agent endpoint. Returns false if it was not present.
    pub fn remove_agent(&self, addr: SocketAddr) -> bool {
        let removed = self
            .agents
            .lock()
            .expect("agents lock")
            .remove(&addr)
            .is_some();
        if removed {
            tracing::info!(%addr, "removed transport agent");
        }
        removed
    }

    /// Remove every agent
    pub fn clear_agents(&self) {
        self.agents.lock().expect("agents lock").clear();
    }

    /// Current membership
    #[must_use]
    pub fn agents(&self) -> Vec<AgentEndpoint> {
        self.agents
            .lock()
            .expect("agents lock")
            .iter()
            .map(|(addr, name)| AgentEndpoint {
                addr: *addr,
                name: name.clone(),
            })
            .collect()
    }

    /// Start transport on all agents at now + `pre_roll` seconds.
    ///
    /// Returns the shared target instant.
    pub async fn start_all(&self, pre_roll: f64) -> f64 {
        let target = wall_seconds() + pre_roll;
        self.send_to_all(&TransportCommand::Start {
            target: Some(target),
        })
        .await;
        tracing::info!(target, pre_roll, "sent coordinated start");
        target
    }

    /// Stop transport on all agents. A pre-roll of zero stops immediately.
    ///
    /// Returns the shared target instant, if one was scheduled.
    pub async fn stop_all(&self, pre_roll: f64) -> Option<f64> {
        if pre_roll > 0.0 {
            let target = wall_seconds() + pre_roll;
            self.send_to_all(&TransportCommand::Stop {
                target: Some(target),
            })
            .await;
            tracing::info!(target, pre_roll, "sent coordinated stop");
            Some(target)
        } else {
            self.send_to_all(&TransportCommand::Stop { target: None }).await;
            tracing::info!("sent immediate stop");
            None
        }
    }

    /// Locate all agents to `frame` immediately
    pub async fn locate_all(&self, frame: i64) {
        self.send_to_all(&TransportCommand::Locate { frame }).await;
        tracing::info!(frame, "sent locate");
    }

    /// Locate to `frame` and start at now + `pre_roll` on all agents.
    ///
    /// Returns the shared target instant.
    pub async fn locate_and_start_all(&self, frame: i64, pre_roll: f64) -> f64 {
        let target = wall_seconds() + pre_roll;
        self.send_to_all(&TransportCommand::LocateStart { frame, target })
            .await;
        tracing::info!(frame, target, pre_roll, "sent coordinated locate-start");
        target
    }

    /// Query every agent, collecting replies until each has answered or
    /// `timeout` elapses.
    pub async fn query_all(&self, timeout: Duration) -> BTreeMap<SocketAddr, TransportSnapshot> {
        let expected: Vec<SocketAddr> = self
            .agents
            .lock()
            .expect("agents lock")
            .keys()
            .copied()
            .collect();

        self.send_to_all(&TransportCommand::Query).await;

        let mut replies = BTreeMap::new();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = vec![0u8; 4096];

        while replies.len() < expected.len() {
            let recv = tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf)).await;
            let Ok(Ok((n, from))) = recv else {
                break;
            };
            if !expected.contains(&from) {
                tracing::debug!(%from, "ignoring reply from unknown agent");
                continue;
            }
            match TransportCommand::decode(&buf[..n]) {
                Ok(TransportCommand::State {
                    state,
                    frame,
                    reported_at,
                }) => {
                    replies.insert(
                        from,
                        TransportSnapshot {
                            state,
                            frame,
                            reported_at,
                        },
                    );
                }
                Ok(other) => {
                    tracing::debug!(%from, ?other, "unexpected reply to query");
                }
                Err(e) => {
                    tracing::debug!(%from, error = %e, "malformed query reply");
                }
            }
        }

        let missing = expected.len() - replies.len();
        if missing > 0 {
            tracing::warn!(missing, "agents did not answer query within timeout");
        }
        replies
    }

    async fn send_to_all(&self, command: &TransportCommand) {
        let frame = match command.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "command encode failed");
                return;
            }
        };
        let agents: Vec<(SocketAddr, String)> = self
            .agents
            .lock()
            .expect("agents lock")
            .iter()
            .map(|(a, n)| (*a, n.clone()))
            .collect();

        for (addr, name) in agents {
            if let Err(e) = self.socket.send_to(&frame, addr).await {
                tracing::warn!(%addr, name = %name, error = %e, "send to agent failed");
            }
        }
    }
}
