//! Transport wire protocol
//!
//! Coordinated transport rides OSC over UDP so external address-pattern
//! tools stay interoperable. Timestamps are seconds-since-epoch doubles;
//! frames are 64-bit integers. The decoder tolerates 32-bit floats and
//! ints from older senders.

use rosc::{OscMessage, OscPacket, OscType};

use crate::jack::TransportState;
use crate::{Error, Result};

/// OSC addresses understood by the transport agent
pub const ADDR_START: &str = "/transport/start";
pub const ADDR_STOP: &str = "/transport/stop";
pub const ADDR_LOCATE: &str = "/transport/locate";
pub const ADDR_LOCATE_START: &str = "/transport/locate_start";
pub const ADDR_QUERY: &str = "/transport/query";
pub const ADDR_STATE: &str = "/transport/state";

/// A decoded transport message
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    /// Start at `target` seconds, or immediately when absent
    Start { target: Option<f64> },
    /// Stop at `target` seconds, or immediately when absent
    Stop { target: Option<f64> },
    /// Immediate locate
    Locate { frame: i64 },
    /// Locate to `frame`, then start at `target`
    LocateStart { frame: i64, target: f64 },
    /// Request a `State` reply to the sender
    Query,
    /// Agent state report
    State {
        state: TransportState,
        frame: i64,
        reported_at: f64,
    },
}

impl TransportCommand {
    /// Encode to OSC bytes.
    ///
    /// # Errors
    ///
    /// Returns a wire error if OSC encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let message = match self {
            Self::Start { target } => OscMessage {
                addr: ADDR_START.to_string(),
                args: target.map(OscType::Double).into_iter().collect(),
            },
            Self::Stop { target } => OscMessage {
                addr: ADDR_STOP.to_string(),
                args: target.map(OscType::Double).into_iter().collect(),
            },
            Self::Locate { frame } => OscMessage {
                addr: ADDR_LOCATE.to_string(),
                args: vec![OscType::Long(*frame)],
            },
            Self::LocateStart { frame, target } => OscMessage {
                addr: ADDR_LOCATE_START.to_string(),
                args: vec![OscType::Long(*frame), OscType::Double(*target)],
            },
            Self::Query => OscMessage {
                addr: ADDR_QUERY.to_string(),
                args: Vec::new(),
            },
            Self::State {
                state,
                frame,
                reported_at,
            } => OscMessage {
                addr: ADDR_STATE.to_string(),
                args: vec![
                    OscType::String(state.to_string()),
                    OscType::Long(*frame),
                    OscType::Double(*reported_at),
                ],
            },
        };

        rosc::encoder::encode(&OscPacket::Message(message))
            .map_err(|e| Error::Wire(format!("osc encode failed: {e}")))
    }

    /// Decode OSC bytes into a command.
    ///
    /// # Errors
    ///
    /// Returns a wire error for undecodable packets, unknown addresses, or
    /// missing/mistyped arguments. Callers drop the datagram and bump a
    /// counter.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (_, packet) = rosc::decoder::decode_udp(buf)
            .map_err(|e| Error::Wire(format!("osc decode failed: {e:?}")))?;
        let OscPacket::Message(message) = packet else {
            return Err(Error::Wire("osc bundles are not supported".to_string()));
        };

        match message.addr.as_str() {
            ADDR_START => Ok(Self::Start {
                target: opt_seconds(&message.args, 0)?,
            }),
            ADDR_STOP => Ok(Self::Stop {
                target: opt_seconds(&message.args, 0)?,
            }),
            ADDR_LOCATE => Ok(Self::Locate {
                frame: req_frame(&message.args, 0)?,
            }),
            ADDR_LOCATE_START => Ok(Self::LocateStart {
                frame: req_frame(&message.args, 0)?,
                target: req_seconds(&message.args, 1)?,
            }),
            ADDR_QUERY => Ok(Self::Query),
            ADDR_STATE => {
                let state_str = match message.args.first() {
                    Some(OscType::String(s)) => s.clone(),
                    _ => return Err(Error::Wire("state reply missing state string".to_string())),
                };
                let state = state_str
                    .parse::<TransportState>()
                    .map_err(Error::Wire)?;
                Ok(Self::State {
                    state,
                    frame: req_frame(&message.args, 1)?,
                    reported_at: req_seconds(&message.args, 2)?,
                })
            }
            other => Err(Error::Wire(format!("unknown address: {other}"))),
        }
    }
}

fn opt_seconds(args: &[OscType], idx: usize) -> Result<Option<f64>> {
    match args.get(idx) {
        None => Ok(None),
        Some(arg) => seconds_of(arg).map(Some),
    }
}

fn req_seconds(args: &[OscType], idx: usize) -> Result<f64> {
    args.get(idx)
        .ok_or_else(|| Error::Wire(format!("missing time argument at {idx}")))
        .and_then(seconds_of)
}

fn seconds_of(arg: &OscType) -> Result<f64> {
    match arg {
        OscType::Double(d) => Ok(*d),
        OscType::Float(f) => Ok(f64::from(*f)),
        other => Err(Error::Wire(format!("expected time, got {other:?}"))),
    }
}

fn req_frame(args: &[OscType], idx: usize) -> Result<i64> {
    match args.get(idx) {
        Some(OscType::Long(l)) => Ok(*l),
        Some(OscType::Int(i)) => Ok(i64::from(*i)),
        Some(other) => Err(Error::Wire(format!("expected frame, got {other:?}"))),
        None => Err(Error::Wire(format!("missing frame argument at {idx}"))),
    }
}
