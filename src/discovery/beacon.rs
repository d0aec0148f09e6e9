//! Discovery wire format
//!
//! Every discovery datagram is a length-prefixed frame: a two-byte magic,
//! the wire version, a kind byte, a big-endian payload length, then a JSON
//! body. The explicit version byte lets mixed-version LANs coexist; frames
//! from a future version are dropped with a counter, never misparsed.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

use super::types::{NodeDescriptor, NodeRole, NodeStatus};

/// Frame magic
pub const MAGIC: [u8; 2] = *b"SK";

/// Current wire version
pub const WIRE_VERSION: u8 = 1;

/// Maximum accepted payload size; discovery frames are small
const MAX_PAYLOAD: usize = 64 * 1024;

/// Frame kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Node presence beacon
    Beacon,
    /// Service channel message
    Service,
}

impl FrameKind {
    const fn as_byte(self) -> u8 {
        match self {
            Self::Beacon => 1,
            Self::Service => 2,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Beacon),
            2 => Some(Self::Service),
            _ => None,
        }
    }
}

/// Periodic node announcement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Beacon {
    pub wire_version: u8,
    pub node_id: String,
    pub node_name: String,
    pub host: String,
    pub control_port: u16,
    pub roles: BTreeSet<NodeRole>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Sender's wall clock in milliseconds
    pub timestamp_ms: u64,
}

impl Beacon {
    /// Build a beacon announcing `node` at `timestamp_ms`
    #[must_use]
    pub fn announce(node: &NodeDescriptor, timestamp_ms: u64) -> Self {
        Self {
            wire_version: WIRE_VERSION,
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            host: node.host.clone(),
            control_port: node.control_port,
            roles: node.roles.clone(),
            tags: node.tags.clone(),
            timestamp_ms,
        }
    }

    /// Descriptor for the announcing node, marked online
    #[must_use]
    pub fn into_descriptor(self) -> NodeDescriptor {
        NodeDescriptor {
            id: self.node_id,
            name: self.node_name,
            host: self.host,
            control_port: self.control_port,
            roles: self.roles,
            tags: self.tags,
            status: NodeStatus::Online,
            last_seen_ms: self.timestamp_ms,
        }
    }
}

/// Encode a frame of the given kind.
///
/// # Errors
///
/// Returns an error if the payload fails to serialize.
pub fn encode_frame<T: Serialize>(kind: FrameKind, payload: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(payload)?;
    let len = u32::try_from(body.len())
        .map_err(|_| Error::Discovery("payload too large".to_string()))?;

    let mut frame = Vec::with_capacity(8 + body.len());
    frame.extend_from_slice(&MAGIC);
    frame.push(WIRE_VERSION);
    frame.push(kind.as_byte());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame, returning its kind and raw JSON body.
///
/// # Errors
///
/// Returns a discovery error for bad magic, unknown version or kind, or a
/// truncated payload. Callers count these and drop the datagram.
pub fn decode_frame(buf: &[u8]) -> Result<(FrameKind, &[u8])> {
    if buf.len() < 8 {
        return Err(Error::Discovery("frame too short".to_string()));
    }
    if buf[0..2] != MAGIC {
        return Err(Error::Discovery("bad magic".to_string()));
    }
    if buf[2] != WIRE_VERSION {
        return Err(Error::Discovery(format!("unsupported wire version {}", buf[2])));
    }
    let kind = FrameKind::from_byte(buf[3])
        .ok_or_else(|| Error::Discovery(format!("unknown frame kind {}", buf[3])))?;

    let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(Error::Discovery(format!("payload length {len} exceeds cap")));
    }
    let body = buf
        .get(8..8 + len)
        .ok_or_else(|| Error::Discovery("truncated payload".to_string()))?;
    Ok((kind, body))
}

/// Decode a beacon frame end to end.
///
/// # Errors
///
/// Returns a discovery error for framing or JSON problems, or if the frame
/// is not a beacon.
pub fn decode_beacon(buf: &[u8]) -> Result<Beacon> {
    let (kind, body) = decode_frame(buf)?;
    if kind != FrameKind::Beacon {
        return Err(Error::Discovery("expected beacon frame".to_string()));
    }
    Ok(serde_json::from_slice(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> NodeDescriptor {
        NodeDescriptor {
            id: "indigo".to_string(),
            name: "Indigo".to_string(),
            host: "192.168.32.7".to_string(),
            control_port: 8070,
            roles: [NodeRole::AudioHub, NodeRole::TransportAgent].into(),
            tags: BTreeMap::from([("room".to_string(), "studio-a".to_string())]),
            status: NodeStatus::Online,
            last_seen_ms: 0,
        }
    }

    #[test]
    fn beacon_round_trips() {
        let beacon = Beacon::announce(&node(), 1_722_000_000_123);
        let frame = encode_frame(FrameKind::Beacon, &beacon).unwrap();
        let decoded = decode_beacon(&frame).unwrap();

        assert_eq!(decoded.node_id, "indigo");
        assert_eq!(decoded.host, "192.168.32.7");
        assert_eq!(decoded.control_port, 8070);
        assert_eq!(decoded.timestamp_ms, 1_722_000_000_123);
        assert!(decoded.roles.contains(&NodeRole::AudioHub));
        assert_eq!(decoded.tags.get("room").unwrap(), "studio-a");

        let descriptor = decoded.into_descriptor();
        assert_eq!(descriptor.status, NodeStatus::Online);
        assert_eq!(descriptor.last_seen_ms, 1_722_000_000_123);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let beacon = Beacon::announce(&node(), 1);
        let mut frame = encode_frame(FrameKind::Beacon, &beacon).unwrap();
        frame[0] = b'X';
        assert!(decode_frame(&frame).is_err());
    }

    #[test]
    fn future_version_is_rejected() {
        let beacon = Beacon::announce(&node(), 1);
        let mut frame = encode_frame(FrameKind::Beacon, &beacon).unwrap();
        frame[2] = WIRE_VERSION + 1;
        assert!(decode_frame(&frame).is_err());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let beacon = Beacon::announce(&node(), 1);
        let frame = encode_frame(FrameKind::Beacon, &beacon).unwrap();
        assert!(decode_frame(&frame[..frame.len() - 3]).is_err());
    }

    #[test]
    fn wrong_kind_is_rejected_by_decode_beacon() {
        let frame = encode_frame(FrameKind::Service, &serde_json::json!({})).unwrap();
        assert!(decode_beacon(&frame).is_err());
    }
}
