//! Service channel: topic-filtered pub/sub over UDP broadcast
//!
//! Service lifecycle messages ride the same frame envelope as beacons but
//! on their own port. The topic is the service type string; subscribers
//! either follow specific topics or take the wildcard and see everything.
//! Publishing is retried with bounded exponential backoff since a single
//! lost datagram would otherwise delay convergence until the next
//! re-announcement.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;

use crate::{Error, Result};

use super::beacon::{decode_frame, encode_frame, FrameKind};
use super::types::ServiceDescriptor;

/// Publish retry attempts
const PUBLISH_ATTEMPTS: u32 = 3;

/// Base backoff between publish retries
const PUBLISH_BACKOFF: Duration = Duration::from_millis(100);

/// Service lifecycle actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceAction {
    Registered,
    Updated,
    Unregistered,
}

/// A message on the service channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMessage {
    pub action: ServiceAction,
    pub service: ServiceDescriptor,
}

impl ServiceMessage {
    /// Topic this message is published under
    #[must_use]
    pub const fn topic(&self) -> &'static str {
        self.service.service_type.topic()
    }
}

/// Encode a service message into a channel frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_service_message(message: &ServiceMessage) -> Result<Vec<u8>> {
    encode_frame(FrameKind::Service, message)
}

/// Decode a channel frame into a service message.
///
/// # Errors
///
/// Returns a discovery error for framing problems or a non-service frame.
pub fn decode_service_message(buf: &[u8]) -> Result<ServiceMessage> {
    let (kind, body) = decode_frame(buf)?;
    if kind != FrameKind::Service {
        return Err(Error::Discovery("expected service frame".to_string()));
    }
    Ok(serde_json::from_slice(body)?)
}

/// Topic subscription filter
#[derive(Debug, Clone)]
pub enum TopicFilter {
    /// Receive every topic
    Wildcard,
    /// Receive only the listed topics
    Topics(HashSet<String>),
}

impl TopicFilter {
    /// Whether a message on `topic` passes the filter
    #[must_use]
    pub fn accepts(&self, topic: &str) -> bool {
        match self {
            Self::Wildcard => true,
            Self::Topics(topics) => topics.contains(topic),
        }
    }
}

/// Publisher half of the service channel
#[derive(Clone)]
pub struct ChannelPublisher {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
}

impl ChannelPublisher {
    /// Create a publisher sending to the broadcast `target`
    #[must_use]
    pub fn new(socket: Arc<UdpSocket>, target: SocketAddr) -> Self {
        Self { socket, target }
    }

    /// Publish a message, retrying with exponential backoff on send
    /// failure.
    ///
    /// # Errors
    ///
    /// Returns the last send error once the attempts are exhausted.
    pub async fn publish(&self, message: &ServiceMessage) -> Result<()> {
        let frame = encode_service_message(message)?;
        let mut backoff = PUBLISH_BACKOFF;
        let mut last_err = None;

        for attempt in 0..PUBLISH_ATTEMPTS {
            match self.socket.send_to(&frame, self.target).await {
                Ok(_) => {
                    tracing::debug!(
                        topic = message.topic(),
                        action = ?message.action,
                        service = %message.service.service_name,
                        "published service message"
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        error = %e,
                        topic = message.topic(),
                        "service channel send failed"
                    );
                    last_err = Some(e);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }

        Err(Error::Discovery(format!(
            "service publish failed after {PUBLISH_ATTEMPTS} attempts: {}",
            last_err.map_or_else(|| "unknown".to_string(), |e| e.to_string())
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::types::ServiceType;

    fn message(action: ServiceAction) -> ServiceMessage {
        ServiceMessage {
            action,
            service: ServiceDescriptor::new(
                "indigo",
                ServiceType::VoiceCommand,
                "voice",
                "192.168.32.7:8070",
            ),
        }
    }

    #[test]
    fn service_message_round_trips() {
        let msg = message(ServiceAction::Registered);
        let frame = encode_service_message(&msg).unwrap();
        let decoded = decode_service_message(&frame).unwrap();
        assert_eq!(decoded.action, ServiceAction::Registered);
        assert_eq!(decoded.service, msg.service);
    }

    #[test]
    fn action_uses_wire_strings() {
        let json = serde_json::to_value(message(ServiceAction::Unregistered)).unwrap();
        assert_eq!(json["action"], "unregistered");
    }

    #[test]
    fn topic_filter_wildcard_and_explicit() {
        assert!(TopicFilter::Wildcard.accepts("stt_engine"));

        let filter = TopicFilter::Topics(
            ["voice_command".to_string(), "jack_client".to_string()]
                .into_iter()
                .collect(),
        );
        assert!(filter.accepts("voice_command"));
        assert!(!filter.accepts("tts_engine"));
    }

    #[tokio::test]
    async fn publisher_delivers_over_loopback() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();
        let sender = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let publisher = ChannelPublisher::new(sender, target);
        publisher.publish(&message(ServiceAction::Updated)).await.unwrap();

        let mut buf = vec![0u8; 2048];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        let decoded = decode_service_message(&buf[..n]).unwrap();
        assert_eq!(decoded.action, ServiceAction::Updated);
    }
}
