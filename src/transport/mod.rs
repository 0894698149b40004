//! # Transport Adapter Interface
//!
//! The radio link itself (serial/TCP attachment, protobuf framing, packet
//! decoding) lives outside this crate. This module defines the seam the rest of
//! the agent talks to:
//!
//! - [`Transport`] - outbound primitives (send, probe, reconnect, telemetry request)
//! - [`TransportEvent`] - inbound packets and link events, delivered over an
//!   unbounded mpsc channel by whatever task owns the radio
//! - [`NodeId`] / [`Destination`] - addressing, in Meshtastic `!xxxxxxxx` notation
//!
//! A [`loopback::LoopbackRadio`] implementation is provided for tests and the
//! `simulate` command.
//!
//! ```rust
//! use meshagent::transport::{Destination, NodeId};
//!
//! let node: NodeId = "!a1b2c3d4".parse().unwrap();
//! assert_eq!(node.to_string(), "!a1b2c3d4");
//! assert!(Destination::Node(node).is_direct());
//! assert!(!Destination::Channel(0).is_direct());
//! ```

pub mod loopback;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::TransportError;

/// Radio-assigned packet identifier, used to correlate acknowledgments.
pub type PacketId = u32;

/// Mesh node number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(pub u32);

impl NodeId {
    /// Sender reported as 0 by the radio when it could not attribute a packet.
    pub const UNKNOWN: NodeId = NodeId(0);

    pub fn is_unknown(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{:08x}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = String;

    /// Accepts `!hex`, `0xhex` and plain decimal.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = if let Some(hex) = s.strip_prefix('!') {
            u32::from_str_radix(hex, 16).ok()
        } else if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u32::from_str_radix(hex, 16).ok()
        } else {
            s.parse::<u32>().ok()
        };
        parsed
            .map(NodeId)
            .ok_or_else(|| format!("invalid node id '{}'", s))
    }
}

impl TryFrom<String> for NodeId {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<NodeId> for String {
    fn from(n: NodeId) -> Self {
        n.to_string()
    }
}

/// Where an outbound message is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Destination {
    /// A single node (direct message).
    Node(NodeId),
    /// Everyone listening on a channel index (broadcast).
    Channel(u32),
}

impl Destination {
    pub fn is_direct(&self) -> bool {
        matches!(self, Destination::Node(_))
    }

    pub fn node(&self) -> Option<NodeId> {
        match self {
            Destination::Node(n) => Some(*n),
            Destination::Channel(_) => None,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Node(n) => write!(f, "{}", n),
            Destination::Channel(c) => write!(f, "ch{}", c),
        }
    }
}

/// Decoded payload of an inbound packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Plain text for the command collaborator.
    Text(String),
    /// Transport-level acknowledgment of a packet we sent. `destination` is the
    /// destination the radio reports for the acknowledged packet.
    Ack {
        request_id: PacketId,
        destination: Destination,
    },
    /// Telemetry report: metric name to numeric value.
    Telemetry(Vec<(String, f64)>),
    /// Anything else (position, node info, routing noise).
    Other,
}

/// A packet as surfaced by the transport adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundPacket {
    pub from: NodeId,
    pub to: NodeId,
    pub channel: u32,
    pub payload: Payload,
}

/// Raw connection events from the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
}

/// Everything the adapter pushes to the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Packet(InboundPacket),
    Link(LinkEvent),
}

/// Outbound half of the transport adapter.
///
/// Calls are synchronous hand-offs to the radio; results (acks, link changes)
/// come back asynchronously as [`TransportEvent`]s.
pub trait Transport: Send + Sync {
    /// Queue `payload` for transmission. `want_ack` requests a transport-level
    /// acknowledgment correlated by the returned packet id.
    fn send(
        &self,
        destination: &Destination,
        payload: &[u8],
        want_ack: bool,
    ) -> Result<PacketId, TransportError>;

    /// Send an active liveness probe through the radio attachment.
    fn probe(&self) -> Result<PacketId, TransportError>;

    /// Begin re-attaching the radio. Success is reported later as
    /// [`LinkEvent::Connected`].
    fn reconnect(&self) -> Result<(), TransportError>;

    /// Ask a node to report fresh telemetry.
    fn request_telemetry(&self, node: NodeId) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_node_id_notations() {
        assert_eq!("!0000002a".parse::<NodeId>().unwrap(), NodeId(42));
        assert_eq!("0x2A".parse::<NodeId>().unwrap(), NodeId(42));
        assert_eq!("42".parse::<NodeId>().unwrap(), NodeId(42));
        assert!("!zz".parse::<NodeId>().is_err());
        assert!("".parse::<NodeId>().is_err());
    }

    #[test]
    fn node_id_serializes_as_bang_hex() {
        let json = serde_json::to_string(&NodeId(0xdeadbeef)).unwrap();
        assert_eq!(json, "\"!deadbeef\"");
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, NodeId(0xdeadbeef));
    }

    #[test]
    fn destination_display() {
        assert_eq!(Destination::Node(NodeId(1)).to_string(), "!00000001");
        assert_eq!(Destination::Channel(2).to_string(), "ch2");
        assert_eq!(Destination::Channel(2).node(), None);
    }
}
