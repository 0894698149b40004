//! In-process radio stand-in.
//!
//! Records every frame handed to it and answers with acknowledgments, probe
//! replies and link events according to a configurable policy. Used by the
//! integration tests and by `meshagent simulate`.

use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::mpsc;

use super::{
    Destination, InboundPacket, LinkEvent, NodeId, PacketId, Payload, Transport, TransportEvent,
};
use crate::errors::TransportError;
use crate::logutil::preview;

/// A frame that went out over the loopback radio.
#[derive(Debug, Clone, PartialEq)]
pub struct SentFrame {
    pub packet_id: PacketId,
    pub destination: Destination,
    pub text: String,
    pub want_ack: bool,
}

type AckFn = dyn Fn(&SentFrame) -> bool + Send + Sync;

/// Which reliable frames the simulated remote side acknowledges.
#[derive(Clone)]
pub enum AckPolicy {
    All,
    Never,
    When(Arc<AckFn>),
}

impl AckPolicy {
    pub fn when<F>(f: F) -> Self
    where
        F: Fn(&SentFrame) -> bool + Send + Sync + 'static,
    {
        AckPolicy::When(Arc::new(f))
    }

    fn acks(&self, frame: &SentFrame) -> bool {
        match self {
            AckPolicy::All => true,
            AckPolicy::Never => false,
            AckPolicy::When(f) => f(frame),
        }
    }
}

struct RadioState {
    connected: bool,
    next_id: PacketId,
    sent: Vec<SentFrame>,
    probes: Vec<PacketId>,
    reconnects: u32,
    telemetry_requests: Vec<NodeId>,
    ack_policy: AckPolicy,
    self_echo: bool,
    answer_probes: bool,
    reconnect_succeeds: bool,
}

/// Loopback implementation of [`Transport`].
#[derive(Clone)]
pub struct LoopbackRadio {
    local: NodeId,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Arc<Mutex<RadioState>>,
}

impl LoopbackRadio {
    /// Create a radio for `local` and the receiving end of its event stream.
    /// The link starts detached; call [`LoopbackRadio::attach`].
    pub fn new(local: NodeId) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut first_id: PacketId = rand::random();
        if first_id == 0 {
            first_id = 1;
        }
        let radio = LoopbackRadio {
            local,
            events: tx,
            state: Arc::new(Mutex::new(RadioState {
                connected: false,
                next_id: first_id,
                sent: Vec::new(),
                probes: Vec::new(),
                reconnects: 0,
                telemetry_requests: Vec::new(),
                ack_policy: AckPolicy::All,
                self_echo: false,
                answer_probes: true,
                reconnect_succeeds: true,
            })),
        };
        (radio, rx)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RadioState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn next_id(state: &mut RadioState) -> PacketId {
        let id = state.next_id;
        state.next_id = state.next_id.wrapping_add(1).max(1);
        id
    }

    pub fn local(&self) -> NodeId {
        self.local
    }

    /// Mark the link up and report it.
    pub fn attach(&self) {
        self.lock().connected = true;
        self.emit(TransportEvent::Link(LinkEvent::Connected));
    }

    /// Mark the link down and report it.
    pub fn detach(&self) {
        self.lock().connected = false;
        self.emit(TransportEvent::Link(LinkEvent::Disconnected));
    }

    /// Push an arbitrary inbound packet.
    pub fn inject(&self, packet: InboundPacket) {
        self.emit(TransportEvent::Packet(packet));
    }

    /// Push a telemetry report from `node`.
    pub fn inject_telemetry(&self, node: NodeId, metric: &str, value: f64) {
        self.inject(InboundPacket {
            from: node,
            to: self.local,
            channel: 0,
            payload: Payload::Telemetry(vec![(metric.to_string(), value)]),
        });
    }

    /// Push an acknowledgment for `request_id` as reported by `origin`.
    pub fn inject_ack(&self, origin: NodeId, request_id: PacketId, destination: Destination) {
        self.inject(InboundPacket {
            from: origin,
            to: self.local,
            channel: 0,
            payload: Payload::Ack {
                request_id,
                destination,
            },
        });
    }

    pub fn set_ack_policy(&self, policy: AckPolicy) {
        self.lock().ack_policy = policy;
    }

    /// Echo a local implicit ack for every reliable send, before any remote ack.
    pub fn set_self_echo(&self, on: bool) {
        self.lock().self_echo = on;
    }

    pub fn set_answer_probes(&self, on: bool) {
        self.lock().answer_probes = on;
    }

    pub fn set_reconnect_succeeds(&self, on: bool) {
        self.lock().reconnect_succeeds = on;
    }

    pub fn sent(&self) -> Vec<SentFrame> {
        self.lock().sent.clone()
    }

    pub fn sent_to(&self, destination: Destination) -> Vec<SentFrame> {
        self.lock()
            .sent
            .iter()
            .filter(|f| f.destination == destination)
            .cloned()
            .collect()
    }

    pub fn probes_sent(&self) -> usize {
        self.lock().probes.len()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().reconnects
    }

    pub fn telemetry_requests(&self) -> Vec<NodeId> {
        self.lock().telemetry_requests.clone()
    }
}

impl Transport for LoopbackRadio {
    fn send(
        &self,
        destination: &Destination,
        payload: &[u8],
        want_ack: bool,
    ) -> Result<PacketId, TransportError> {
        let mut replies = Vec::new();
        let frame = {
            let mut st = self.lock();
            if !st.connected {
                return Err(TransportError::NotConnected);
            }
            let text = String::from_utf8(payload.to_vec())
                .map_err(|e| TransportError::Rejected(e.to_string()))?;
            let frame = SentFrame {
                packet_id: Self::next_id(&mut st),
                destination: *destination,
                text,
                want_ack,
            };
            st.sent.push(frame.clone());
            if want_ack {
                if st.self_echo {
                    replies.push((self.local, frame.packet_id));
                }
                if let Destination::Node(node) = destination {
                    if st.ack_policy.acks(&frame) {
                        replies.push((*node, frame.packet_id));
                    }
                }
            }
            frame
        };
        debug!(
            "loopback: sent id={} to={} ack={} '{}'",
            frame.packet_id,
            frame.destination,
            want_ack,
            preview(&frame.text, 60)
        );
        for (origin, id) in replies {
            self.inject_ack(origin, id, *destination);
        }
        Ok(frame.packet_id)
    }

    fn probe(&self) -> Result<PacketId, TransportError> {
        let (id, answer) = {
            let mut st = self.lock();
            if !st.connected {
                return Err(TransportError::NotConnected);
            }
            let id = Self::next_id(&mut st);
            st.probes.push(id);
            (id, st.answer_probes)
        };
        if answer {
            self.inject_ack(self.local, id, Destination::Node(self.local));
        }
        Ok(id)
    }

    fn reconnect(&self) -> Result<(), TransportError> {
        let ok = {
            let mut st = self.lock();
            st.reconnects += 1;
            st.reconnect_succeeds
        };
        if ok {
            self.attach();
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn request_telemetry(&self, node: NodeId) -> Result<(), TransportError> {
        let mut st = self.lock();
        if !st.connected {
            return Err(TransportError::NotConnected);
        }
        st.telemetry_requests.push(node);
        Ok(())
    }
}
