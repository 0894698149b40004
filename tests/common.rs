//! Shared fixtures for the integration tests.
#![allow(dead_code)] // not every test binary uses every helper

use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use meshagent::config::Config;
use meshagent::delivery::{DeliveryPipeline, DeliveryTuning};
use meshagent::errors::DeliveryError;
use meshagent::health::ConnectionState;
use meshagent::scheduler::Notifier;
use meshagent::transport::loopback::LoopbackRadio;
use meshagent::transport::{Destination, NodeId, Payload, TransportEvent};

pub const LOCAL: NodeId = NodeId(0x0a0a_0a0a);
pub const PEER: NodeId = NodeId(0x0b0b_0b0b);
pub const OTHER: NodeId = NodeId(0x0c0c_0c0c);

/// Pipeline over an attached loopback radio, with a task forwarding acks the
/// way the agent router does. The returned sender drives the link gate.
pub fn pipeline_with_router(
    tuning: DeliveryTuning,
) -> (DeliveryPipeline, LoopbackRadio, watch::Sender<ConnectionState>) {
    let (radio, mut events) = LoopbackRadio::new(LOCAL);
    radio.attach();
    let (link_tx, link_rx) = watch::channel(ConnectionState::Connected);
    let pipeline = DeliveryPipeline::new(LOCAL, tuning, Arc::new(radio.clone()), link_rx);
    tokio::spawn(pipeline.clone().run_sweeper());

    let router = pipeline.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let TransportEvent::Packet(packet) = event {
                if let Payload::Ack {
                    request_id,
                    destination,
                } = packet.payload
                {
                    router.handle_ack(packet.from, request_id, destination);
                }
            }
        }
    });
    (pipeline, radio, link_tx)
}

/// Agent config for the loopback radio at [`LOCAL`].
pub fn agent_config(liveness: Option<&Path>) -> Config {
    let mut config = Config::default();
    config.agent.node_id = LOCAL.to_string();
    config.health.liveness_file = liveness.map(|p| p.to_string_lossy().into_owned());
    config.logging.file = None;
    config
}

/// Notifier that records every hand-off.
#[derive(Default)]
pub struct Recorder {
    pub sent: Mutex<Vec<(Destination, String)>>,
}

impl Recorder {
    pub fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, t)| t.clone())
            .collect()
    }
}

impl Notifier for Recorder {
    fn notify(&self, target: Destination, text: &str) -> Result<(), DeliveryError> {
        self.sent.lock().unwrap().push((target, text.to_string()));
        Ok(())
    }
}
