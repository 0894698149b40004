//! Agent context: owns the health monitor, delivery pipeline and scheduler,
//! routes transport events between them and runs their background loops.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshagent::agent::MeshAgent;
//! use meshagent::config::Config;
//! use meshagent::health::ProcessExit;
//! use meshagent::transport::loopback::LoopbackRadio;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = Config::default();
//! let (radio, events) = LoopbackRadio::new(config.local_node()?);
//! let agent = MeshAgent::new(config, Arc::new(radio.clone()), Arc::new(ProcessExit::default()))?;
//! let mut handle = agent.start(events);
//! radio.attach();
//! while let Some(msg) = handle.next_inbound().await {
//!     println!("{} says {}", msg.from, msg.text);
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::delivery::DeliveryPipeline;
use crate::errors::{TaskError, WorkerError};
use crate::health::{HealthHandle, LivenessFile, Terminator};
use crate::logutil::preview;
use crate::scheduler::{Clock, SystemClock, TaskId, TaskScheduler, TaskTrigger, TelemetryObservation};
use crate::transport::{Destination, InboundPacket, NodeId, Payload, Transport, TransportEvent};
use crate::workers::{ResponseJob, WorkerPool};

/// Template for deferred telemetry callbacks.
pub const DEFERRED_TELEMETRY_TEMPLATE: &str = "Telemetry from {node}: {metric} = {value}";

/// Text addressed to the agent, forwarded to the command collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundText {
    pub from: NodeId,
    pub to: NodeId,
    pub channel: u32,
    pub text: String,
}

/// Answer to a synchronous telemetry request.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryReply {
    Received(TelemetryObservation),
    /// No reading in time; the requester will be notified by this task.
    Deferred(TaskId),
}

pub struct MeshAgent {
    config: Config,
    local: NodeId,
    transport: Arc<dyn Transport>,
    terminator: Arc<dyn Terminator>,
    health: HealthHandle,
    pipeline: DeliveryPipeline,
    scheduler: Arc<TaskScheduler>,
    shutdown: watch::Sender<bool>,
}

impl MeshAgent {
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        terminator: Arc<dyn Terminator>,
    ) -> Result<Arc<Self>> {
        Self::with_clock(config, transport, terminator, Arc::new(SystemClock))
    }

    /// Same as [`MeshAgent::new`] with an explicit scheduler clock.
    pub fn with_clock(
        config: Config,
        transport: Arc<dyn Transport>,
        terminator: Arc<dyn Terminator>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let local = config.local_node()?;
        let health = HealthHandle::new(config.health_tuning());
        let pipeline = DeliveryPipeline::new(
            local,
            config.delivery_tuning(),
            transport.clone(),
            health.subscribe(),
        );
        let scheduler = Arc::new(TaskScheduler::new(
            config.scheduler_tuning(),
            Arc::new(pipeline.clone()),
            clock,
        ));
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            local,
            transport,
            terminator,
            health,
            pipeline,
            scheduler,
            shutdown,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn local(&self) -> NodeId {
        self.local
    }

    pub fn health(&self) -> &HealthHandle {
        &self.health
    }

    pub fn pipeline(&self) -> &DeliveryPipeline {
        &self.pipeline
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Spawn the sweeper, watchdog, scheduler, worker pool and event router.
    pub fn start(self: &Arc<Self>, events: mpsc::UnboundedReceiver<TransportEvent>) -> AgentHandle {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let liveness = self.config.health.liveness_file.as_ref().map(LivenessFile::new);

        let tasks = vec![
            tokio::spawn(self.pipeline.clone().run_sweeper()),
            tokio::spawn(self.health.clone().run(
                self.transport.clone(),
                liveness,
                self.terminator.clone(),
                self.shutdown.subscribe(),
            )),
            tokio::spawn(self.scheduler.clone().run(self.shutdown.subscribe())),
            tokio::spawn(self.clone().route_events(events, inbound_tx)),
        ];
        let workers = WorkerPool::start(
            self.config.workers.pool_size,
            self.config.workers.queue_capacity,
            Arc::new(self.pipeline.clone()),
            self.shutdown.subscribe(),
        );
        info!(
            "{} started as {} ({} workers)",
            self.config.agent.name,
            self.local,
            workers.size()
        );

        AgentHandle {
            agent: self.clone(),
            inbound: inbound_rx,
            workers,
            tasks,
        }
    }

    async fn route_events(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        inbound: mpsc::UnboundedSender<InboundText>,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                ev = events.recv() => match ev {
                    Some(ev) => self.handle_event(ev, &inbound),
                    None => break,
                },
                _ = shutdown.wait_for(|s| *s) => break,
            }
        }
        debug!("Event router stopped");
    }

    /// Route one transport event. Every packet counts as link activity, even
    /// ones the delivery pipeline later ignores.
    pub fn handle_event(&self, event: TransportEvent, inbound: &mpsc::UnboundedSender<InboundText>) {
        let packet = match event {
            TransportEvent::Link(ev) => {
                self.health.on_link_event(ev);
                return;
            }
            TransportEvent::Packet(p) => p,
        };
        self.health.record_activity();

        let InboundPacket {
            from,
            to,
            channel,
            payload,
        } = packet;
        match payload {
            Payload::Ack {
                request_id,
                destination,
            } => {
                if !self.health.on_ack(request_id) {
                    self.pipeline.handle_ack(from, request_id, destination);
                }
            }
            Payload::Telemetry(readings) => {
                let now = self.scheduler.now();
                for (metric, value) in readings {
                    self.scheduler
                        .observe(TelemetryObservation::new(from, metric, value, now));
                }
            }
            Payload::Text(text) => {
                debug!("Text from {} on ch{}: '{}'", from, channel, preview(&text, 60));
                let _ = inbound.send(InboundText {
                    from,
                    to,
                    channel,
                    text,
                });
            }
            Payload::Other => {}
        }
    }

    /// Ask `node` for `metric` and wait up to the configured timeout. On
    /// timeout a deferred-telemetry task is registered that notifies
    /// `requester` when the reading arrives.
    pub async fn request_telemetry(
        &self,
        node: NodeId,
        metric: &str,
        requester: NodeId,
    ) -> Result<TelemetryReply, TaskError> {
        let started = self.scheduler.now();
        let mut updates = self.scheduler.telemetry().subscribe();
        if let Err(e) = self.transport.request_telemetry(node) {
            warn!("Telemetry request to {} failed: {}", node, e);
        }

        let wait = async {
            loop {
                match updates.recv().await {
                    Ok(obs) if obs.matches(node, metric) => return Some(obs),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };
        let timeout = self.scheduler.tuning().telemetry_request_timeout;
        if let Ok(Some(obs)) = tokio::time::timeout(timeout, wait).await {
            return Ok(TelemetryReply::Received(obs));
        }

        let id = self.defer_telemetry(node, metric, requester, started)?;
        info!(
            "No {} from {} within {}s; deferred as {}",
            metric,
            node,
            timeout.as_secs(),
            id
        );
        Ok(TelemetryReply::Deferred(id))
    }

    /// Register the deferred callback, then settle it at once if a reading
    /// newer than `since` was recorded before the task existed.
    fn defer_telemetry(
        &self,
        node: NodeId,
        metric: &str,
        requester: NodeId,
        since: DateTime<Utc>,
    ) -> Result<TaskId, TaskError> {
        let id = self.scheduler.register_task(
            TaskTrigger::AwaitTelemetry {
                node,
                metric: metric.to_string(),
            },
            vec![Destination::Node(requester)],
            DEFERRED_TELEMETRY_TEMPLATE,
            requester,
        )?;
        if let Some(obs) = self
            .scheduler
            .telemetry()
            .latest(node, metric)
            .filter(|o| o.at >= since)
        {
            if self.scheduler.resolve_deferred(&id, &obs) {
                debug!("{} settled by a reading that raced the timeout", id);
            }
        }
        Ok(id)
    }

    /// Signal every background loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.pipeline.shutdown();
    }
}

/// Running agent: inbound text stream, worker pool and background tasks.
pub struct AgentHandle {
    agent: Arc<MeshAgent>,
    inbound: mpsc::UnboundedReceiver<InboundText>,
    workers: WorkerPool,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentHandle {
    pub fn agent(&self) -> &Arc<MeshAgent> {
        &self.agent
    }

    pub async fn next_inbound(&mut self) -> Option<InboundText> {
        self.inbound.recv().await
    }

    /// Queue an AI-response job; fails fast when the pool is saturated.
    pub fn submit_response(&self, job: ResponseJob) -> Result<(), WorkerError> {
        self.workers.try_submit(job)
    }

    /// Stop everything and wait for the background tasks to exit.
    pub async fn shutdown(self) {
        self.agent.shutdown();
        for task in self.tasks {
            let _ = task.await;
        }
        self.workers.join().await;
        info!("Agent stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::RecordingTerminator;
    use crate::scheduler::TaskStatus;
    use crate::transport::loopback::LoopbackRadio;

    const LOCAL: NodeId = NodeId(0x0a0a_0a0a);
    const PEER: NodeId = NodeId(0x0b0b_0b0b);
    const SENSOR: NodeId = NodeId(0x5e50_0001);

    fn agent() -> (Arc<MeshAgent>, LoopbackRadio, mpsc::UnboundedReceiver<TransportEvent>) {
        let mut config = Config::default();
        config.agent.node_id = LOCAL.to_string();
        config.health.liveness_file = None;
        config.logging.file = None;
        let (radio, events) = LoopbackRadio::new(LOCAL);
        let agent = MeshAgent::new(
            config,
            Arc::new(radio.clone()),
            Arc::new(RecordingTerminator::default()),
        )
        .unwrap();
        (agent, radio, events)
    }

    #[test]
    fn unattributed_local_node_is_refused() {
        let mut config = Config::default();
        config.agent.node_id = "0".into();
        let (radio, _events) = LoopbackRadio::new(NodeId::UNKNOWN);
        let result = MeshAgent::new(
            config,
            Arc::new(radio),
            Arc::new(RecordingTerminator::default()),
        );
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reading_recorded_before_deferral_settles_it() {
        let (agent, radio, events) = agent();
        let handle = agent.start(events);
        radio.attach();
        let scheduler = agent.scheduler();
        let since = scheduler.now();
        // lands in the table between the timeout and the registration
        scheduler
            .telemetry()
            .record(TelemetryObservation::new(SENSOR, "battery", 64.0, scheduler.now()));

        let id = agent.defer_telemetry(SENSOR, "battery", PEER, since).unwrap();
        assert_eq!(scheduler.task_status(&id), Some(TaskStatus::Completed));

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        let sent = radio.sent_to(Destination::Node(PEER));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, format!("Telemetry from {}: battery = 64", SENSOR));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stale_reading_does_not_settle_deferral() {
        let (agent, _radio, _events) = agent();
        let scheduler = agent.scheduler();
        scheduler
            .telemetry()
            .record(TelemetryObservation::new(SENSOR, "battery", 64.0, scheduler.now()));
        let since = scheduler.now() + chrono::Duration::seconds(1);

        let id = agent.defer_telemetry(SENSOR, "battery", PEER, since).unwrap();
        assert_eq!(scheduler.task_status(&id), Some(TaskStatus::Active));
    }
}
