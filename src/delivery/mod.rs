//! # Outbound Delivery Pipeline
//!
//! Turns `(destination, text)` into paced, acknowledgment-tracked chunk
//! transmissions over a half-duplex radio.
//!
//! ## Model
//!
//! - Every destination gets its own lane (a tokio task fed by an unbounded
//!   channel). Lanes send one chunk at a time, so per-destination ordering is
//!   preserved and at most one chunk per destination awaits an ack.
//! - Direct chunks wait for a transport ack (up to `ack_timeout`) before the
//!   next chunk goes out, and never sooner than the class pacing delay.
//!   Broadcast chunks are fire-and-forget but still paced.
//! - A chunk that times out (or fails at the transport) is resent up to
//!   `max_retries` times. When the budget is spent the message fails, the
//!   remaining chunks are dropped and a [`DeliveryReport`] is published.
//! - Across all lanes, transmissions are spaced by `min_send_gap` and held
//!   while the link health state forbids sending.
//! - A sweeper task turns expired ack deadlines into timeouts.
//!
//! Acks are filtered in [`DeliveryPipeline::handle_ack`]: the reported
//! destination must match the pending chunk and the ack must not originate at
//! the local node (the radio echoes an implicit ack for our own
//! transmissions).

pub mod chunker;
mod pending;

pub use chunker::{chunk_message, split_message, MARKER_RESERVE};
pub use pending::{AckOutcome, AckResolution};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};

use crate::errors::{DeliveryError, TransportError};
use crate::health::ConnectionState;
use crate::logutil::preview;
use crate::metrics;
use crate::scheduler::Notifier;
use crate::transport::{Destination, NodeId, PacketId, Transport};

use pending::{PendingAcks, PendingChunk};

/// Runtime knobs for the pipeline, usually built by
/// [`Config::delivery_tuning`](crate::config::Config::delivery_tuning).
#[derive(Debug, Clone)]
pub struct DeliveryTuning {
    pub max_chunk_bytes: usize,
    pub chunk_markers: bool,
    pub direct_pacing: Duration,
    pub broadcast_pacing: Duration,
    pub min_send_gap: Duration,
    pub ack_timeout: Duration,
    pub max_retries: u32,
    pub max_queue: usize,
    pub sweep_interval: Duration,
    /// A lane with nothing queued for this long exits and frees its slot.
    pub lane_idle: Duration,
}

impl Default for DeliveryTuning {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 200,
            chunk_markers: true,
            direct_pacing: Duration::from_secs(5),
            broadcast_pacing: Duration::from_secs(15),
            min_send_gap: Duration::from_secs(2),
            ack_timeout: Duration::from_secs(60),
            max_retries: 2,
            max_queue: 50,
            sweep_interval: Duration::from_millis(500),
            lane_idle: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeliveryClass {
    /// Acknowledged point-to-point delivery.
    Direct,
    /// Fire-and-forget channel broadcast.
    Broadcast,
}

impl DeliveryClass {
    pub fn for_destination(destination: &Destination) -> Self {
        if destination.is_direct() {
            DeliveryClass::Direct
        } else {
            DeliveryClass::Broadcast
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MessageState {
    Queued,
    Sending,
    AwaitingAck,
    Delivered,
    Failed,
}

impl MessageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageState::Delivered | MessageState::Failed)
    }
}

/// Observable progress of one outbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageStatus {
    pub state: MessageState,
    pub chunks_total: usize,
    /// Chunks acknowledged (direct) or handed to the radio (broadcast).
    pub chunks_sent: usize,
    pub retries: u32,
    pub error: Option<DeliveryError>,
}

/// Caller-side view of an enqueued message.
#[derive(Debug)]
pub struct MessageHandle {
    id: u64,
    destination: Destination,
    class: DeliveryClass,
    status: watch::Receiver<MessageStatus>,
}

impl MessageHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn destination(&self) -> Destination {
        self.destination
    }

    pub fn class(&self) -> DeliveryClass {
        self.class
    }

    pub fn status(&self) -> MessageStatus {
        self.status.borrow().clone()
    }

    /// Wait until the message is delivered or has failed.
    pub async fn wait(&mut self) -> Result<(), DeliveryError> {
        let status = self
            .status
            .wait_for(|s| s.state.is_terminal())
            .await
            .map_err(|_| DeliveryError::Shutdown)?
            .clone();
        match status.state {
            MessageState::Delivered => Ok(()),
            _ => Err(status.error.unwrap_or(DeliveryError::Shutdown)),
        }
    }
}

/// Published once per finished message.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub message_id: u64,
    pub destination: Destination,
    pub class: DeliveryClass,
    pub chunks_total: usize,
    pub chunks_sent: usize,
    pub retries: u32,
    pub outcome: Result<(), DeliveryError>,
}

struct QueuedMessage {
    id: u64,
    destination: Destination,
    class: DeliveryClass,
    chunks: Vec<String>,
    status: watch::Sender<MessageStatus>,
}

struct Inner {
    local: NodeId,
    tuning: DeliveryTuning,
    transport: Arc<dyn Transport>,
    link: watch::Receiver<ConnectionState>,
    pending: Mutex<PendingAcks>,
    lanes: Mutex<HashMap<Destination, mpsc::UnboundedSender<QueuedMessage>>>,
    queued: AtomicUsize,
    next_message_id: AtomicU64,
    last_tx: tokio::sync::Mutex<Option<Instant>>,
    reports: broadcast::Sender<DeliveryReport>,
    shutdown: watch::Sender<bool>,
}

/// Handle to the delivery pipeline. Cheap to clone.
#[derive(Clone)]
pub struct DeliveryPipeline {
    inner: Arc<Inner>,
}

impl DeliveryPipeline {
    /// `link` is the published connection state from the health monitor.
    pub fn new(
        local: NodeId,
        tuning: DeliveryTuning,
        transport: Arc<dyn Transport>,
        link: watch::Receiver<ConnectionState>,
    ) -> Self {
        let (reports, _) = broadcast::channel(64);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                local,
                tuning,
                transport,
                link,
                pending: Mutex::new(PendingAcks::new()),
                lanes: Mutex::new(HashMap::new()),
                queued: AtomicUsize::new(0),
                next_message_id: AtomicU64::new(0),
                last_tx: tokio::sync::Mutex::new(None),
                reports,
                shutdown,
            }),
        }
    }

    pub fn tuning(&self) -> &DeliveryTuning {
        &self.inner.tuning
    }

    /// Messages queued or in flight across every lane.
    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    /// Destinations with a running lane.
    pub fn active_lanes(&self) -> usize {
        self.inner.lock_lanes().len()
    }

    /// Chunks currently awaiting an ack.
    pub fn pending_acks(&self) -> usize {
        self.inner.lock_pending().len()
    }

    pub fn subscribe_reports(&self) -> broadcast::Receiver<DeliveryReport> {
        self.inner.reports.subscribe()
    }

    /// Chunk `text` and queue it on the lane for `destination`.
    pub fn enqueue(
        &self,
        destination: Destination,
        text: &str,
        class: DeliveryClass,
    ) -> Result<MessageHandle, DeliveryError> {
        let inner = &self.inner;
        if *inner.shutdown.borrow() {
            return Err(DeliveryError::Shutdown);
        }
        let chunks = chunk_message(
            text,
            inner.tuning.max_chunk_bytes,
            inner.tuning.chunk_markers,
        );
        if chunks.is_empty() {
            return Err(DeliveryError::EmptyMessage);
        }

        let capacity = inner.tuning.max_queue;
        let queued = inner
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |q| {
                (q < capacity).then_some(q + 1)
            })
            .map_err(|q| DeliveryError::QueueFull {
                queued: q,
                capacity,
            })?
            + 1;
        if queued * 5 >= capacity * 4 {
            warn!("Outbound queue at {}/{} messages", queued, capacity);
        }

        let id = inner.next_message_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (status_tx, status_rx) = watch::channel(MessageStatus {
            state: MessageState::Queued,
            chunks_total: chunks.len(),
            chunks_sent: 0,
            retries: 0,
            error: None,
        });
        debug!(
            "Queued msg={} to {} ({:?}, {} chunk(s)): '{}'",
            id,
            destination,
            class,
            chunks.len(),
            preview(text, 60)
        );

        let msg = QueuedMessage {
            id,
            destination,
            class,
            chunks,
            status: status_tx,
        };
        if !inner.hand_to_lane(destination, msg) {
            inner.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(DeliveryError::Shutdown);
        }

        Ok(MessageHandle {
            id,
            destination,
            class,
            status: status_rx,
        })
    }

    /// Enqueue `text` to every target; nodes get direct delivery, channels a
    /// broadcast. One result per target, in order.
    pub fn send_notification(
        &self,
        targets: &[Destination],
        text: &str,
    ) -> Vec<Result<MessageHandle, DeliveryError>> {
        targets
            .iter()
            .map(|t| self.enqueue(*t, text, DeliveryClass::for_destination(t)))
            .collect()
    }

    /// Feed an inbound transport ack to the pending buffer.
    pub fn handle_ack(
        &self,
        origin: NodeId,
        request_id: PacketId,
        destination: Destination,
    ) -> AckResolution {
        self.inner
            .lock_pending()
            .resolve_ack(origin, request_id, destination, self.inner.local)
    }

    /// Time out every chunk past its ack deadline. Returns how many expired.
    pub fn sweep_expired(&self) -> usize {
        let expired = self.inner.lock_pending().take_expired(Instant::now());
        for (destination, seq) in &expired {
            debug!("Ack deadline passed for chunk {} to {}", seq, destination);
        }
        expired.len()
    }

    /// Periodic sweep of expired ack deadlines; runs until shutdown.
    pub async fn run_sweeper(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut ticker = interval(self.inner.tuning.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_expired();
                }
                _ = shutdown.wait_for(|s| *s) => break,
            }
        }
        debug!("Pending-ack sweeper stopped");
    }

    /// Stop every lane and the sweeper. Unfinished messages fail with
    /// [`DeliveryError::Shutdown`] and outstanding acks are dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.lock_pending().clear();
    }
}

impl Notifier for DeliveryPipeline {
    fn notify(&self, target: Destination, text: &str) -> Result<(), DeliveryError> {
        self.enqueue(target, text, DeliveryClass::for_destination(&target))
            .map(|_| ())
    }
}

impl Inner {
    fn lock_pending(&self) -> MutexGuard<'_, PendingAcks> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_lanes(&self) -> MutexGuard<'_, HashMap<Destination, mpsc::UnboundedSender<QueuedMessage>>> {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `msg` on the lane serving `destination`, spawning the lane if
    /// needed. The send happens under the lanes lock, which is also what an
    /// idle lane takes before it retires.
    fn hand_to_lane(self: &Arc<Self>, destination: Destination, msg: QueuedMessage) -> bool {
        let mut lanes = self.lock_lanes();
        let msg = match lanes.get(&destination) {
            Some(tx) => match tx.send(msg) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(msg)) => msg,
            },
            None => msg,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = tx.send(msg).is_ok();
        tokio::spawn(run_lane(self.clone(), destination, rx));
        lanes.insert(destination, tx);
        queued
    }

    fn pacing(&self, class: DeliveryClass) -> Duration {
        match class {
            DeliveryClass::Direct => self.tuning.direct_pacing,
            DeliveryClass::Broadcast => self.tuning.broadcast_pacing,
        }
    }

    /// Hold until the link may carry traffic.
    async fn wait_for_link(
        &self,
        destination: Destination,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), DeliveryError> {
        let mut link = self.link.clone();
        let state = *link.borrow();
        if state.can_transmit() {
            return Ok(());
        }
        debug!("Lane {} holding: link is {:?}", destination, state);
        tokio::select! {
            r = link.wait_for(|s| s.can_transmit()) => r.map(|_| ()).map_err(|_| DeliveryError::Shutdown),
            _ = shutdown.wait_for(|s| *s) => Err(DeliveryError::Shutdown),
        }
    }

    /// Hand one chunk to the radio, respecting the global send gap. For direct
    /// chunks the pending entry is registered before the pending lock is
    /// released, so an ack can never race ahead of its registration.
    async fn transmit(
        &self,
        msg: &QueuedMessage,
        seq: usize,
        packet_ids: &mut Vec<PacketId>,
        responder: oneshot::Sender<AckOutcome>,
    ) -> Result<PacketId, TransportError> {
        let mut last = self.last_tx.lock().await;
        if let Some(prev) = *last {
            let ready = prev + self.tuning.min_send_gap;
            if Instant::now() < ready {
                debug!(
                    "Gating: waiting {}ms to respect minimum {}ms between sends",
                    (ready - Instant::now()).as_millis(),
                    self.tuning.min_send_gap.as_millis()
                );
                sleep_until(ready).await;
            }
        }

        let want_ack = msg.class == DeliveryClass::Direct;
        let chunk = &msg.chunks[seq];
        let result = {
            let mut pending = self.lock_pending();
            let result = self
                .transport
                .send(&msg.destination, chunk.as_bytes(), want_ack);
            if let (Ok(id), true) = (&result, want_ack) {
                packet_ids.push(*id);
                let now = Instant::now();
                let entry = PendingChunk::new(
                    msg.id,
                    packet_ids.clone(),
                    now,
                    now + self.tuning.ack_timeout,
                    responder,
                );
                if !pending.insert(msg.destination, seq, entry) {
                    error!(
                        "Chunk {} of msg={} to {} registered while another chunk awaits ack",
                        seq, msg.id, msg.destination
                    );
                }
            }
            result
        };
        *last = Some(Instant::now());

        if let Ok(id) = &result {
            metrics::inc_chunks_sent();
            if !want_ack {
                metrics::inc_broadcast_chunks();
            }
            debug!(
                "Sent msg={} chunk {}/{} to {} id={} attempt={} ({} bytes)",
                msg.id,
                seq + 1,
                msg.chunks.len(),
                msg.destination,
                id,
                packet_ids.len().max(1),
                chunk.len()
            );
        }
        result
    }

    async fn deliver(
        &self,
        msg: &QueuedMessage,
        next_allowed: &mut Option<Instant>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), DeliveryError> {
        let pacing = self.pacing(msg.class);
        let attempts_allowed = 1 + self.tuning.max_retries;

        for seq in 0..msg.chunks.len() {
            let mut packet_ids = Vec::new();
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                if let Some(at) = *next_allowed {
                    tokio::select! {
                        biased;
                        _ = shutdown.wait_for(|s| *s) => return Err(DeliveryError::Shutdown),
                        _ = sleep_until(at) => {}
                    }
                }
                self.wait_for_link(msg.destination, shutdown).await?;
                msg.status.send_modify(|s| s.state = MessageState::Sending);

                let (tx, rx) = oneshot::channel();
                let sent = self.transmit(msg, seq, &mut packet_ids, tx).await;
                *next_allowed = Some(Instant::now() + pacing);

                if let Err(e) = sent {
                    warn!(
                        "Send of msg={} chunk {} to {} failed (attempt {}/{}): {}",
                        msg.id,
                        seq + 1,
                        msg.destination,
                        attempt,
                        attempts_allowed,
                        e
                    );
                    if attempt >= attempts_allowed {
                        return Err(DeliveryError::Transport(e));
                    }
                    metrics::inc_chunk_retries();
                    msg.status.send_modify(|s| s.retries += 1);
                    continue;
                }

                if msg.class == DeliveryClass::Broadcast {
                    msg.status.send_modify(|s| s.chunks_sent += 1);
                    break;
                }

                msg.status
                    .send_modify(|s| s.state = MessageState::AwaitingAck);
                let outcome = tokio::select! {
                    biased;
                    _ = shutdown.wait_for(|s| *s) => return Err(DeliveryError::Shutdown),
                    r = rx => r.unwrap_or(AckOutcome::TimedOut),
                };
                match outcome {
                    AckOutcome::Delivered => {
                        msg.status.send_modify(|s| s.chunks_sent += 1);
                        break;
                    }
                    AckOutcome::TimedOut if attempt >= attempts_allowed => {
                        return Err(DeliveryError::AckTimeout {
                            destination: msg.destination,
                            seq,
                            attempts: attempt,
                        });
                    }
                    AckOutcome::TimedOut => {
                        info!(
                            "No ack for msg={} chunk {} to {}; retrying ({}/{})",
                            msg.id,
                            seq + 1,
                            msg.destination,
                            attempt,
                            self.tuning.max_retries
                        );
                        metrics::inc_chunk_retries();
                        msg.status.send_modify(|s| s.retries += 1);
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(&self, msg: QueuedMessage, outcome: Result<(), DeliveryError>) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
        msg.status.send_modify(|s| {
            s.state = if outcome.is_ok() {
                MessageState::Delivered
            } else {
                MessageState::Failed
            };
            s.error = outcome.clone().err();
        });
        let status = msg.status.borrow().clone();

        match &outcome {
            Ok(()) => {
                metrics::inc_messages_delivered();
                info!(
                    "Delivered msg={} to {} ({} chunk(s), {} retries)",
                    msg.id, msg.destination, status.chunks_total, status.retries
                );
            }
            Err(e) => {
                metrics::inc_messages_failed();
                warn!(
                    "Failed msg={} to {} after {}/{} chunk(s): {}",
                    msg.id, msg.destination, status.chunks_sent, status.chunks_total, e
                );
            }
        }

        let _ = self.reports.send(DeliveryReport {
            message_id: msg.id,
            destination: msg.destination,
            class: msg.class,
            chunks_total: status.chunks_total,
            chunks_sent: status.chunks_sent,
            retries: status.retries,
            outcome,
        });
    }
}

async fn run_lane(
    inner: Arc<Inner>,
    destination: Destination,
    mut rx: mpsc::UnboundedReceiver<QueuedMessage>,
) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut next_allowed: Option<Instant> = None;
    debug!("Lane {} started", destination);

    loop {
        let msg = tokio::select! {
            m = rx.recv() => match m {
                Some(m) => m,
                None => break,
            },
            _ = sleep(inner.tuning.lane_idle) => {
                let mut lanes = inner.lock_lanes();
                match rx.try_recv() {
                    Ok(m) => m,
                    Err(_) => {
                        lanes.remove(&destination);
                        debug!("Lane {} idle; retiring", destination);
                        break;
                    }
                }
            }
            _ = shutdown.wait_for(|s| *s) => break,
        };
        let outcome = inner.deliver(&msg, &mut next_allowed, &mut shutdown).await;
        inner.finish(msg, outcome);
    }

    rx.close();
    while let Ok(msg) = rx.try_recv() {
        inner.finish(msg, Err(DeliveryError::Shutdown));
    }
    debug!("Lane {} stopped", destination);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::{AckPolicy, LoopbackRadio};
    use crate::transport::{Payload, TransportEvent};

    const LOCAL: NodeId = NodeId(0x100);
    const PEER: NodeId = NodeId(0x200);

    fn fast_tuning() -> DeliveryTuning {
        DeliveryTuning {
            direct_pacing: Duration::from_secs(1),
            broadcast_pacing: Duration::from_secs(1),
            min_send_gap: Duration::from_millis(100),
            ack_timeout: Duration::from_secs(5),
            max_queue: 5,
            ..DeliveryTuning::default()
        }
    }

    fn setup(
        tuning: DeliveryTuning,
    ) -> (DeliveryPipeline, LoopbackRadio, watch::Sender<ConnectionState>) {
        let (radio, mut events) = LoopbackRadio::new(LOCAL);
        radio.attach();
        let (link_tx, link_rx) = watch::channel(ConnectionState::Connected);
        let pipeline = DeliveryPipeline::new(LOCAL, tuning, Arc::new(radio.clone()), link_rx);
        tokio::spawn(pipeline.clone().run_sweeper());
        let router = pipeline.clone();
        tokio::spawn(async move {
            while let Some(ev) = events.recv().await {
                if let TransportEvent::Packet(p) = ev {
                    if let Payload::Ack {
                        request_id,
                        destination,
                    } = p.payload
                    {
                        router.handle_ack(p.from, request_id, destination);
                    }
                }
            }
        });
        (pipeline, radio, link_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn empty_text_is_rejected() {
        let (pipeline, _radio, _link) = setup(fast_tuning());
        assert_eq!(
            pipeline
                .enqueue(Destination::Node(PEER), "  \n", DeliveryClass::Direct)
                .unwrap_err(),
            DeliveryError::EmptyMessage
        );
    }

    #[tokio::test(start_paused = true)]
    async fn direct_message_is_delivered_when_acked() {
        let (pipeline, radio, _link) = setup(fast_tuning());
        let mut handle = pipeline
            .enqueue(Destination::Node(PEER), "hello there", DeliveryClass::Direct)
            .unwrap();
        assert_eq!(handle.wait().await, Ok(()));
        assert_eq!(radio.sent_to(Destination::Node(PEER)).len(), 1);
        assert_eq!(handle.status().chunks_sent, 1);
        assert_eq!(pipeline.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn self_echo_alone_does_not_deliver() {
        let (pipeline, radio, _link) = setup(fast_tuning());
        radio.set_self_echo(true);
        radio.set_ack_policy(AckPolicy::Never);
        let mut handle = pipeline
            .enqueue(Destination::Node(PEER), "ping", DeliveryClass::Direct)
            .unwrap();
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, DeliveryError::AckTimeout { attempts: 3, .. }));
        assert_eq!(radio.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_bound_is_enforced() {
        let (pipeline, radio, link) = setup(fast_tuning());
        radio.set_ack_policy(AckPolicy::Never);
        link.send_replace(ConnectionState::Disconnected);
        for i in 0..5 {
            pipeline
                .enqueue(Destination::Node(NodeId(i + 1)), "x", DeliveryClass::Direct)
                .unwrap();
        }
        assert_eq!(
            pipeline
                .enqueue(Destination::Channel(0), "x", DeliveryClass::Broadcast)
                .unwrap_err(),
            DeliveryError::QueueFull {
                queued: 5,
                capacity: 5
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lane_holds_while_link_is_down() {
        let (pipeline, radio, link) = setup(fast_tuning());
        link.send_replace(ConnectionState::Disconnected);
        let mut handle = pipeline
            .enqueue(Destination::Channel(0), "net check", DeliveryClass::Broadcast)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(radio.sent().is_empty());

        link.send_replace(ConnectionState::Connected);
        assert_eq!(handle.wait().await, Ok(()));
        assert_eq!(radio.sent().len(), 1);
        assert!(!radio.sent()[0].want_ack);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_lane_retires_and_respawns() {
        let tuning = DeliveryTuning {
            lane_idle: Duration::from_secs(60),
            ..fast_tuning()
        };
        let (pipeline, radio, _link) = setup(tuning);
        let dest = Destination::Node(PEER);
        let mut first = pipeline.enqueue(dest, "one", DeliveryClass::Direct).unwrap();
        assert_eq!(first.wait().await, Ok(()));
        assert_eq!(pipeline.active_lanes(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(pipeline.active_lanes(), 0);

        let mut second = pipeline.enqueue(dest, "two", DeliveryClass::Direct).unwrap();
        assert_eq!(second.wait().await, Ok(()));
        assert_eq!(pipeline.active_lanes(), 1);
        assert_eq!(radio.sent_to(dest).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fails_unfinished_messages() {
        let (pipeline, radio, _link) = setup(fast_tuning());
        radio.set_ack_policy(AckPolicy::Never);
        let mut handle = pipeline
            .enqueue(Destination::Node(PEER), "pending", DeliveryClass::Direct)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pipeline.pending_acks(), 1);
        pipeline.shutdown();
        assert_eq!(pipeline.pending_acks(), 0);
        assert_eq!(handle.wait().await, Err(DeliveryError::Shutdown));
        assert_eq!(radio.sent().len(), 1);
        assert!(pipeline
            .enqueue(Destination::Node(PEER), "late", DeliveryClass::Direct)
            .is_err());
    }
}
