//! # Connection Health Monitor
//!
//! Tracks whether the radio link is actually carrying traffic, drives
//! reconnection, detects zombie links (attachment up, traffic dead) and keeps
//! the supervisor liveness file in sync.
//!
//! The state machine lives in [`HealthMonitor`], a plain struct driven by
//! explicit `now` timestamps so it can be tested without a runtime. The
//! [`HealthHandle`] wraps it for sharing between the event router and the
//! watchdog loop and publishes every state change on a `watch` channel that
//! the delivery lanes use as their link gate.
//!
//! ```text
//! Connecting --connected--> Connected --silence--> Silent --probe--> Probing
//!     ^  |                     ^                                      |  |
//!     |  +--fail--> Disconnected <--------- disconnect ---------------+  |
//!     +--- retry ------+  |                     probe ack --> Connected  |
//!                         +--connected--> Connected    timeout --> Zombie (terminal)
//! ```

pub mod liveness;

pub use liveness::LivenessFile;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::errors::FatalLinkError;
use crate::metrics;
use crate::transport::{LinkEvent, PacketId, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Silent,
    Probing,
    Zombie,
    Disconnected,
}

impl ConnectionState {
    /// Whether outbound traffic may be handed to the radio.
    pub fn can_transmit(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Silent | ConnectionState::Probing
        )
    }

    /// Healthy states keep the liveness file present.
    pub fn is_healthy(self) -> bool {
        self.can_transmit()
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Silent)
                | (Connected, Disconnected)
                | (Silent, Probing)
                | (Silent, Disconnected)
                | (Probing, Connected)
                | (Probing, Zombie)
                | (Probing, Disconnected)
                | (Disconnected, Connecting)
                | (Disconnected, Connected)
        )
    }
}

#[derive(Debug, Clone)]
pub struct HealthTuning {
    pub activity_timeout: Duration,
    pub probe_timeout: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub prolonged_loss: Duration,
    pub tick: Duration,
}

impl Default for HealthTuning {
    fn default() -> Self {
        Self {
            activity_timeout: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(10),
            max_reconnect_attempts: 5,
            prolonged_loss: Duration::from_secs(60),
            tick: Duration::from_secs(1),
        }
    }
}

/// Side effects requested by [`HealthMonitor::tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthAction {
    SendProbe,
    Reconnect,
    Heartbeat,
    ClearHeartbeat,
    Terminate(FatalLinkError),
}

/// Link liveness state machine.
#[derive(Debug)]
pub struct HealthMonitor {
    tuning: HealthTuning,
    state: ConnectionState,
    state_since: Instant,
    last_activity: Instant,
    probe: Option<(PacketId, Instant)>,
    reconnect_attempts: u32,
    down_since: Option<Instant>,
    next_reconnect_at: Option<Instant>,
    terminated: bool,
}

impl HealthMonitor {
    /// Starts in `Connecting`; the loss timer runs until the first connect.
    pub fn new(tuning: HealthTuning, now: Instant) -> Self {
        Self {
            tuning,
            state: ConnectionState::Connecting,
            state_since: now,
            last_activity: now,
            probe: None,
            reconnect_attempts: 0,
            down_since: Some(now),
            next_reconnect_at: None,
            terminated: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn outstanding_probe(&self) -> Option<PacketId> {
        self.probe.map(|(id, _)| id)
    }

    fn transition(&mut self, next: ConnectionState, now: Instant) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                "Ignoring illegal link transition {:?} -> {:?}",
                self.state, next
            );
            return false;
        }
        info!("Link state {:?} -> {:?}", self.state, next);
        self.state = next;
        self.state_since = now;
        true
    }

    fn connected_fresh(&mut self, now: Instant) {
        if self.transition(ConnectionState::Connected, now) {
            self.last_activity = now;
            self.probe = None;
            self.reconnect_attempts = 0;
            self.down_since = None;
            self.next_reconnect_at = None;
        }
    }

    fn go_down(&mut self, now: Instant) {
        if self.transition(ConnectionState::Disconnected, now) {
            self.probe = None;
            self.down_since.get_or_insert(now);
            self.next_reconnect_at = Some(now + self.tuning.reconnect_interval);
        }
    }

    /// Any inbound packet, self-echoes included.
    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn on_link_event(&mut self, event: LinkEvent, now: Instant) {
        match (event, self.state) {
            (_, ConnectionState::Zombie) => {}
            (LinkEvent::Connected, ConnectionState::Connecting | ConnectionState::Disconnected) => {
                self.connected_fresh(now)
            }
            (LinkEvent::Connected, _) => {
                debug!("Connect event while already {:?}", self.state);
                self.last_activity = now;
            }
            (LinkEvent::Disconnected, ConnectionState::Disconnected) => {}
            (LinkEvent::Disconnected, _) => self.go_down(now),
        }
    }

    /// The probe requested by [`HealthAction::SendProbe`] went out as `id`.
    pub fn probe_sent(&mut self, id: PacketId, now: Instant) {
        if self.state == ConnectionState::Silent && self.transition(ConnectionState::Probing, now) {
            self.probe = Some((id, now));
        }
    }

    /// The probe could not be handed to the radio.
    pub fn probe_failed(&mut self, now: Instant) {
        if self.state == ConnectionState::Silent {
            self.go_down(now);
        }
    }

    /// Ack correlated by packet id, from any origin. Returns true when it
    /// answered the outstanding probe.
    pub fn on_ack(&mut self, request_id: PacketId, now: Instant) -> bool {
        match self.probe {
            Some((id, sent)) if id == request_id && self.state == ConnectionState::Probing => {
                debug!(
                    "Probe id={} answered after {}ms",
                    id,
                    now.saturating_duration_since(sent).as_millis()
                );
                self.probe = None;
                self.last_activity = now;
                self.transition(ConnectionState::Connected, now)
            }
            _ => false,
        }
    }

    /// The attempt requested by [`HealthAction::Reconnect`] failed outright.
    pub fn reconnect_failed(&mut self, now: Instant) {
        if self.state == ConnectionState::Connecting {
            self.go_down(now);
        }
    }

    /// Advance timers and return the side effects to perform.
    pub fn tick(&mut self, now: Instant) -> Vec<HealthAction> {
        let mut actions = Vec::new();
        if self.terminated {
            return actions;
        }

        match self.state {
            ConnectionState::Connected => {
                if now.saturating_duration_since(self.last_activity) >= self.tuning.activity_timeout
                    && self.transition(ConnectionState::Silent, now)
                {
                    actions.push(HealthAction::SendProbe);
                }
            }
            ConnectionState::Probing => {
                if let Some((_, sent)) = self.probe {
                    if now.saturating_duration_since(sent) >= self.tuning.probe_timeout {
                        self.transition(ConnectionState::Zombie, now);
                        metrics::inc_zombies_detected();
                        let fatal = FatalLinkError::Zombie {
                            silent_secs: now.saturating_duration_since(self.last_activity).as_secs(),
                            probe_timeout_secs: self.tuning.probe_timeout.as_secs(),
                        };
                        return self.terminate(actions, fatal);
                    }
                }
            }
            ConnectionState::Connecting => {
                let due = self.state_since + self.tuning.reconnect_interval;
                if now >= due {
                    debug!("Connect attempt did not complete in time");
                    self.go_down(now);
                    // the timed-out attempt already used up its interval
                    self.next_reconnect_at = Some(due);
                    self.try_reconnect(now, &mut actions);
                }
            }
            ConnectionState::Disconnected => self.try_reconnect(now, &mut actions),
            ConnectionState::Silent | ConnectionState::Zombie => {}
        }

        if let Some(since) = self.down_since {
            let down = now.saturating_duration_since(since);
            let attempts_spent = self.state == ConnectionState::Disconnected
                && self.reconnect_attempts >= self.tuning.max_reconnect_attempts;
            if down >= self.tuning.prolonged_loss || attempts_spent {
                let fatal = FatalLinkError::ProlongedLoss {
                    down_secs: down.as_secs(),
                    attempts: self.reconnect_attempts,
                };
                return self.terminate(Vec::new(), fatal);
            }
        }

        actions.push(if self.state.is_healthy() {
            HealthAction::Heartbeat
        } else {
            HealthAction::ClearHeartbeat
        });
        actions
    }

    fn try_reconnect(&mut self, now: Instant, actions: &mut Vec<HealthAction>) {
        let attempts_spent = self.reconnect_attempts >= self.tuning.max_reconnect_attempts;
        let due = self.next_reconnect_at.map(|t| now >= t).unwrap_or(true);
        if due && !attempts_spent && self.transition(ConnectionState::Connecting, now) {
            self.reconnect_attempts += 1;
            info!(
                "Reconnect attempt {}/{}",
                self.reconnect_attempts, self.tuning.max_reconnect_attempts
            );
            actions.push(HealthAction::Reconnect);
        }
    }

    fn terminate(&mut self, mut actions: Vec<HealthAction>, fatal: FatalLinkError) -> Vec<HealthAction> {
        self.terminated = true;
        actions.push(HealthAction::ClearHeartbeat);
        actions.push(HealthAction::Terminate(fatal));
        actions
    }
}

/// Deliberate shutdown on an unrecoverable link.
pub trait Terminator: Send + Sync {
    fn terminate(&self, reason: &FatalLinkError);
}

/// Exits the process so a supervisor restarts it with a fresh attachment.
pub struct ProcessExit {
    pub code: i32,
}

impl Default for ProcessExit {
    fn default() -> Self {
        Self { code: 1 }
    }
}

impl Terminator for ProcessExit {
    fn terminate(&self, reason: &FatalLinkError) {
        error!("Terminating: {}", reason);
        log::logger().flush();
        std::process::exit(self.code);
    }
}

/// Records termination requests instead of exiting.
#[derive(Default)]
pub struct RecordingTerminator {
    reasons: Mutex<Vec<FatalLinkError>>,
}

impl RecordingTerminator {
    pub fn reasons(&self) -> Vec<FatalLinkError> {
        self.reasons.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Terminator for RecordingTerminator {
    fn terminate(&self, reason: &FatalLinkError) {
        self.reasons
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(reason.clone());
    }
}

/// Shared handle over the monitor; publishes state on a watch channel.
#[derive(Clone)]
pub struct HealthHandle {
    monitor: Arc<Mutex<HealthMonitor>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    tick: Duration,
}

impl HealthHandle {
    pub fn new(tuning: HealthTuning) -> Self {
        let tick = tuning.tick;
        let monitor = HealthMonitor::new(tuning, Instant::now());
        let (state_tx, _) = watch::channel(monitor.state());
        Self {
            monitor: Arc::new(Mutex::new(monitor)),
            state_tx: Arc::new(state_tx),
            tick,
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut HealthMonitor, Instant) -> R) -> R {
        let mut monitor = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
        let r = f(&mut monitor, Instant::now());
        let state = monitor.state();
        self.state_tx.send_if_modified(|s| {
            let changed = *s != state;
            *s = state;
            changed
        });
        r
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn record_activity(&self) {
        self.with(|m, now| m.record_activity(now));
    }

    pub fn on_link_event(&self, event: LinkEvent) {
        self.with(|m, now| m.on_link_event(event, now));
    }

    pub fn on_ack(&self, request_id: PacketId) -> bool {
        self.with(|m, now| m.on_ack(request_id, now))
    }

    pub fn tick(&self) -> Vec<HealthAction> {
        self.with(|m, now| m.tick(now))
    }

    /// Watchdog loop: ticks the monitor and performs its actions until
    /// shutdown or termination.
    pub async fn run(
        self,
        transport: Arc<dyn Transport>,
        liveness: Option<LivenessFile>,
        terminator: Arc<dyn Terminator>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Health watchdog started");

        'outer: loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait_for(|s| *s) => break,
            }
            for action in self.tick() {
                match action {
                    // Monitor stays locked across the send so the probe ack
                    // cannot be routed before the probe id is recorded.
                    HealthAction::SendProbe => self.with(|m, now| match transport.probe() {
                        Ok(id) => {
                            metrics::inc_probes_sent();
                            info!("Link silent; sent probe id={}", id);
                            m.probe_sent(id, now);
                        }
                        Err(e) => {
                            warn!("Probe send failed: {}", e);
                            m.probe_failed(now);
                        }
                    }),
                    HealthAction::Reconnect => {
                        metrics::inc_reconnect_attempts();
                        if let Err(e) = transport.reconnect() {
                            warn!("Reconnect attempt failed: {}", e);
                            self.with(|m, now| m.reconnect_failed(now));
                        }
                    }
                    HealthAction::Heartbeat => {
                        if let Some(file) = &liveness {
                            if let Err(e) = file.touch() {
                                warn!("Failed to write liveness file {}: {}", file.path().display(), e);
                            }
                        }
                    }
                    HealthAction::ClearHeartbeat => {
                        if let Some(file) = &liveness {
                            if let Err(e) = file.clear() {
                                warn!("Failed to remove liveness file {}: {}", file.path().display(), e);
                            }
                        }
                    }
                    HealthAction::Terminate(reason) => {
                        error!("Fatal link failure: {}", reason);
                        terminator.terminate(&reason);
                        break 'outer;
                    }
                }
            }
        }
        info!("Health watchdog stopped");
    }
}
