//! # Proactive Task Scheduler
//!
//! Fires notifications on behalf of mesh users:
//!
//! - **one-shot** reminders (`once-N`) fire when their time arrives
//! - **recurring** pings (`every-N`) fire on an interval until an end time
//! - **condition watchers** (`watch-N`) fire when a telemetry value crosses a
//!   threshold; edge-triggered, optionally re-armed
//! - **deferred telemetry** callbacks (`telem-N`) deliver a late reading to
//!   whoever asked for it
//!
//! Time-driven kinds are evaluated by [`TaskScheduler::tick`]; telemetry-driven
//! kinds by [`TaskScheduler::observe`]. Notifications leave through the
//! [`Notifier`] capability, called outside the registry lock. State is
//! in-memory only.

pub mod task;
pub mod telemetry;

pub use task::{
    render_template, Comparator, RenderContext, ScheduledTask, TaskId, TaskKind, TaskStatus,
    TaskSummary, TaskTrigger,
};
pub use telemetry::{TelemetryObservation, TelemetryTable};

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::errors::{DeliveryError, TaskError, TaskTriggerError};
use crate::logutil::preview;
use crate::metrics;
use crate::transport::{Destination, NodeId};

/// Terminal task statuses remembered so cancel-after-finish stays a no-op.
const FINISHED_HISTORY: usize = 256;

/// Hands a finished notification text to whatever delivers it.
pub trait Notifier: Send + Sync {
    fn notify(&self, target: Destination, text: &str) -> Result<(), DeliveryError>;
}

/// Wall-clock source; swapped for [`ManualClock`] in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += to_chrono(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128 / 2) as i64)
}

#[derive(Debug, Clone)]
pub struct SchedulerTuning {
    pub tick: Duration,
    pub max_tasks_per_owner: usize,
    pub rearm_condition_watches: bool,
    pub telemetry_history: usize,
    pub telemetry_request_timeout: Duration,
    pub deferred_ttl: Duration,
}

impl Default for SchedulerTuning {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            max_tasks_per_owner: 5,
            rearm_condition_watches: false,
            telemetry_history: 32,
            telemetry_request_timeout: Duration::from_secs(15),
            deferred_ttl: Duration::from_secs(3600),
        }
    }
}

/// Result of [`TaskScheduler::cancel_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The task had already finished; nothing changed.
    AlreadyFinished(TaskStatus),
}

#[derive(Default)]
struct Registry {
    active: BTreeMap<TaskId, ScheduledTask>,
    finished: VecDeque<(TaskId, TaskStatus)>,
}

impl Registry {
    fn retire(&mut self, id: &TaskId, status: TaskStatus) -> Option<ScheduledTask> {
        let mut task = self.active.remove(id)?;
        task.status = status;
        if self.finished.len() == FINISHED_HISTORY {
            self.finished.pop_front();
        }
        self.finished.push_back((id.clone(), status));
        Some(task)
    }

    fn finished_status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.finished
            .iter()
            .rev()
            .find(|(t, _)| t == id)
            .map(|(_, s)| *s)
    }
}

/// A notification computed under the lock, delivered after it is released.
struct Firing {
    id: TaskId,
    targets: Vec<Destination>,
    text: Result<String, TaskTriggerError>,
    completes: bool,
}

pub struct TaskScheduler {
    tuning: SchedulerTuning,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    registry: RwLock<Registry>,
    counters: [AtomicU64; 4],
    telemetry: TelemetryTable,
}

impl TaskScheduler {
    pub fn new(tuning: SchedulerTuning, notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>) -> Self {
        let telemetry = TelemetryTable::new(tuning.telemetry_history);
        Self {
            tuning,
            notifier,
            clock,
            registry: RwLock::new(Registry::default()),
            counters: Default::default(),
            telemetry,
        }
    }

    pub fn tuning(&self) -> &SchedulerTuning {
        &self.tuning
    }

    pub fn telemetry(&self) -> &TelemetryTable {
        &self.telemetry
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn next_id(&self, kind: TaskKind) -> TaskId {
        let n = self.counters[kind.index()].fetch_add(1, Ordering::SeqCst) + 1;
        TaskId::new(kind, n)
    }

    /// Register a task; its kind follows from `trigger`. Deferred-telemetry
    /// callbacks are created by the system and do not count toward the
    /// per-owner limit.
    pub fn register_task(
        &self,
        trigger: TaskTrigger,
        targets: Vec<Destination>,
        template: &str,
        owner: NodeId,
    ) -> Result<TaskId, TaskError> {
        if targets.is_empty() {
            return Err(TaskError::NoTargets);
        }
        let now = self.clock.now();
        trigger.validate(now)?;
        let kind = trigger.kind();

        let next_fire = match &trigger {
            TaskTrigger::Every {
                interval, start, ..
            } => Some(start.unwrap_or_else(|| now + to_chrono(*interval))),
            _ => None,
        };

        let mut reg = self.registry.write().unwrap_or_else(|e| e.into_inner());
        if kind != TaskKind::DeferredTelemetry {
            let owned = reg
                .active
                .values()
                .filter(|t| t.owner == owner && t.kind != TaskKind::DeferredTelemetry)
                .count();
            if owned >= self.tuning.max_tasks_per_owner {
                return Err(TaskError::LimitReached {
                    owner,
                    limit: self.tuning.max_tasks_per_owner,
                });
            }
        }

        let id = self.next_id(kind);
        info!(
            "Registered {} for {} ({}, {} target(s))",
            id,
            owner,
            trigger,
            targets.len()
        );
        reg.active.insert(
            id.clone(),
            ScheduledTask {
                id: id.clone(),
                kind,
                owner,
                targets,
                template: template.to_string(),
                trigger,
                status: TaskStatus::Active,
                created: now,
                last_fired: None,
                fire_count: 0,
                next_fire,
                condition_met: false,
            },
        );
        Ok(id)
    }

    /// Cancel an active task. Only its owner may cancel it.
    pub fn cancel_task(&self, id: &TaskId, requester: NodeId) -> Result<CancelOutcome, TaskError> {
        let mut reg = self.registry.write().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = reg.active.get(id) {
            if task.owner != requester {
                return Err(TaskError::NotOwner {
                    task: id.to_string(),
                    owner: task.owner,
                    requester,
                });
            }
            reg.retire(id, TaskStatus::Cancelled);
            info!("Cancelled {} at request of {}", id, requester);
            return Ok(CancelOutcome::Cancelled);
        }
        match reg.finished_status(id) {
            Some(status) => Ok(CancelOutcome::AlreadyFinished(status)),
            None => Err(TaskError::NotFound(id.to_string())),
        }
    }

    /// Active tasks owned by `owner`, ordered by id.
    pub fn list_tasks(&self, owner: NodeId) -> Vec<TaskSummary> {
        let reg = self.registry.read().unwrap_or_else(|e| e.into_inner());
        reg.active
            .values()
            .filter(|t| t.owner == owner)
            .map(ScheduledTask::summary)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .active
            .len()
    }

    /// Current status of a task, including recently finished ones.
    pub fn task_status(&self, id: &TaskId) -> Option<TaskStatus> {
        let reg = self.registry.read().unwrap_or_else(|e| e.into_inner());
        reg.active
            .get(id)
            .map(|t| t.status)
            .or_else(|| reg.finished_status(id))
    }

    fn render(&self, task: &ScheduledTask, now: DateTime<Utc>, obs: Option<&TelemetryObservation>) -> Result<String, TaskTriggerError> {
        let (node, metric, threshold) = match &task.trigger {
            TaskTrigger::Threshold {
                node,
                metric,
                threshold,
                ..
            } => (Some(*node), Some(metric.as_str()), Some(*threshold)),
            TaskTrigger::AwaitTelemetry { node, metric } => {
                (Some(*node), Some(metric.as_str()), None)
            }
            _ => (None, None, None),
        };
        let ctx = RenderContext {
            id: Some(&task.id),
            owner: Some(task.owner),
            node,
            metric,
            value: obs.map(|o| o.value),
            threshold,
            count: task.fire_count,
            time: Some(now),
        };
        let text = render_template(&task.template, &ctx);
        if text.trim().is_empty() {
            return Err(TaskTriggerError::EmptyPayload {
                task: task.id.to_string(),
            });
        }
        Ok(text)
    }

    fn fire(&self, task: &mut ScheduledTask, now: DateTime<Utc>, obs: Option<&TelemetryObservation>, completes: bool) -> Firing {
        task.fire_count += 1;
        task.last_fired = Some(now);
        Firing {
            id: task.id.clone(),
            targets: task.targets.clone(),
            text: self.render(task, now, obs),
            completes,
        }
    }

    /// Evaluate time-driven tasks. Returns the number of tasks fired.
    pub fn tick(&self) -> usize {
        let now = self.clock.now();
        let ttl = to_chrono(self.tuning.deferred_ttl);
        let mut firings = Vec::new();
        {
            let mut reg = self.registry.write().unwrap_or_else(|e| e.into_inner());
            let mut expired = Vec::new();
            for task in reg.active.values_mut() {
                match task.trigger.clone() {
                    TaskTrigger::At(at) => {
                        if now >= at {
                            firings.push(self.fire(task, now, None, true));
                        }
                    }
                    TaskTrigger::Every {
                        interval, until, ..
                    } => {
                        if now >= until {
                            expired.push(task.id.clone());
                        } else if task.next_fire.map(|t| now >= t).unwrap_or(false) {
                            firings.push(self.fire(task, now, None, false));
                            task.next_fire = now.checked_add_signed(to_chrono(interval));
                        }
                    }
                    TaskTrigger::AwaitTelemetry { .. } => {
                        if now - task.created >= ttl {
                            expired.push(task.id.clone());
                        }
                    }
                    TaskTrigger::Threshold { .. } => {}
                }
            }
            for id in expired {
                if let Some(task) = reg.retire(&id, TaskStatus::Expired) {
                    info!("{} expired after {} firing(s)", id, task.fire_count);
                }
            }
        }
        self.dispatch(firings)
    }

    /// Record a telemetry observation and evaluate watchers and deferred
    /// callbacks listening to its node and metric. Returns the number fired.
    pub fn observe(&self, obs: TelemetryObservation) -> usize {
        self.telemetry.record(obs.clone());
        let now = self.clock.now();
        let rearm = self.tuning.rearm_condition_watches;
        let mut firings = Vec::new();
        {
            let mut reg = self.registry.write().unwrap_or_else(|e| e.into_inner());
            for task in reg.active.values_mut() {
                match task.trigger.watches() {
                    Some((node, metric)) if obs.matches(node, metric) => {}
                    _ => continue,
                }
                match task.trigger.clone() {
                    TaskTrigger::Threshold { op, threshold, .. } => {
                        let met = op.eval(obs.value, threshold);
                        let edge = met && !task.condition_met;
                        task.condition_met = met;
                        if edge {
                            debug!(
                                "{}: {} {} {} {} crossed",
                                task.id, obs.metric, obs.value, op, threshold
                            );
                            firings.push(self.fire(task, now, Some(&obs), !rearm));
                        }
                    }
                    TaskTrigger::AwaitTelemetry { .. } => {
                        firings.push(self.fire(task, now, Some(&obs), true));
                    }
                    _ => {}
                }
            }
        }
        self.dispatch(firings)
    }

    /// Resolve deferred-telemetry task `id` with a reading that was already
    /// recorded. No-op (false) when the task is gone, has fired, or does not
    /// wait for this node and metric.
    pub fn resolve_deferred(&self, id: &TaskId, obs: &TelemetryObservation) -> bool {
        let now = self.clock.now();
        let firing = {
            let mut reg = self.registry.write().unwrap_or_else(|e| e.into_inner());
            let Some(task) = reg.active.get_mut(id) else {
                return false;
            };
            let waits_for_obs = matches!(task.trigger, TaskTrigger::AwaitTelemetry { .. })
                && task
                    .trigger
                    .watches()
                    .map_or(false, |(node, metric)| obs.matches(node, metric));
            if !waits_for_obs || task.fire_count > 0 {
                return false;
            }
            self.fire(task, now, Some(obs), true)
        };
        self.dispatch(vec![firing]) > 0
    }

    /// Hand firings to the notifier (outside the lock) and settle statuses.
    fn dispatch(&self, firings: Vec<Firing>) -> usize {
        let fired = firings.len();
        let mut outcomes = Vec::with_capacity(fired);
        for firing in firings {
            metrics::inc_tasks_fired();
            let result = firing.text.and_then(|text| {
                let mut first_err = None;
                for target in &firing.targets {
                    if let Err(source) = self.notifier.notify(*target, &text) {
                        first_err.get_or_insert(TaskTriggerError::Delivery {
                            task: firing.id.to_string(),
                            target: *target,
                            source,
                        });
                    }
                }
                debug!("{} fired: '{}'", firing.id, preview(&text, 80));
                first_err.map_or(Ok(()), Err)
            });
            outcomes.push((firing.id, firing.completes, result));
        }

        if outcomes.is_empty() {
            return 0;
        }
        let mut reg = self.registry.write().unwrap_or_else(|e| e.into_inner());
        for (id, completes, result) in outcomes {
            match result {
                Err(e) => {
                    metrics::inc_tasks_failed();
                    warn!("{}", e);
                    reg.retire(&id, TaskStatus::Failed);
                }
                Ok(()) if completes => {
                    reg.retire(&id, TaskStatus::Completed);
                }
                Ok(()) => {}
            }
        }
        fired
    }

    /// Periodic evaluation loop; runs until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.tuning.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick();
                }
                _ = shutdown.wait_for(|s| *s) => break,
            }
        }
        debug!("Scheduler loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// Notifier that records every hand-off; fails for listed targets.
    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(Destination, String)>>,
        refuse: Vec<Destination>,
    }

    impl Notifier for Recorder {
        fn notify(&self, target: Destination, text: &str) -> Result<(), DeliveryError> {
            if self.refuse.contains(&target) {
                return Err(DeliveryError::QueueFull {
                    queued: 1,
                    capacity: 1,
                });
            }
            self.sent.lock().unwrap().push((target, text.to_string()));
            Ok(())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
    }

    fn scheduler(tuning: SchedulerTuning, recorder: Arc<Recorder>) -> (TaskScheduler, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        (TaskScheduler::new(tuning, recorder, clock.clone()), clock)
    }

    const OWNER: NodeId = NodeId(0xaa);

    #[test]
    fn one_shot_fires_once_and_completes() {
        let rec = Arc::new(Recorder::default());
        let (s, clock) = scheduler(SchedulerTuning::default(), rec.clone());
        let id = s
            .register_task(
                TaskTrigger::At(t0() + chrono::Duration::seconds(10)),
                vec![Destination::Node(OWNER)],
                "Reminder {id}: check the solar panel",
                OWNER,
            )
            .unwrap();
        assert_eq!(id.as_str(), "once-1");

        clock.advance(Duration::from_secs(9));
        assert_eq!(s.tick(), 0);
        clock.advance(Duration::from_secs(1));
        assert_eq!(s.tick(), 1);
        assert_eq!(s.tick(), 0);

        let sent = rec.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "Reminder once-1: check the solar panel");
        assert_eq!(s.task_status(&id), Some(TaskStatus::Completed));
        assert!(s.list_tasks(OWNER).is_empty());
    }

    #[test]
    fn empty_render_fails_task() {
        let rec = Arc::new(Recorder::default());
        let (s, _clock) = scheduler(SchedulerTuning::default(), rec.clone());
        let id = s
            .register_task(TaskTrigger::At(t0()), vec![Destination::Channel(0)], "{value}", OWNER)
            .unwrap();
        s.tick();
        assert_eq!(s.task_status(&id), Some(TaskStatus::Failed));
        assert!(rec.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn handoff_failure_fails_task_without_retry() {
        let rec = Arc::new(Recorder {
            refuse: vec![Destination::Node(NodeId(2))],
            ..Recorder::default()
        });
        let (s, clock) = scheduler(SchedulerTuning::default(), rec.clone());
        let id = s
            .register_task(
                TaskTrigger::Every {
                    interval: Duration::from_secs(10),
                    start: None,
                    until: t0() + chrono::Duration::minutes(10),
                },
                vec![Destination::Node(NodeId(1)), Destination::Node(NodeId(2))],
                "ping",
                OWNER,
            )
            .unwrap();
        clock.advance(Duration::from_secs(10));
        assert_eq!(s.tick(), 1);
        assert_eq!(s.task_status(&id), Some(TaskStatus::Failed));
        clock.advance(Duration::from_secs(10));
        assert_eq!(s.tick(), 0);
        // the healthy target still got its copy
        assert_eq!(rec.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn cancel_rules() {
        let rec = Arc::new(Recorder::default());
        let (s, _clock) = scheduler(SchedulerTuning::default(), rec);
        let id = s
            .register_task(
                TaskTrigger::At(t0() + chrono::Duration::hours(1)),
                vec![Destination::Node(OWNER)],
                "later",
                OWNER,
            )
            .unwrap();

        assert!(matches!(
            s.cancel_task(&id, NodeId(0xbb)),
            Err(TaskError::NotOwner { .. })
        ));
        assert_eq!(s.cancel_task(&id, OWNER), Ok(CancelOutcome::Cancelled));
        assert_eq!(
            s.cancel_task(&id, OWNER),
            Ok(CancelOutcome::AlreadyFinished(TaskStatus::Cancelled))
        );
        assert!(matches!(
            s.cancel_task(&TaskId::from("once-99"), OWNER),
            Err(TaskError::NotFound(_))
        ));
    }

    #[test]
    fn per_owner_limit_and_validation() {
        let rec = Arc::new(Recorder::default());
        let tuning = SchedulerTuning {
            max_tasks_per_owner: 2,
            ..SchedulerTuning::default()
        };
        let (s, _clock) = scheduler(tuning, rec);
        let later = TaskTrigger::At(t0() + chrono::Duration::hours(1));
        let me = vec![Destination::Node(OWNER)];
        s.register_task(later.clone(), me.clone(), "a", OWNER).unwrap();
        s.register_task(later.clone(), me.clone(), "b", OWNER).unwrap();
        assert_eq!(
            s.register_task(later.clone(), me.clone(), "c", OWNER),
            Err(TaskError::LimitReached { owner: OWNER, limit: 2 })
        );
        // deferred callbacks are exempt
        assert!(s
            .register_task(
                TaskTrigger::AwaitTelemetry { node: NodeId(3), metric: "battery".into() },
                me.clone(),
                "{value}",
                OWNER,
            )
            .is_ok());
        assert_eq!(
            s.register_task(later, Vec::new(), "x", NodeId(0xcc)),
            Err(TaskError::NoTargets)
        );
    }

    #[test]
    fn deferred_callback_resolves_on_first_match_or_expires() {
        let rec = Arc::new(Recorder::default());
        let (s, clock) = scheduler(SchedulerTuning::default(), rec.clone());
        let me = vec![Destination::Node(OWNER)];
        let resolved = s
            .register_task(
                TaskTrigger::AwaitTelemetry { node: NodeId(3), metric: "battery".into() },
                me.clone(),
                "{node} {metric}: {value}",
                OWNER,
            )
            .unwrap();
        let stale = s
            .register_task(
                TaskTrigger::AwaitTelemetry { node: NodeId(4), metric: "battery".into() },
                me,
                "{value}",
                OWNER,
            )
            .unwrap();
        assert_eq!(resolved.as_str(), "telem-1");

        s.observe(TelemetryObservation::new(NodeId(3), "voltage", 3.9, clock.now()));
        assert_eq!(s.observe(TelemetryObservation::new(NodeId(3), "battery", 76.0, clock.now())), 1);
        assert_eq!(s.task_status(&resolved), Some(TaskStatus::Completed));
        assert_eq!(rec.sent.lock().unwrap()[0].1, "!00000003 battery: 76");

        clock.advance(Duration::from_secs(3600));
        s.tick();
        assert_eq!(s.task_status(&stale), Some(TaskStatus::Expired));
    }

    #[test]
    fn deferred_callback_resolves_from_recorded_reading() {
        let rec = Arc::new(Recorder::default());
        let (s, clock) = scheduler(SchedulerTuning::default(), rec.clone());
        let id = s
            .register_task(
                TaskTrigger::AwaitTelemetry { node: NodeId(3), metric: "battery".into() },
                vec![Destination::Node(OWNER)],
                "{value}",
                OWNER,
            )
            .unwrap();

        let other = TelemetryObservation::new(NodeId(3), "voltage", 3.9, clock.now());
        assert!(!s.resolve_deferred(&id, &other));

        let obs = TelemetryObservation::new(NodeId(3), "battery", 55.0, clock.now());
        assert!(s.resolve_deferred(&id, &obs));
        assert_eq!(s.task_status(&id), Some(TaskStatus::Completed));
        // already fired: the reading arriving through observe as well changes nothing
        assert!(!s.resolve_deferred(&id, &obs));
        assert_eq!(s.observe(obs), 0);
        let sent = rec.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![(Destination::Node(OWNER), "55".to_string())]);
    }
}
