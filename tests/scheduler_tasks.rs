mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use common::{Recorder, PEER};
use meshagent::scheduler::{
    Clock, Comparator, ManualClock, SchedulerTuning, TaskKind, TaskScheduler, TaskStatus, TaskTrigger,
    TelemetryObservation,
};
use meshagent::transport::{Destination, NodeId};

const SENSOR: NodeId = NodeId(0x5e50_0001);

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
}

fn setup(tuning: SchedulerTuning) -> (TaskScheduler, Arc<ManualClock>, Arc<Recorder>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let recorder = Arc::new(Recorder::default());
    let scheduler = TaskScheduler::new(tuning, recorder.clone(), clock.clone());
    (scheduler, clock, recorder)
}

fn battery_below(limit: f64) -> TaskTrigger {
    TaskTrigger::Threshold {
        node: SENSOR,
        metric: "battery".into(),
        op: Comparator::Lt,
        threshold: limit,
    }
}

fn feed(scheduler: &TaskScheduler, clock: &ManualClock, values: &[f64]) {
    for v in values {
        clock.advance(Duration::from_secs(60));
        scheduler.observe(TelemetryObservation::new(SENSOR, "battery", *v, clock.now()));
    }
}

#[test]
fn recurring_ping_fires_on_interval_until_end() {
    let (scheduler, clock, recorder) = setup(SchedulerTuning::default());
    let id = scheduler
        .register_task(
            TaskTrigger::Every {
                interval: Duration::from_secs(30),
                start: None,
                until: t0() + chrono::Duration::seconds(300),
            },
            vec![Destination::Node(PEER)],
            "ping {count}",
            PEER,
        )
        .unwrap();
    assert_eq!(id.as_str(), "every-1");

    for _ in 0..310 {
        clock.advance(Duration::from_secs(1));
        scheduler.tick();
    }

    let texts = recorder.texts();
    assert_eq!(texts.len(), 9);
    assert_eq!(texts.first().map(String::as_str), Some("ping 1"));
    assert_eq!(texts.last().map(String::as_str), Some("ping 9"));
    assert_eq!(scheduler.task_status(&id), Some(TaskStatus::Expired));
    assert!(scheduler.list_tasks(PEER).is_empty());
}

#[test]
fn threshold_watch_fires_once_on_crossing() {
    let (scheduler, clock, recorder) = setup(SchedulerTuning::default());
    let id = scheduler
        .register_task(
            battery_below(10.0),
            vec![Destination::Node(PEER), Destination::Channel(0)],
            "{node} battery at {value}",
            PEER,
        )
        .unwrap();
    assert_eq!(id.as_str(), "watch-1");

    feed(&scheduler, &clock, &[15.0, 12.0, 8.0, 7.0, 6.0]);

    let sent = recorder.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].1, format!("{} battery at 8", SENSOR));
    assert_eq!(sent[1].0, Destination::Channel(0));
    assert_eq!(scheduler.task_status(&id), Some(TaskStatus::Completed));
}

#[test]
fn rearmed_watch_fires_on_each_new_crossing() {
    let tuning = SchedulerTuning {
        rearm_condition_watches: true,
        ..SchedulerTuning::default()
    };
    let (scheduler, clock, recorder) = setup(tuning);
    let id = scheduler
        .register_task(
            battery_below(10.0),
            vec![Destination::Node(PEER)],
            "low: {value}",
            PEER,
        )
        .unwrap();

    feed(&scheduler, &clock, &[15.0, 8.0, 12.0, 7.0]);

    assert_eq!(recorder.texts(), vec!["low: 8", "low: 7"]);
    assert_eq!(scheduler.task_status(&id), Some(TaskStatus::Active));
    assert_eq!(scheduler.list_tasks(PEER)[0].fire_count, 2);
}

#[test]
fn other_nodes_and_metrics_are_ignored() {
    let (scheduler, clock, recorder) = setup(SchedulerTuning::default());
    scheduler
        .register_task(battery_below(10.0), vec![Destination::Node(PEER)], "low", PEER)
        .unwrap();
    scheduler.observe(TelemetryObservation::new(NodeId(0x99), "battery", 1.0, clock.now()));
    scheduler.observe(TelemetryObservation::new(SENSOR, "voltage", 1.0, clock.now()));
    assert!(recorder.texts().is_empty());
    assert_eq!(scheduler.active_count(), 1);
}

#[test]
fn concurrent_registration_yields_unique_ids() {
    let (scheduler, _clock, _recorder) = setup(SchedulerTuning::default());
    let at = t0() + chrono::Duration::hours(1);

    let ids: Vec<_> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..8u32)
            .map(|owner| {
                let scheduler = &scheduler;
                s.spawn(move || {
                    (0..5)
                        .map(|_| {
                            scheduler
                                .register_task(
                                    TaskTrigger::At(at),
                                    vec![Destination::Node(NodeId(owner + 1))],
                                    "wake up",
                                    NodeId(owner + 1),
                                )
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    });

    let unique: HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), 40);
    assert!(ids.iter().all(|id| id.as_str().starts_with("once-")));
    assert_eq!(scheduler.active_count(), 40);
}

#[test]
fn ids_count_per_kind() {
    let (scheduler, _clock, _recorder) = setup(SchedulerTuning::default());
    let dest = vec![Destination::Node(PEER)];
    let once = scheduler
        .register_task(
            TaskTrigger::At(t0() + chrono::Duration::minutes(5)),
            dest.clone(),
            "a",
            PEER,
        )
        .unwrap();
    let watch = scheduler
        .register_task(battery_below(5.0), dest.clone(), "b", PEER)
        .unwrap();
    let once2 = scheduler
        .register_task(
            TaskTrigger::At(t0() + chrono::Duration::minutes(9)),
            dest,
            "c",
            PEER,
        )
        .unwrap();
    assert_eq!(
        (once.as_str(), watch.as_str(), once2.as_str()),
        ("once-1", "watch-1", "once-2")
    );

    let kinds: Vec<_> = scheduler.list_tasks(PEER).iter().map(|t| t.kind).collect();
    assert_eq!(kinds.len(), 3);
    assert!(kinds.contains(&TaskKind::ConditionWatch));
}
