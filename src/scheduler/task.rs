//! Scheduled task model: identifiers, triggers, status and template rendering.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::TaskError;
use crate::transport::{Destination, NodeId};

/// Stable, kind-prefixed task identifier (`once-3`, `watch-1`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub(crate) fn new(kind: TaskKind, n: u64) -> Self {
        TaskId(format!("{}-{}", kind.prefix(), n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        TaskId(s.trim().to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        TaskId::from(s.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    OneShot,
    Recurring,
    ConditionWatch,
    DeferredTelemetry,
}

impl TaskKind {
    pub fn prefix(self) -> &'static str {
        match self {
            TaskKind::OneShot => "once",
            TaskKind::Recurring => "every",
            TaskKind::ConditionWatch => "watch",
            TaskKind::DeferredTelemetry => "telem",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            TaskKind::OneShot => 0,
            TaskKind::Recurring => 1,
            TaskKind::ConditionWatch => 2,
            TaskKind::DeferredTelemetry => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Completed,
    Cancelled,
    Expired,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        self != TaskStatus::Active
    }
}

/// Comparison used by condition watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Comparator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Comparator {
    pub fn eval(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Lt => value < threshold,
            Comparator::Le => value <= threshold,
            Comparator::Gt => value > threshold,
            Comparator::Ge => value >= threshold,
            Comparator::Eq => value == threshold,
            Comparator::Ne => value != threshold,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        }
    }
}

impl FromStr for Comparator {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "<" => Ok(Comparator::Lt),
            "<=" => Ok(Comparator::Le),
            ">" => Ok(Comparator::Gt),
            ">=" => Ok(Comparator::Ge),
            "==" | "=" => Ok(Comparator::Eq),
            "!=" => Ok(Comparator::Ne),
            other => Err(TaskError::InvalidTrigger(format!(
                "unknown comparator '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// When a task fires. The variant determines the [`TaskKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum TaskTrigger {
    /// One-shot reminder.
    At(DateTime<Utc>),
    /// Recurring ping. `start` defaults to registration time + `interval`.
    Every {
        interval: Duration,
        start: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    },
    /// Edge-triggered telemetry watcher: fires when `value <op> threshold`
    /// becomes true.
    Threshold {
        node: NodeId,
        metric: String,
        op: Comparator,
        threshold: f64,
    },
    /// Waits for the first observation of `metric` from `node`.
    AwaitTelemetry { node: NodeId, metric: String },
}

impl TaskTrigger {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskTrigger::At(_) => TaskKind::OneShot,
            TaskTrigger::Every { .. } => TaskKind::Recurring,
            TaskTrigger::Threshold { .. } => TaskKind::ConditionWatch,
            TaskTrigger::AwaitTelemetry { .. } => TaskKind::DeferredTelemetry,
        }
    }

    /// Reject triggers that can never fire sensibly.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), TaskError> {
        match self {
            TaskTrigger::At(_) => Ok(()),
            TaskTrigger::Every {
                interval,
                start,
                until,
            } => {
                if interval.is_zero() {
                    return Err(TaskError::InvalidTrigger("interval must be non-zero".into()));
                }
                if *until <= start.unwrap_or(now) {
                    return Err(TaskError::InvalidTrigger(
                        "end time must be after the start time".into(),
                    ));
                }
                Ok(())
            }
            TaskTrigger::Threshold {
                metric, threshold, ..
            } => {
                if metric.trim().is_empty() {
                    return Err(TaskError::InvalidTrigger("metric name is empty".into()));
                }
                if !threshold.is_finite() {
                    return Err(TaskError::InvalidTrigger("threshold must be finite".into()));
                }
                Ok(())
            }
            TaskTrigger::AwaitTelemetry { metric, .. } => {
                if metric.trim().is_empty() {
                    return Err(TaskError::InvalidTrigger("metric name is empty".into()));
                }
                Ok(())
            }
        }
    }

    /// Node and metric this trigger listens to, for telemetry-driven kinds.
    pub fn watches(&self) -> Option<(NodeId, &str)> {
        match self {
            TaskTrigger::Threshold { node, metric, .. }
            | TaskTrigger::AwaitTelemetry { node, metric } => Some((*node, metric.as_str())),
            _ => None,
        }
    }
}

impl fmt::Display for TaskTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskTrigger::At(t) => write!(f, "at {}", t.format("%Y-%m-%d %H:%M:%S UTC")),
            TaskTrigger::Every {
                interval, until, ..
            } => write!(
                f,
                "every {}s until {}",
                interval.as_secs(),
                until.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            TaskTrigger::Threshold {
                node,
                metric,
                op,
                threshold,
            } => write!(f, "when {} {} {} {}", node, metric, op, threshold),
            TaskTrigger::AwaitTelemetry { node, metric } => {
                write!(f, "next {} from {}", metric, node)
            }
        }
    }
}

/// A registered task. Owned by the scheduler registry.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub id: TaskId,
    pub kind: TaskKind,
    pub owner: NodeId,
    pub targets: Vec<Destination>,
    pub template: String,
    pub trigger: TaskTrigger,
    pub status: TaskStatus,
    pub created: DateTime<Utc>,
    pub last_fired: Option<DateTime<Utc>>,
    pub fire_count: u32,
    /// Recurring tasks only.
    pub(crate) next_fire: Option<DateTime<Utc>>,
    /// Condition watchers only: whether the last observation satisfied it.
    pub(crate) condition_met: bool,
}

impl ScheduledTask {
    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id.clone(),
            kind: self.kind,
            owner: self.owner,
            targets: self.targets.clone(),
            trigger: self.trigger.to_string(),
            status: self.status,
            created: self.created,
            last_fired: self.last_fired,
            fire_count: self.fire_count,
        }
    }
}

/// Read-only view returned by `list_tasks`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub kind: TaskKind,
    pub owner: NodeId,
    pub targets: Vec<Destination>,
    pub trigger: String,
    pub status: TaskStatus,
    pub created: DateTime<Utc>,
    pub last_fired: Option<DateTime<Utc>>,
    pub fire_count: u32,
}

/// Values available to a notification template.
#[derive(Debug, Clone, Default)]
pub struct RenderContext<'a> {
    pub id: Option<&'a TaskId>,
    pub owner: Option<NodeId>,
    pub node: Option<NodeId>,
    pub metric: Option<&'a str>,
    pub value: Option<f64>,
    pub threshold: Option<f64>,
    pub count: u32,
    pub time: Option<DateTime<Utc>>,
}

/// Substitute `{node} {metric} {value} {threshold} {owner} {id} {count} {time}`.
/// Unavailable values render empty. Unknown braces are left alone.
pub fn render_template(template: &str, ctx: &RenderContext<'_>) -> String {
    fn opt<T: ToString>(v: Option<T>) -> String {
        v.map(|v| v.to_string()).unwrap_or_default()
    }
    template
        .replace("{node}", &opt(ctx.node))
        .replace("{metric}", ctx.metric.unwrap_or(""))
        .replace("{value}", &opt(ctx.value))
        .replace("{threshold}", &opt(ctx.threshold))
        .replace("{owner}", &opt(ctx.owner))
        .replace("{id}", &opt(ctx.id))
        .replace("{count}", &ctx.count.to_string())
        .replace(
            "{time}",
            &opt(ctx.time.map(|t| t.format("%H:%M UTC").to_string())),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn comparators_parse_and_evaluate() {
        let lt: Comparator = "<".parse().unwrap();
        assert!(lt.eval(8.0, 10.0));
        assert!(!lt.eval(10.0, 10.0));
        assert!("<=".parse::<Comparator>().unwrap().eval(10.0, 10.0));
        assert!(">".parse::<Comparator>().unwrap().eval(11.0, 10.0));
        assert!("!=".parse::<Comparator>().unwrap().eval(1.0, 2.0));
        assert!(matches!(
            "~".parse::<Comparator>(),
            Err(TaskError::InvalidTrigger(_))
        ));
    }

    #[test]
    fn kind_follows_trigger() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(TaskTrigger::At(t0).kind(), TaskKind::OneShot);
        let watch = TaskTrigger::Threshold {
            node: NodeId(5),
            metric: "battery".into(),
            op: Comparator::Lt,
            threshold: 10.0,
        };
        assert_eq!(watch.kind(), TaskKind::ConditionWatch);
        assert_eq!(watch.watches(), Some((NodeId(5), "battery")));
        assert_eq!(TaskId::new(TaskKind::ConditionWatch, 3).as_str(), "watch-3");
    }

    #[test]
    fn invalid_triggers_are_rejected() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let zero = TaskTrigger::Every {
            interval: Duration::ZERO,
            start: None,
            until: t0 + chrono::Duration::minutes(5),
        };
        assert!(zero.validate(t0).is_err());
        let ended = TaskTrigger::Every {
            interval: Duration::from_secs(30),
            start: None,
            until: t0,
        };
        assert!(ended.validate(t0).is_err());
        let nan = TaskTrigger::Threshold {
            node: NodeId(1),
            metric: "temp".into(),
            op: Comparator::Gt,
            threshold: f64::NAN,
        };
        assert!(nan.validate(t0).is_err());
    }

    #[test]
    fn template_placeholders() {
        let id = TaskId::new(TaskKind::ConditionWatch, 1);
        let ctx = RenderContext {
            id: Some(&id),
            owner: Some(NodeId(0xab)),
            node: Some(NodeId(0x1234)),
            metric: Some("battery"),
            value: Some(8.0),
            threshold: Some(10.0),
            count: 1,
            time: Some(Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap()),
        };
        let text = render_template(
            "[{id}] {node} {metric}={value} (<{threshold}) at {time} for {owner} #{count} {other}",
            &ctx,
        );
        assert_eq!(
            text,
            "[watch-1] !00001234 battery=8 (<10) at 05:06 UTC for !000000ab #1 {other}"
        );
        assert_eq!(render_template("{value}", &RenderContext::default()), "");
    }
}
