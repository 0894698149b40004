//! Telemetry observation table: bounded history per (node, metric) plus a
//! broadcast feed for callers waiting on a fresh reading.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::transport::NodeId;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryObservation {
    pub node: NodeId,
    pub metric: String,
    pub value: f64,
    pub at: DateTime<Utc>,
}

impl TelemetryObservation {
    pub fn new(node: NodeId, metric: impl Into<String>, value: f64, at: DateTime<Utc>) -> Self {
        Self {
            node,
            metric: metric.into(),
            value,
            at,
        }
    }

    pub fn matches(&self, node: NodeId, metric: &str) -> bool {
        self.node == node && self.metric == metric
    }
}

pub struct TelemetryTable {
    capacity: usize,
    series: RwLock<HashMap<(NodeId, String), VecDeque<TelemetryObservation>>>,
    updates: broadcast::Sender<TelemetryObservation>,
}

impl TelemetryTable {
    /// Keeps at most `capacity` observations per (node, metric).
    pub fn new(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(128);
        Self {
            capacity: capacity.max(1),
            series: RwLock::new(HashMap::new()),
            updates,
        }
    }

    pub fn record(&self, obs: TelemetryObservation) {
        {
            let mut series = self.series.write().unwrap_or_else(|e| e.into_inner());
            let entry = series
                .entry((obs.node, obs.metric.clone()))
                .or_default();
            if entry.len() == self.capacity {
                entry.pop_front();
            }
            entry.push_back(obs.clone());
        }
        let _ = self.updates.send(obs);
    }

    pub fn latest(&self, node: NodeId, metric: &str) -> Option<TelemetryObservation> {
        let series = self.series.read().unwrap_or_else(|e| e.into_inner());
        series
            .get(&(node, metric.to_string()))
            .and_then(|s| s.back().cloned())
    }

    /// Oldest first.
    pub fn history(&self, node: NodeId, metric: &str) -> Vec<TelemetryObservation> {
        let series = self.series.read().unwrap_or_else(|e| e.into_inner());
        series
            .get(&(node, metric.to_string()))
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryObservation> {
        self.updates.subscribe()
    }
}
