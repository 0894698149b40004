//! Process-wide delivery, link and scheduler counters.
//! Cheap relaxed atomics; read through [`snapshot`].
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

static CHUNKS_SENT: AtomicU64 = AtomicU64::new(0);
static CHUNKS_ACKED: AtomicU64 = AtomicU64::new(0);
static CHUNK_RETRIES: AtomicU64 = AtomicU64::new(0);
static MESSAGES_DELIVERED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_FAILED: AtomicU64 = AtomicU64::new(0);
static BROADCAST_CHUNKS: AtomicU64 = AtomicU64::new(0);
static SELF_ECHO_IGNORED: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_SUM_MS: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_COUNT: AtomicU64 = AtomicU64::new(0);
static PROBES_SENT: AtomicU64 = AtomicU64::new(0);
static RECONNECT_ATTEMPTS: AtomicU64 = AtomicU64::new(0);
static ZOMBIES_DETECTED: AtomicU64 = AtomicU64::new(0);
static TASKS_FIRED: AtomicU64 = AtomicU64::new(0);
static TASKS_FAILED: AtomicU64 = AtomicU64::new(0);

pub fn inc_chunks_sent() {
    CHUNKS_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_chunks_acked() {
    CHUNKS_ACKED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_chunk_retries() {
    CHUNK_RETRIES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_messages_delivered() {
    MESSAGES_DELIVERED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_messages_failed() {
    MESSAGES_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_broadcast_chunks() {
    BROADCAST_CHUNKS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_self_echo_ignored() {
    SELF_ECHO_IGNORED.fetch_add(1, Ordering::Relaxed);
}
pub fn observe_ack_latency(sent_at: Instant) {
    let ms = sent_at.elapsed().as_millis() as u64;
    ACK_LATENCY_SUM_MS.fetch_add(ms, Ordering::Relaxed);
    ACK_LATENCY_COUNT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_probes_sent() {
    PROBES_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_reconnect_attempts() {
    RECONNECT_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_zombies_detected() {
    ZOMBIES_DETECTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_tasks_fired() {
    TASKS_FIRED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_tasks_failed() {
    TASKS_FAILED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Snapshot {
    pub chunks_sent: u64,
    pub chunks_acked: u64,
    pub chunk_retries: u64,
    pub messages_delivered: u64,
    pub messages_failed: u64,
    pub broadcast_chunks: u64,
    pub self_echo_ignored: u64,
    pub ack_latency_avg_ms: Option<u64>,
    pub probes_sent: u64,
    pub reconnect_attempts: u64,
    pub zombies_detected: u64,
    pub tasks_fired: u64,
    pub tasks_failed: u64,
}

pub fn snapshot() -> Snapshot {
    let sum = ACK_LATENCY_SUM_MS.load(Ordering::Relaxed);
    let count = ACK_LATENCY_COUNT.load(Ordering::Relaxed);
    Snapshot {
        chunks_sent: CHUNKS_SENT.load(Ordering::Relaxed),
        chunks_acked: CHUNKS_ACKED.load(Ordering::Relaxed),
        chunk_retries: CHUNK_RETRIES.load(Ordering::Relaxed),
        messages_delivered: MESSAGES_DELIVERED.load(Ordering::Relaxed),
        messages_failed: MESSAGES_FAILED.load(Ordering::Relaxed),
        broadcast_chunks: BROADCAST_CHUNKS.load(Ordering::Relaxed),
        self_echo_ignored: SELF_ECHO_IGNORED.load(Ordering::Relaxed),
        ack_latency_avg_ms: if count > 0 { Some(sum / count) } else { None },
        probes_sent: PROBES_SENT.load(Ordering::Relaxed),
        reconnect_attempts: RECONNECT_ATTEMPTS.load(Ordering::Relaxed),
        zombies_detected: ZOMBIES_DETECTED.load(Ordering::Relaxed),
        tasks_fired: TASKS_FIRED.load(Ordering::Relaxed),
        tasks_failed: TASKS_FAILED.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Counters are global and other tests run in parallel, so only check monotonic growth.
    #[test]
    fn counters_only_grow() {
        let before = snapshot();
        inc_chunks_sent();
        inc_probes_sent();
        inc_tasks_fired();
        let after = snapshot();
        assert!(after.chunks_sent > before.chunks_sent);
        assert!(after.probes_sent > before.probes_sent);
        assert!(after.tasks_fired > before.tasks_fired);
    }

    #[test]
    fn snapshot_serializes() {
        let json = serde_json::to_value(snapshot()).unwrap();
        assert!(json.get("chunks_acked").is_some());
        assert!(json.get("ack_latency_avg_ms").is_some());
    }
}
