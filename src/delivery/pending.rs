//! Pending-acknowledgment buffer.
//!
//! Keyed by `(destination, chunk sequence)`. Each entry remembers every packet
//! id used for the chunk so an ack for an earlier attempt still resolves it.

use std::collections::HashMap;

use log::{debug, trace};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::metrics;
use crate::transport::{Destination, NodeId, PacketId};

/// How a pending chunk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Delivered,
    TimedOut,
}

/// Result of feeding one acknowledgment to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckResolution {
    /// A pending chunk was resolved.
    Resolved { seq: usize },
    /// The ack originated at the local node and was ignored.
    SelfEcho,
    /// No pending chunk matched destination and packet id.
    Unmatched,
}

pub(crate) struct PendingChunk {
    pub message_id: u64,
    pub packet_ids: Vec<PacketId>,
    pub sent_at: Instant,
    pub deadline: Instant,
    responder: Option<oneshot::Sender<AckOutcome>>,
}

impl PendingChunk {
    pub fn new(
        message_id: u64,
        packet_ids: Vec<PacketId>,
        sent_at: Instant,
        deadline: Instant,
        responder: oneshot::Sender<AckOutcome>,
    ) -> Self {
        Self {
            message_id,
            packet_ids,
            sent_at,
            deadline,
            responder: Some(responder),
        }
    }

    fn finish(mut self, outcome: AckOutcome) {
        if let Some(tx) = self.responder.take() {
            let _ = tx.send(outcome);
        }
    }
}

#[derive(Default)]
pub(crate) struct PendingAcks {
    entries: HashMap<(Destination, usize), PendingChunk>,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Register a chunk awaiting its ack. Refused when another chunk to the same
    /// destination is still outstanding.
    pub fn insert(&mut self, destination: Destination, seq: usize, chunk: PendingChunk) -> bool {
        if self
            .entries
            .keys()
            .any(|(d, s)| *d == destination && *s != seq)
        {
            return false;
        }
        self.entries.insert((destination, seq), chunk);
        true
    }

    /// Apply an inbound ack. Acks from `local` are self-echoes of our own
    /// transmission; an unknown origin (0) is accepted.
    pub fn resolve_ack(
        &mut self,
        origin: NodeId,
        request_id: PacketId,
        destination: Destination,
        local: NodeId,
    ) -> AckResolution {
        if origin == local && !origin.is_unknown() {
            metrics::inc_self_echo_ignored();
            trace!(
                "Ignoring self-echo ack id={} for {} (origin is local node)",
                request_id,
                destination
            );
            return AckResolution::SelfEcho;
        }

        let key = self
            .entries
            .iter()
            .find(|((d, _), p)| *d == destination && p.packet_ids.contains(&request_id))
            .map(|(k, _)| *k);

        match key.and_then(|k| self.entries.remove(&k).map(|p| (k.1, p))) {
            Some((seq, chunk)) => {
                metrics::observe_ack_latency(chunk.sent_at);
                metrics::inc_chunks_acked();
                debug!(
                    "Ack id={} from {} resolves msg={} chunk={} to {} (attempts={}, latency_ms={})",
                    request_id,
                    origin,
                    chunk.message_id,
                    seq,
                    destination,
                    chunk.packet_ids.len(),
                    chunk.sent_at.elapsed().as_millis()
                );
                chunk.finish(AckOutcome::Delivered);
                AckResolution::Resolved { seq }
            }
            None => AckResolution::Unmatched,
        }
    }

    /// Remove and time out every chunk whose deadline is at or before `now`.
    /// Returns the affected keys.
    pub fn take_expired(&mut self, now: Instant) -> Vec<(Destination, usize)> {
        let expired: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            if let Some(chunk) = self.entries.remove(key) {
                chunk.finish(AckOutcome::TimedOut);
            }
        }
        expired
    }

    /// Drop every entry, failing their waiters as timed out.
    pub fn clear(&mut self) {
        for (_, chunk) in self.entries.drain() {
            chunk.finish(AckOutcome::TimedOut);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const LOCAL: NodeId = NodeId(0x10);
    const REMOTE: NodeId = NodeId(0x20);

    fn entry(ids: Vec<PacketId>, ttl: Duration) -> (PendingChunk, oneshot::Receiver<AckOutcome>) {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        (PendingChunk::new(7, ids, now, now + ttl, tx), rx)
    }

    #[tokio::test]
    async fn remote_ack_resolves_matching_destination() {
        let mut pending = PendingAcks::new();
        let dest = Destination::Node(REMOTE);
        let (chunk, rx) = entry(vec![100], Duration::from_secs(60));
        assert!(pending.insert(dest, 0, chunk));

        // wrong destination
        assert_eq!(
            pending.resolve_ack(REMOTE, 100, Destination::Node(NodeId(0x30)), LOCAL),
            AckResolution::Unmatched
        );
        // self echo
        assert_eq!(
            pending.resolve_ack(LOCAL, 100, dest, LOCAL),
            AckResolution::SelfEcho
        );
        assert_eq!(pending.len(), 1);

        assert_eq!(
            pending.resolve_ack(REMOTE, 100, dest, LOCAL),
            AckResolution::Resolved { seq: 0 }
        );
        assert_eq!(rx.await.unwrap(), AckOutcome::Delivered);
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn earlier_attempt_and_unknown_origin_count() {
        let mut pending = PendingAcks::new();
        let dest = Destination::Node(REMOTE);
        let (chunk, rx) = entry(vec![5, 6, 7], Duration::from_secs(60));
        pending.insert(dest, 2, chunk);
        assert_eq!(
            pending.resolve_ack(NodeId::UNKNOWN, 5, dest, LOCAL),
            AckResolution::Resolved { seq: 2 }
        );
        assert_eq!(rx.await.unwrap(), AckOutcome::Delivered);
    }

    #[test]
    fn one_outstanding_chunk_per_destination() {
        let mut pending = PendingAcks::new();
        let dest = Destination::Node(REMOTE);
        let (a, _ra) = entry(vec![1], Duration::from_secs(60));
        let (b, _rb) = entry(vec![2], Duration::from_secs(60));
        let (c, _rc) = entry(vec![3], Duration::from_secs(60));
        assert!(pending.insert(dest, 0, a));
        assert!(!pending.insert(dest, 1, b));
        assert!(pending.insert(Destination::Node(NodeId(0x30)), 0, c));
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_times_out_expired_entries() {
        let mut pending = PendingAcks::new();
        let dest = Destination::Node(REMOTE);
        let (chunk, rx) = entry(vec![9], Duration::from_secs(60));
        pending.insert(dest, 0, chunk);

        assert!(pending.take_expired(Instant::now()).is_empty());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(pending.take_expired(Instant::now()), vec![(dest, 0)]);
        assert_eq!(rx.await.unwrap(), AckOutcome::TimedOut);
    }
}
