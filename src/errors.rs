use thiserror::Error;

use crate::transport::{Destination, NodeId};

/// Failures reported by the transport adapter. Recoverable: they drive the
/// reconnection loop or a per-chunk retry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The radio is not attached (serial/TCP link down).
    #[error("radio not connected")]
    NotConnected,

    /// The adapter refused the frame (payload too large, radio queue full, ...).
    #[error("radio rejected frame: {0}")]
    Rejected(String),

    /// Wrapper around IO failures surfaced by the adapter.
    #[error("transport io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Errors produced by the outbound delivery pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Returned by enqueue when the bounded outbound queue is full.
    #[error("outbound queue full ({queued}/{capacity} messages)")]
    QueueFull { queued: usize, capacity: usize },

    /// Nothing left to send after trimming.
    #[error("message is empty")]
    EmptyMessage,

    /// A chunk was never acknowledged, even after every retry.
    #[error("no ack from {destination} for chunk {seq} after {attempts} attempts")]
    AckTimeout {
        destination: Destination,
        seq: usize,
        attempts: u32,
    },

    /// The last transmission attempt of a chunk failed at the transport.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The pipeline was shut down before the message finished.
    #[error("delivery pipeline shut down")]
    Shutdown,
}

/// Link-level failures that are presumed unrecoverable without a full
/// re-attach. Handled by deliberate process termination.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FatalLinkError {
    /// Radio attachment looks alive but the probe went unanswered.
    #[error("zombie connection: silent for {silent_secs}s and probe unanswered after {probe_timeout_secs}s")]
    Zombie {
        silent_secs: u64,
        probe_timeout_secs: u64,
    },

    /// The link stayed down past the prolonged-loss threshold or the attempt budget.
    #[error("link lost for {down_secs}s after {attempts} reconnect attempts")]
    ProlongedLoss { down_secs: u64, attempts: u32 },
}

/// Rejections from the scheduler's registration/cancellation surface.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task {task} is owned by {owner}, not {requester}")]
    NotOwner {
        task: String,
        owner: NodeId,
        requester: NodeId,
    },

    #[error("{owner} already has {limit} active tasks")]
    LimitReached { owner: NodeId, limit: usize },

    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("task has no notification targets")]
    NoTargets,
}

/// A task fired but its notification could not be built or handed off.
/// The task is marked failed and never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskTriggerError {
    #[error("task {task}: template rendered an empty notification")]
    EmptyPayload { task: String },

    #[error("task {task}: hand-off to {target} failed: {source}")]
    Delivery {
        task: String,
        target: Destination,
        #[source]
        source: DeliveryError,
    },
}

/// Errors from the bounded response worker pool.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("response queue full (capacity {0})")]
    QueueFull(usize),

    #[error("worker pool closed")]
    Closed,
}
