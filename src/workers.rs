//! Bounded pool for AI-response generation.
//!
//! Jobs are futures producing reply text. A fixed number of workers pull from
//! a bounded queue; submission fails fast with [`WorkerError::QueueFull`]
//! instead of queueing without limit. Replies (or an error notice) go to the
//! requester through the [`Notifier`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::errors::WorkerError;
use crate::logutil::preview;
use crate::scheduler::Notifier;
use crate::transport::{Destination, NodeId};

pub type ResponseFuture = Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>>;

pub struct ResponseJob {
    pub requester: NodeId,
    pub reply_to: Destination,
    pub work: ResponseFuture,
}

impl ResponseJob {
    pub fn new<F>(requester: NodeId, reply_to: Destination, work: F) -> Self
    where
        F: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        Self {
            requester,
            reply_to,
            work: Box::pin(work),
        }
    }
}

pub struct WorkerPool {
    tx: mpsc::Sender<ResponseJob>,
    capacity: usize,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers sharing a queue of `capacity` jobs.
    pub fn start(
        size: usize,
        capacity: usize,
        notifier: Arc<dyn Notifier>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..size.max(1))
            .map(|n| {
                tokio::spawn(run_worker(
                    n,
                    rx.clone(),
                    notifier.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();
        info!("Started {} response worker(s), queue {}", size.max(1), capacity);
        Self {
            tx,
            capacity,
            workers,
        }
    }

    pub fn try_submit(&self, job: ResponseJob) -> Result<(), WorkerError> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) => {
                warn!(
                    "Response queue full; rejecting request from {}",
                    job.requester
                );
                WorkerError::QueueFull(self.capacity)
            }
            mpsc::error::TrySendError::Closed(_) => WorkerError::Closed,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker to exit (after shutdown is signalled).
    pub async fn join(self) {
        drop(self.tx);
        for w in self.workers {
            let _ = w.await;
        }
    }
}

async fn run_worker(
    n: usize,
    rx: Arc<Mutex<mpsc::Receiver<ResponseJob>>>,
    notifier: Arc<dyn Notifier>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                job = rx.recv() => job,
                _ = shutdown.wait_for(|s| *s) => None,
            }
        };
        let Some(job) = job else { break };

        debug!("worker {}: job for {}", n, job.requester);
        let text = match job.work.await {
            Ok(text) => text,
            Err(e) => {
                warn!("worker {}: response for {} failed: {}", n, job.requester, e);
                format!("Error: {}", e)
            }
        };
        if let Err(e) = notifier.notify(job.reply_to, &text) {
            warn!(
                "worker {}: could not queue reply to {} ('{}'): {}",
                n,
                job.reply_to,
                preview(&text, 40),
                e
            );
        }
    }
    debug!("worker {} stopped", n);
}
