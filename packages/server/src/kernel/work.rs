//! Work tasks: continuations with a deadline.
//!
//! Long-running handlers never block the loop; anything that must
//! happen later (a reservation start, an occurrence end, a move retry)
//! is scheduled here and executed by the timer loop.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::ServerKernel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkKind {
    /// Open a confirmed reservation's period.
    ResvStart(String),
    /// Deliver an occurrence-end for (resvid, occurrence index).
    ResvOccurEnd(String, u64),
    /// Retry a transiently failed job move to `destination`.
    MoveRetry { jobid: String, destination: String },
    /// Drop an expired finished-job history record.
    JobHistoryExpire(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkTask {
    pub at: DateTime<Utc>,
    pub kind: WorkKind,
}

impl Ord for WorkTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at)
    }
}

impl PartialOrd for WorkTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<WorkTask>,
}

impl WorkQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn schedule(&self, at: DateTime<Utc>, kind: WorkKind) {
        debug!(?kind, %at, "work task scheduled");
        let _ = self.tx.send(WorkTask { at, kind });
    }

    pub fn schedule_now(&self, kind: WorkKind) {
        self.schedule(Utc::now(), kind);
    }
}

/// The timer loop: keeps a deadline heap and fires due tasks.
pub async fn run_work_loop(kernel: Arc<ServerKernel>, mut rx: mpsc::UnboundedReceiver<WorkTask>) {
    let mut heap: BinaryHeap<Reverse<WorkTask>> = BinaryHeap::new();
    loop {
        let next_due = heap.peek().map(|Reverse(t)| t.at);
        let sleep = match next_due {
            Some(at) => {
                let delta = (at - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(delta)
            }
            None => tokio::time::sleep(std::time::Duration::from_secs(3600)),
        };
        tokio::select! {
            _ = kernel.shutdown.cancelled() => break,
            task = rx.recv() => match task {
                Some(t) => heap.push(Reverse(t)),
                None => break,
            },
            _ = sleep => {
                while let Some(Reverse(t)) = heap.peek() {
                    if t.at > Utc::now() {
                        break;
                    }
                    let Reverse(task) = heap.pop().expect("peeked");
                    if let Err(e) = execute(&kernel, task.kind.clone()).await {
                        warn!(kind = ?task.kind, error = %e, "work task failed");
                    }
                }
            }
        }
    }
}

async fn execute(kernel: &Arc<ServerKernel>, kind: WorkKind) -> crate::common::Result<()> {
    match kind {
        WorkKind::ResvStart(resvid) => {
            crate::dispatch::handlers::resv::begin_reservation(kernel, &resvid).await
        }
        WorkKind::ResvOccurEnd(resvid, k) => {
            crate::dispatch::handlers::resv::occurrence_end(kernel, &resvid, k).await?;
            Ok(())
        }
        WorkKind::MoveRetry { jobid, destination } => {
            crate::dispatch::handlers::job::retry_move(kernel, &jobid, &destination).await
        }
        WorkKind::JobHistoryExpire(jobid) => {
            crate::dispatch::handlers::job::expire_history(kernel, &jobid).await
        }
    }
}
