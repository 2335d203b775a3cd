// src/dispatch/queue.rs

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::trace;

use crate::dispatch::{Dispatcher, Job, JobEnvelope, QueueIntrospector};
use crate::errors::{FlowError, Result};

type InFlight = Arc<Mutex<HashSet<String>>>;

fn in_flight(set: &InFlight) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sending half of the in-process job queue.
///
/// Every dispatched job gets a fresh task id which stays "in flight" from
/// enqueue until a worker calls [`JobReceiver::finish`].
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<JobEnvelope>,
    in_flight: InFlight,
}

/// Receiving half, shared by all workers.
#[derive(Debug)]
pub struct JobReceiver {
    rx: AsyncMutex<mpsc::UnboundedReceiver<JobEnvelope>>,
    in_flight: InFlight,
}

impl JobQueue {
    pub fn new() -> (JobQueue, JobReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let in_flight: InFlight = Arc::default();
        (
            JobQueue {
                tx,
                in_flight: Arc::clone(&in_flight),
            },
            JobReceiver {
                rx: AsyncMutex::new(rx),
                in_flight,
            },
        )
    }

    /// No job is queued or running.
    pub fn is_idle(&self) -> bool {
        in_flight(&self.in_flight).is_empty()
    }
}

impl Dispatcher for JobQueue {
    fn dispatch_as(&self, task_id: String, job: Job) -> Result<()> {
        in_flight(&self.in_flight).insert(task_id.clone());

        let label = job.label();
        if self
            .tx
            .send(JobEnvelope {
                task_id: task_id.clone(),
                job,
            })
            .is_err()
        {
            in_flight(&self.in_flight).remove(&task_id);
            return Err(FlowError::QueueClosed);
        }

        trace!(%task_id, job = %label, "job enqueued");
        Ok(())
    }
}

impl QueueIntrospector for JobQueue {
    fn active_task_ids(&self) -> Result<HashSet<String>> {
        Ok(in_flight(&self.in_flight).clone())
    }
}

impl JobReceiver {
    /// Next job, or `None` once every [`JobQueue`] handle is dropped.
    pub async fn recv(&self) -> Option<JobEnvelope> {
        self.rx.lock().await.recv().await
    }

    /// Mark `task_id` as no longer in flight.
    pub fn finish(&self, task_id: &str) {
        in_flight(&self.in_flight).remove(task_id);
    }
}
