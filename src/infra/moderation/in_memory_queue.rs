// In-memory implementation of JobQueue.
//
// Jobs are lost on restart; the recovery sweep re-queues whatever was in
// flight. Leases work the same way as in the SQLite queue: an un-acked
// delivery becomes visible again once its lease runs out.

use crate::core::moderation::{Delivery, JobQueue, ModerationJob, QueueError, SubmissionId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Clone)]
struct QueuedJob {
    id: Uuid,
    job: ModerationJob,
    delivery_count: u32,
}

struct Lease {
    queued: QueuedJob,
    expires_at: Instant,
}

pub struct InMemoryJobQueue {
    pending: Mutex<VecDeque<QueuedJob>>,
    /// job id -> lease for delivered but not yet acked jobs
    leased: DashMap<Uuid, Lease>,
    lease_duration: Duration,
    closed: AtomicBool,
}

impl InMemoryJobQueue {
    pub fn new(lease_duration: Duration) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            leased: DashMap::new(),
            lease_duration,
            closed: AtomicBool::new(false),
        }
    }

    /// Stops accepting new jobs. Existing jobs can still be drained.
    #[allow(dead_code)]
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn lease(&self, mut queued: QueuedJob) -> Delivery {
        queued.delivery_count += 1;
        let delivery = Delivery {
            delivery_id: queued.id,
            job: queued.job.clone(),
            delivery_count: queued.delivery_count,
        };
        self.leased.insert(
            queued.id,
            Lease {
                queued,
                expires_at: Instant::now() + self.lease_duration,
            },
        );
        delivery
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: ModerationJob) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("queue is closed".to_string()));
        }
        self.pending.lock().await.push_back(QueuedJob {
            id: Uuid::new_v4(),
            job,
            delivery_count: 0,
        });
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let now = Instant::now();
        let expired = self
            .leased
            .iter()
            .find(|entry| entry.value().expires_at <= now)
            .map(|entry| *entry.key());
        if let Some(id) = expired {
            if let Some((_, lease)) = self.leased.remove(&id) {
                tracing::debug!("Lease on job {} expired, redelivering", id);
                return Ok(Some(self.lease(lease.queued)));
            }
        }

        let next = self.pending.lock().await.pop_front();
        Ok(next.map(|queued| self.lease(queued)))
    }

    async fn ack(&self, delivery_id: Uuid) -> Result<(), QueueError> {
        self.leased.remove(&delivery_id);
        Ok(())
    }

    async fn renew_lease(&self, delivery_id: Uuid) -> Result<bool, QueueError> {
        match self.leased.get_mut(&delivery_id) {
            Some(mut lease) => {
                lease.expires_at = Instant::now() + self.lease_duration;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn is_in_flight(&self, submission_id: SubmissionId) -> Result<bool, QueueError> {
        if self
            .leased
            .iter()
            .any(|entry| entry.value().queued.job.submission_id == submission_id)
        {
            return Ok(true);
        }
        Ok(self
            .pending
            .lock()
            .await
            .iter()
            .any(|q| q.job.submission_id == submission_id))
    }
}
