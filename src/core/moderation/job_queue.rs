// Job queue port.
//
// Delivery contract: at-least-once, no ordering across jobs. A dequeued job is
// leased to the caller; if it isn't acked before the lease runs out it becomes
// visible again. Consumers must therefore tolerate duplicate deliveries.

use super::moderation_models::SubmissionId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Job payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// What a job asks the worker to classify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobContent {
    Image { image_url: String },
    /// Only produced by recovery, for text that was mid-classification when
    /// the process died.
    Text { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationJob {
    pub submission_id: SubmissionId,
    pub submitter: String,
    pub content: JobContent,
    /// Set when recovery re-queued a submission that was already `Processing`.
    #[serde(default)]
    pub recovery: bool,
}

impl ModerationJob {
    pub fn image(submission_id: SubmissionId, submitter: &str, image_url: &str) -> Self {
        Self {
            submission_id,
            submitter: submitter.to_string(),
            content: JobContent::Image {
                image_url: image_url.to_string(),
            },
            recovery: false,
        }
    }
}

/// A leased job.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_id: Uuid,
    pub job: ModerationJob,
    /// How many times this job has been handed out, including this one.
    pub delivery_count: u32,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: ModerationJob) -> Result<(), QueueError>;

    /// Leases the next visible job, or `None` if nothing is ready.
    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError>;

    /// Removes a delivered job for good.
    async fn ack(&self, delivery_id: Uuid) -> Result<(), QueueError>;

    /// Pushes the lease on a delivered job a full lease period forward.
    /// Returns `false` if the job is no longer queued.
    async fn renew_lease(&self, delivery_id: Uuid) -> Result<bool, QueueError>;

    /// Whether a job for this submission is queued or leased.
    async fn is_in_flight(&self, submission_id: SubmissionId) -> Result<bool, QueueError>;
}
