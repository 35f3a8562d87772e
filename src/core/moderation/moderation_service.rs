// Moderation orchestrator - the per-submission state machine.
//
// Text is classified synchronously on the caller's task. Images are queued and
// picked up by workers (see worker.rs), which call `process_job`. Both paths
// share the same finalisation: the verdict write and the terminal transition
// are one compare-and-set, so duplicate deliveries and concurrent recovery
// can't apply side effects twice.
//
// This service holds no state of its own; everything durable lives in the
// store, so the process can be restarted at any point and `recover` picks up
// the pieces.

use super::classifier::{Classifier, ClassifierError};
use super::fingerprint::fingerprint;
use super::image_fetcher::{DownloadError, ImageFetcher};
use super::job_queue::{JobContent, JobQueue, ModerationJob, QueueError};
use super::moderation_models::{
    ContentType, JobOutcome, ModerationConfig, NewSubmission, Submission, SubmissionId,
    SubmissionState, SubmissionSummary, SummaryResult, TextOutcome, Verdict,
};
use super::moderation_store::{ModerationStore, StoreError, Transition};
use super::notification_gate::NotificationGate;
use super::retry::retry_with_backoff;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// The submission was created but could not be queued; it is now `Failed`.
    #[error("Submission {id} rejected: {source}")]
    Rejected {
        id: SubmissionId,
        #[source]
        source: QueueError,
    },
}

/// What one recovery sweep did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub failed: usize,
    pub errors: usize,
}

enum Recovered {
    Requeued,
    Failed,
    Untouched,
}

const STALLED_REASON: &str = "stalled after recovery";

// ============================================================================
// CORE SERVICE
// ============================================================================

pub struct ModerationService {
    store: Arc<dyn ModerationStore>,
    queue: Arc<dyn JobQueue>,
    classifier: Arc<dyn Classifier>,
    fetcher: Arc<dyn ImageFetcher>,
    gate: NotificationGate,
    config: ModerationConfig,
}

impl ModerationService {
    pub fn new(
        store: Arc<dyn ModerationStore>,
        queue: Arc<dyn JobQueue>,
        classifier: Arc<dyn Classifier>,
        fetcher: Arc<dyn ImageFetcher>,
        gate: NotificationGate,
        config: ModerationConfig,
    ) -> Self {
        Self {
            store,
            queue,
            classifier,
            fetcher,
            gate,
            config,
        }
    }

    /// Moderates text synchronously.
    ///
    /// Identical text that already has a completed verdict is answered from
    /// that verdict without classifying or notifying again. Classifier
    /// failures are reported in the outcome, not swallowed.
    pub async fn submit_text(
        &self,
        submitter: &str,
        text: &str,
    ) -> Result<TextOutcome, ModerationError> {
        let fp = fingerprint(text.as_bytes());

        if let Some(original) = self
            .store
            .find_by_fingerprint(ContentType::Text, &fp, SubmissionState::Completed)
            .await?
        {
            let root = original.verdict_source.unwrap_or(original.id);
            let submission = self
                .store
                .create_submission(NewSubmission::deduplicated(
                    ContentType::Text,
                    submitter,
                    text,
                    fp,
                    root,
                ))
                .await?;
            tracing::info!(
                "Text submission {} deduplicated against {}",
                submission.id,
                root
            );
            let verdict = self
                .store
                .get_verdict(submission.id)
                .await?
                .map(|record| record.verdict)
                .ok_or(StoreError::NotFound(root))?;
            return Ok(TextOutcome::Processed {
                id: submission.id,
                verdict,
                deduplicated: true,
            });
        }

        let submission = self
            .store
            .create_submission(NewSubmission::pending(
                ContentType::Text,
                submitter,
                text,
                Some(fp),
            ))
            .await?;
        let submission = self
            .store
            .transition_state(
                submission.id,
                Transition::new(SubmissionState::Pending, SubmissionState::Processing),
            )
            .await?;
        tracing::debug!("Text submission {} processing", submission.id);

        match self
            .classify_bounded(ContentType::Text, text.as_bytes())
            .await
        {
            Ok(verdict) => {
                if self.complete(&submission, verdict.clone()).await? {
                    return Ok(TextOutcome::Processed {
                        id: submission.id,
                        verdict,
                        deduplicated: false,
                    });
                }
            }
            Err(e) => {
                let reason = format!("classification failed: {}", e);
                if self
                    .fail(
                        &submission,
                        SubmissionState::Processing,
                        reason.clone(),
                        unknown_from(&e),
                    )
                    .await?
                {
                    return Ok(TextOutcome::Failed {
                        id: submission.id,
                        reason,
                    });
                }
            }
        }

        // Recovery finalised the submission first; report what it decided.
        self.stored_text_outcome(submission.id).await
    }

    /// Accepts an image for background moderation and returns immediately.
    ///
    /// If the job can't be queued the submission is marked `Failed` and the
    /// caller gets `ModerationError::Rejected`.
    pub async fn submit_image(
        &self,
        submitter: &str,
        image_url: &str,
    ) -> Result<SubmissionId, ModerationError> {
        let submission = self
            .store
            .create_submission(NewSubmission::pending(
                ContentType::Image,
                submitter,
                image_url,
                None,
            ))
            .await?;

        let job = ModerationJob::image(submission.id, submitter, image_url);
        if let Err(source) = self.queue.enqueue(job).await {
            tracing::error!(
                "Failed to queue image submission {}: {}",
                submission.id,
                source
            );
            let reason = format!("queue rejected submission: {}", source);
            if let Err(e) = self
                .store
                .transition_state(
                    submission.id,
                    Transition::to_failed(SubmissionState::Pending, reason),
                )
                .await
            {
                tracing::error!("Could not mark submission {} failed: {}", submission.id, e);
            }
            return Err(ModerationError::Rejected {
                id: submission.id,
                source,
            });
        }

        tracing::info!("Image submission {} queued", submission.id);
        Ok(submission.id)
    }

    /// Runs one delivered job to a terminal state.
    ///
    /// Safe to call more than once for the same job: deliveries for a
    /// submission that is already terminal, or being handled by someone
    /// else, are skipped without side effects.
    pub async fn process_job(&self, job: &ModerationJob) -> Result<JobOutcome, ModerationError> {
        let Some(submission) = self.store.get_submission(job.submission_id).await? else {
            return Ok(skipped("submission not found"));
        };

        if submission.state.is_terminal() {
            tracing::debug!(
                "Duplicate delivery for submission {} ({}), skipping",
                submission.id,
                submission.state
            );
            return Ok(skipped(format!("already {}", submission.state)));
        }
        if submission.state == SubmissionState::Processing && !job.recovery {
            return Ok(skipped("already processing"));
        }

        let from = submission.state;
        let bytes = match &job.content {
            JobContent::Text { text } => text.as_bytes().to_vec(),
            JobContent::Image { image_url } => match self.download(image_url).await {
                Ok(bytes) => bytes,
                Err((err, attempts)) => {
                    let reason = format!(
                        "image download failed after {} attempt(s): {}",
                        attempts, err
                    );
                    return self
                        .fail_job(&submission, from, reason, Verdict::unknown(err.to_string(), ""))
                        .await;
                }
            },
        };

        let fp = fingerprint(&bytes);
        if submission.fingerprint.is_none() {
            self.store.record_fingerprint(submission.id, &fp).await?;
        }

        if from == SubmissionState::Pending {
            if let Some(original) = self
                .store
                .find_by_fingerprint(submission.content_type, &fp, SubmissionState::Completed)
                .await?
            {
                let root = original.verdict_source.unwrap_or(original.id);
                return match self
                    .store
                    .reuse_verdict(
                        submission.id,
                        Transition::new(SubmissionState::Pending, SubmissionState::Completed),
                        root,
                    )
                    .await
                {
                    Ok(_) => {
                        tracing::info!(
                            "Submission {} deduplicated against {}",
                            submission.id,
                            root
                        );
                        Ok(JobOutcome::Deduplicated { original: root })
                    }
                    Err(e) if e.is_conflict() => Ok(skipped("state changed concurrently")),
                    Err(e) => Err(e.into()),
                };
            }

            match self
                .store
                .transition_state(
                    submission.id,
                    Transition::new(SubmissionState::Pending, SubmissionState::Processing),
                )
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_conflict() => return Ok(skipped("state changed concurrently")),
                Err(e) => return Err(e.into()),
            }
        }

        let content_type = submission.content_type;
        let content = bytes.as_slice();
        let retried = retry_with_backoff(
            &self.config.retry,
            "classification",
            ClassifierError::is_transient,
            move |_| self.classify_bounded(content_type, content),
        )
        .await;

        match retried.result {
            Ok(verdict) => {
                let label = verdict.label;
                if self.complete(&submission, verdict).await? {
                    Ok(JobOutcome::Completed(label))
                } else {
                    Ok(skipped("finalised concurrently"))
                }
            }
            Err(e) => {
                let reason = format!(
                    "classification failed after {} attempt(s): {}",
                    retried.attempts, e
                );
                self.fail_job(&submission, SubmissionState::Processing, reason, unknown_from(&e))
                    .await
            }
        }
    }

    /// Read-only projection of everything one identity has submitted.
    pub async fn get_summary(&self, identity: &str) -> Result<SummaryResult, ModerationError> {
        let submissions = self.store.list_by_submitter(identity).await?;
        if submissions.is_empty() {
            return Ok(SummaryResult::NoSubmissions {
                identity: identity.to_string(),
            });
        }

        let submissions: Vec<SubmissionSummary> = submissions
            .into_iter()
            .map(|s| SubmissionSummary {
                id: s.id,
                content_type: s.content_type,
                state: s.state,
            })
            .collect();

        Ok(SummaryResult::Found {
            identity: identity.to_string(),
            total: submissions.len(),
            submissions,
        })
    }

    /// Reconciles submissions left behind by a crash.
    ///
    /// A non-terminal submission with no queued job is re-queued once. Text
    /// (and anything still `Pending`) must also be older than the staleness
    /// threshold, since a live request may still be working on it. A
    /// submission that stalls again after being re-queued is marked `Failed`.
    ///
    /// One submission failing to recover doesn't stop the sweep; it is
    /// counted in `errors` and retried on the next sweep.
    pub async fn recover(&self) -> Result<RecoveryReport, ModerationError> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let cutoff = Utc::now() - stale_after;
        let mut report = RecoveryReport::default();

        for state in [SubmissionState::Pending, SubmissionState::Processing] {
            for submission in self.store.list_by_state(state).await? {
                match self.recover_one(&submission, state, cutoff).await {
                    Ok(Recovered::Requeued) => report.requeued += 1,
                    Ok(Recovered::Failed) => report.failed += 1,
                    Ok(Recovered::Untouched) => {}
                    Err(e) => {
                        tracing::error!("Could not recover submission {}: {}", submission.id, e);
                        report.errors += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    async fn recover_one(
        &self,
        submission: &Submission,
        state: SubmissionState,
        cutoff: chrono::DateTime<Utc>,
    ) -> Result<Recovered, ModerationError> {
        if self.queue.is_in_flight(submission.id).await? {
            return Ok(Recovered::Untouched);
        }
        let must_be_stale =
            submission.content_type == ContentType::Text || state == SubmissionState::Pending;
        if must_be_stale && submission.updated_at > cutoff {
            return Ok(Recovered::Untouched);
        }

        if submission.recovery_attempts >= 1 {
            tracing::warn!(
                "Submission {} stalled again in {}, marking failed",
                submission.id,
                state
            );
            let verdict = Verdict::unknown(STALLED_REASON, "");
            return Ok(
                if self.fail(submission, state, STALLED_REASON.to_string(), verdict).await? {
                    Recovered::Failed
                } else {
                    Recovered::Untouched
                },
            );
        }

        let content = match submission.content_type {
            ContentType::Text => JobContent::Text {
                text: submission.source.clone(),
            },
            ContentType::Image => JobContent::Image {
                image_url: submission.source.clone(),
            },
        };
        // Queue first: the attempt only counts once the job really exists.
        self.queue
            .enqueue(ModerationJob {
                submission_id: submission.id,
                submitter: submission.submitter.clone(),
                content,
                recovery: state == SubmissionState::Processing,
            })
            .await?;

        match self.store.mark_recovery_attempt(submission.id, state).await {
            Ok(_) => {}
            // The re-queued job already moved it along.
            Err(e) if e.is_conflict() => {
                tracing::debug!("Submission {} moved on during recovery: {}", submission.id, e)
            }
            Err(e) => return Err(e.into()),
        }
        tracing::info!("Re-queued {} submission {} for recovery", state, submission.id);
        Ok(Recovered::Requeued)
    }

    // ------------------------------------------------------------------------
    // helpers
    // ------------------------------------------------------------------------

    async fn classify_bounded(
        &self,
        content_type: ContentType,
        content: &[u8],
    ) -> Result<Verdict, ClassifierError> {
        let deadline = self.config.classify_timeout;
        match tokio::time::timeout(deadline, self.classifier.classify(content_type, content)).await
        {
            Ok(result) => result,
            Err(_) => Err(ClassifierError::timeout(format!(
                "no verdict within {:?}",
                deadline
            ))),
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, (DownloadError, u32)> {
        let fetcher = &self.fetcher;
        let retried = retry_with_backoff(
            &self.config.retry,
            "image download",
            DownloadError::is_transient,
            move |_| fetcher.fetch(url),
        )
        .await;
        retried.result.map_err(|e| (e, retried.attempts))
    }

    /// Records the verdict and completes the submission, then consults the
    /// notification gate. Returns `false` if someone else finalised it first.
    async fn complete(
        &self,
        submission: &Submission,
        verdict: Verdict,
    ) -> Result<bool, ModerationError> {
        let completed = match self
            .store
            .put_verdict(
                submission.id,
                Transition::new(SubmissionState::Processing, SubmissionState::Completed),
                verdict.clone(),
            )
            .await
        {
            Ok(completed) => completed,
            Err(e) if e.is_conflict() => {
                tracing::warn!("Submission {} finalised concurrently: {}", submission.id, e);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        tracing::info!(
            "Submission {} completed as {} ({}%)",
            completed.id,
            verdict.label,
            verdict.confidence
        );

        // The verdict is durable at this point; a failure to record the
        // notification must not turn a completed submission into an error.
        if let Err(e) = self.gate.maybe_notify(&completed, &verdict).await {
            tracing::error!(
                "Failed to record notification for submission {}: {}",
                completed.id,
                e
            );
        }
        Ok(true)
    }

    /// Records a sentinel verdict and fails the submission. Returns `false`
    /// if someone else finalised it first.
    async fn fail(
        &self,
        submission: &Submission,
        from: SubmissionState,
        reason: String,
        verdict: Verdict,
    ) -> Result<bool, ModerationError> {
        match self
            .store
            .put_verdict(submission.id, Transition::to_failed(from, reason.clone()), verdict)
            .await
        {
            Ok(_) => {
                tracing::warn!("Submission {} failed: {}", submission.id, reason);
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                tracing::warn!("Submission {} finalised concurrently: {}", submission.id, e);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fail_job(
        &self,
        submission: &Submission,
        from: SubmissionState,
        reason: String,
        verdict: Verdict,
    ) -> Result<JobOutcome, ModerationError> {
        if self.fail(submission, from, reason.clone(), verdict).await? {
            Ok(JobOutcome::Failed { reason })
        } else {
            Ok(skipped("finalised concurrently"))
        }
    }

    async fn stored_text_outcome(&self, id: SubmissionId) -> Result<TextOutcome, ModerationError> {
        let submission = self
            .store
            .get_submission(id)
            .await?
            .ok_or(StoreError::NotFound(id))?;

        if submission.state == SubmissionState::Completed {
            if let Some(record) = self.store.get_verdict(id).await? {
                return Ok(TextOutcome::Processed {
                    id,
                    verdict: record.verdict,
                    deduplicated: submission.verdict_source.is_some(),
                });
            }
        }

        Ok(TextOutcome::Failed {
            id,
            reason: submission
                .failure_reason
                .unwrap_or_else(|| format!("submission is {}", submission.state)),
        })
    }
}

fn unknown_from(err: &ClassifierError) -> Verdict {
    Verdict::unknown(err.to_string(), err.raw_output.clone().unwrap_or_default())
}

fn skipped(reason: impl Into<String>) -> JobOutcome {
    JobOutcome::Skipped {
        reason: reason.into(),
    }
}

// ============================================================================
// TESTS
// ============================================================================
