// Moderation store port - the single source of truth for submissions,
// verdicts and notification attempts.
//
// Every state change is a compare-and-set on `state`. Writes that touch the
// verdict and the state together happen atomically so concurrent recovery and
// normal processing can't both win.

use super::fingerprint::Fingerprint;
use super::moderation_models::{
    ContentType, NewSubmission, NotificationAttempt, Submission, SubmissionId, SubmissionState,
    Verdict, VerdictRecord,
};
use async_trait::async_trait;
use thiserror::Error;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    /// The submission was not in the expected state. Re-read before retrying.
    #[error("State conflict on {id}: expected {expected}, found {actual}")]
    Conflict {
        id: SubmissionId,
        expected: SubmissionState,
        actual: SubmissionState,
    },

    #[error("Invalid transition {from} -> {to}")]
    InvalidTransition {
        from: SubmissionState,
        to: SubmissionState,
    },

    #[error("Submission not found: {0}")]
    NotFound(SubmissionId),

    /// A `Sent` attempt already exists for the submission.
    #[error("Notification already sent for {0}")]
    AlreadyNotified(SubmissionId),

    #[error("Storage error: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// A compare-and-set state change.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: SubmissionState,
    pub to: SubmissionState,
    /// Recorded when `to` is `Failed`.
    pub failure_reason: Option<String>,
}

impl Transition {
    pub fn new(from: SubmissionState, to: SubmissionState) -> Self {
        Self {
            from,
            to,
            failure_reason: None,
        }
    }

    pub fn to_failed(from: SubmissionState, reason: impl Into<String>) -> Self {
        Self {
            from,
            to: SubmissionState::Failed,
            failure_reason: Some(reason.into()),
        }
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.from.can_transition_to(self.to) {
            Ok(())
        } else {
            Err(StoreError::InvalidTransition {
                from: self.from,
                to: self.to,
            })
        }
    }
}

// ============================================================================
// STORAGE TRAIT (PORT)
// ============================================================================

#[async_trait]
pub trait ModerationStore: Send + Sync {
    async fn create_submission(&self, new: NewSubmission) -> Result<Submission, StoreError>;

    async fn get_submission(&self, id: SubmissionId) -> Result<Option<Submission>, StoreError>;

    /// Moves a submission between states. Fails with `Conflict` if the
    /// current state isn't `transition.from`.
    async fn transition_state(
        &self,
        id: SubmissionId,
        transition: Transition,
    ) -> Result<Submission, StoreError>;

    /// Records the fingerprint of downloaded content.
    async fn record_fingerprint(
        &self,
        id: SubmissionId,
        fingerprint: &Fingerprint,
    ) -> Result<(), StoreError>;

    /// Writes (or replaces) the submission's verdict and applies the
    /// transition in one atomic step.
    async fn put_verdict(
        &self,
        id: SubmissionId,
        transition: Transition,
        verdict: Verdict,
    ) -> Result<Submission, StoreError>;

    /// Points the submission at the verdict of `original` and applies the
    /// transition in one atomic step. Used by the dedup short-circuit.
    async fn reuse_verdict(
        &self,
        id: SubmissionId,
        transition: Transition,
        original: SubmissionId,
    ) -> Result<Submission, StoreError>;

    /// The authoritative verdict, following dedup links.
    async fn get_verdict(&self, id: SubmissionId) -> Result<Option<VerdictRecord>, StoreError>;

    /// Records a notification attempt. Fails with `AlreadyNotified` if the
    /// attempt is `Sent` and a `Sent` attempt already exists.
    async fn put_notification_attempt(
        &self,
        attempt: NotificationAttempt,
    ) -> Result<NotificationAttempt, StoreError>;

    async fn find_sent_notification(
        &self,
        id: SubmissionId,
    ) -> Result<Option<NotificationAttempt>, StoreError>;

    async fn list_notification_attempts(
        &self,
        id: SubmissionId,
    ) -> Result<Vec<NotificationAttempt>, StoreError>;

    /// Oldest submission with the given content type, fingerprint and state.
    async fn find_by_fingerprint(
        &self,
        content_type: ContentType,
        fingerprint: &Fingerprint,
        state: SubmissionState,
    ) -> Result<Option<Submission>, StoreError>;

    /// All submissions by one submitter, oldest first.
    async fn list_by_submitter(&self, identity: &str) -> Result<Vec<Submission>, StoreError>;

    async fn list_by_state(&self, state: SubmissionState) -> Result<Vec<Submission>, StoreError>;

    /// Bumps `recovery_attempts` (and `updated_at`) if the submission is
    /// still in `expected`.
    async fn mark_recovery_attempt(
        &self,
        id: SubmissionId,
        expected: SubmissionState,
    ) -> Result<Submission, StoreError>;
}
