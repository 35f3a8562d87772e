// Notification gate - decides whether a verdict warrants an alert, sends it at
// most once per submission, and records every attempt.

use super::moderation_models::{
    Label, NotificationAttempt, NotificationOutcome, Submission, Verdict,
};
use super::moderation_store::{ModerationStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Notification transport error: {0}")]
pub struct NotifyError(pub String);

/// Delivery channel for alerts (Slack, e-mail, ...).
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    /// Identifier stored on each attempt.
    fn channel(&self) -> &str;

    async fn send(&self, identity: &str, label: Label, rationale: &str) -> Result<(), NotifyError>;
}

pub struct NotificationGate {
    store: Arc<dyn ModerationStore>,
    transport: Arc<dyn NotificationTransport>,
}

impl NotificationGate {
    pub fn new(store: Arc<dyn ModerationStore>, transport: Arc<dyn NotificationTransport>) -> Self {
        Self { store, transport }
    }

    /// Returns `None` when the label doesn't warrant a notification; no
    /// attempt is recorded in that case.
    ///
    /// Transport failures are recorded as `Failed` and not retried here.
    pub async fn maybe_notify(
        &self,
        submission: &Submission,
        verdict: &Verdict,
    ) -> Result<Option<NotificationAttempt>, StoreError> {
        if !verdict.label.warrants_notification() {
            return Ok(None);
        }

        if self.store.find_sent_notification(submission.id).await?.is_some() {
            tracing::info!(
                "Notification for submission {} already sent, suppressing",
                submission.id
            );
            return self.record_suppressed(submission).await.map(Some);
        }

        let attempt = match self
            .transport
            .send(&submission.submitter, verdict.label, &verdict.rationale)
            .await
        {
            Ok(()) => self.attempt(submission, NotificationOutcome::Sent, None),
            Err(e) => {
                tracing::warn!(
                    "Notification for submission {} via {} failed: {}",
                    submission.id,
                    self.transport.channel(),
                    e
                );
                self.attempt(submission, NotificationOutcome::Failed, Some(e.0))
            }
        };

        match self.store.put_notification_attempt(attempt).await {
            Ok(recorded) => {
                if recorded.outcome == NotificationOutcome::Sent {
                    tracing::info!(
                        "Notified {} about submission {} ({})",
                        submission.submitter,
                        submission.id,
                        verdict.label
                    );
                }
                Ok(Some(recorded))
            }
            // Another writer recorded a Sent attempt between our check and our write.
            Err(StoreError::AlreadyNotified(_)) => {
                self.record_suppressed(submission).await.map(Some)
            }
            Err(e) => Err(e),
        }
    }

    async fn record_suppressed(
        &self,
        submission: &Submission,
    ) -> Result<NotificationAttempt, StoreError> {
        let attempt = self.attempt(
            submission,
            NotificationOutcome::Suppressed,
            Some("already sent".to_string()),
        );
        self.store.put_notification_attempt(attempt).await
    }

    fn attempt(
        &self,
        submission: &Submission,
        outcome: NotificationOutcome,
        detail: Option<String>,
    ) -> NotificationAttempt {
        NotificationAttempt {
            submission_id: submission.id,
            channel: self.transport.channel().to_string(),
            outcome,
            detail,
            sent_at: Utc::now(),
        }
    }
}
