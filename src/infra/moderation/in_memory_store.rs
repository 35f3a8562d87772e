// In-memory implementation of ModerationStore.
//
// Used for local runs (STORE_BACKEND=memory) and as the store in tests.
// Everything sits behind one RwLock so a state change and its verdict write
// are applied together, the same guarantee the SQLite store gets from a
// transaction.

use crate::core::moderation::{
    ContentType, Fingerprint, ModerationStore, NewSubmission, NotificationAttempt,
    NotificationOutcome, StoreError, Submission, SubmissionId, SubmissionState, Transition,
    Verdict, VerdictRecord,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct State {
    submissions: HashMap<SubmissionId, Submission>,
    /// Insertion order, so listings come back oldest first.
    order: Vec<SubmissionId>,
    verdicts: HashMap<SubmissionId, VerdictRecord>,
    notifications: Vec<NotificationAttempt>,
}

impl State {
    fn apply(&mut self, id: SubmissionId, transition: &Transition) -> Result<(), StoreError> {
        transition.validate()?;
        let submission = self
            .submissions
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        if submission.state != transition.from {
            return Err(StoreError::Conflict {
                id,
                expected: transition.from,
                actual: submission.state,
            });
        }
        submission.state = transition.to;
        if transition.failure_reason.is_some() {
            submission.failure_reason = transition.failure_reason.clone();
        }
        submission.updated_at = Utc::now();
        Ok(())
    }

    fn get(&self, id: SubmissionId) -> Result<Submission, StoreError> {
        self.submissions
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }
}

pub struct InMemoryModerationStore {
    state: RwLock<State>,
}

impl InMemoryModerationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for InMemoryModerationStore {
    fn default() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }
}

#[async_trait]
impl ModerationStore for InMemoryModerationStore {
    async fn create_submission(&self, new: NewSubmission) -> Result<Submission, StoreError> {
        let now = Utc::now();
        let submission = Submission {
            id: Uuid::new_v4(),
            content_type: new.content_type,
            fingerprint: new.fingerprint,
            submitter: new.submitter,
            source: new.source,
            state: new.state,
            verdict_source: new.verdict_source,
            failure_reason: None,
            recovery_attempts: 0,
            created_at: now,
            updated_at: now,
        };
        let mut state = self.state.write().await;
        state.order.push(submission.id);
        state.submissions.insert(submission.id, submission.clone());
        Ok(submission)
    }

    async fn get_submission(&self, id: SubmissionId) -> Result<Option<Submission>, StoreError> {
        Ok(self.state.read().await.submissions.get(&id).cloned())
    }

    async fn transition_state(
        &self,
        id: SubmissionId,
        transition: Transition,
    ) -> Result<Submission, StoreError> {
        let mut state = self.state.write().await;
        state.apply(id, &transition)?;
        state.get(id)
    }

    async fn record_fingerprint(
        &self,
        id: SubmissionId,
        fingerprint: &Fingerprint,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let submission = state
            .submissions
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        submission.fingerprint = Some(fingerprint.clone());
        submission.updated_at = Utc::now();
        Ok(())
    }

    async fn put_verdict(
        &self,
        id: SubmissionId,
        transition: Transition,
        verdict: Verdict,
    ) -> Result<Submission, StoreError> {
        let mut state = self.state.write().await;
        state.apply(id, &transition)?;
        state.verdicts.insert(
            id,
            VerdictRecord {
                submission_id: id,
                verdict,
                recorded_at: Utc::now(),
            },
        );
        state.get(id)
    }

    async fn reuse_verdict(
        &self,
        id: SubmissionId,
        transition: Transition,
        original: SubmissionId,
    ) -> Result<Submission, StoreError> {
        let mut state = self.state.write().await;
        if !state.verdicts.contains_key(&original) {
            return Err(StoreError::NotFound(original));
        }
        state.apply(id, &transition)?;
        if let Some(submission) = state.submissions.get_mut(&id) {
            submission.verdict_source = Some(original);
        }
        state.get(id)
    }

    async fn get_verdict(&self, id: SubmissionId) -> Result<Option<VerdictRecord>, StoreError> {
        let state = self.state.read().await;
        let owner = state
            .submissions
            .get(&id)
            .and_then(|s| s.verdict_source)
            .unwrap_or(id);
        Ok(state.verdicts.get(&owner).cloned())
    }

    async fn put_notification_attempt(
        &self,
        attempt: NotificationAttempt,
    ) -> Result<NotificationAttempt, StoreError> {
        let mut state = self.state.write().await;
        if attempt.outcome == NotificationOutcome::Sent
            && state.notifications.iter().any(|a| {
                a.submission_id == attempt.submission_id && a.outcome == NotificationOutcome::Sent
            })
        {
            return Err(StoreError::AlreadyNotified(attempt.submission_id));
        }
        state.notifications.push(attempt.clone());
        Ok(attempt)
    }

    async fn find_sent_notification(
        &self,
        id: SubmissionId,
    ) -> Result<Option<NotificationAttempt>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .notifications
            .iter()
            .find(|a| a.submission_id == id && a.outcome == NotificationOutcome::Sent)
            .cloned())
    }

    async fn list_notification_attempts(
        &self,
        id: SubmissionId,
    ) -> Result<Vec<NotificationAttempt>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .notifications
            .iter()
            .filter(|a| a.submission_id == id)
            .cloned()
            .collect())
    }

    async fn find_by_fingerprint(
        &self,
        content_type: ContentType,
        fingerprint: &Fingerprint,
        state_filter: SubmissionState,
    ) -> Result<Option<Submission>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.submissions.get(id))
            .find(|s| {
                s.content_type == content_type
                    && s.state == state_filter
                    && s.fingerprint.as_ref() == Some(fingerprint)
            })
            .cloned())
    }

    async fn list_by_submitter(&self, identity: &str) -> Result<Vec<Submission>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.submissions.get(id))
            .filter(|s| s.submitter == identity)
            .cloned()
            .collect())
    }

    async fn list_by_state(
        &self,
        state_filter: SubmissionState,
    ) -> Result<Vec<Submission>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.submissions.get(id))
            .filter(|s| s.state == state_filter)
            .cloned()
            .collect())
    }

    async fn mark_recovery_attempt(
        &self,
        id: SubmissionId,
        expected: SubmissionState,
    ) -> Result<Submission, StoreError> {
        let mut state = self.state.write().await;
        let submission = state
            .submissions
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        if submission.state != expected {
            return Err(StoreError::Conflict {
                id,
                expected,
                actual: submission.state,
            });
        }
        submission.recovery_attempts += 1;
        submission.updated_at = Utc::now();
        Ok(submission.clone())
    }
}
