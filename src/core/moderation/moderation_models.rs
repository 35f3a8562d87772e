// Moderation domain models - submissions, verdicts and notification records.
//
// These are pure domain types with no storage or transport dependencies.
// The infra layer maps them to SQL rows and API payloads.

use super::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::retry::RetryPolicy;

pub type SubmissionId = Uuid;

/// Kind of content carried by a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Image,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Image => "image",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(ContentType::Text),
            "image" => Some(ContentType::Image),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a submission.
///
/// Transitions only move forward: `Pending -> Processing -> {Completed, Failed}`.
/// A dedup short-circuit may move `Pending` straight to `Completed`, and a
/// download failure may move `Pending` straight to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SubmissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionState::Pending => "pending",
            SubmissionState::Processing => "processing",
            SubmissionState::Completed => "completed",
            SubmissionState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(SubmissionState::Pending),
            "processing" => Some(SubmissionState::Processing),
            "completed" => Some(SubmissionState::Completed),
            "failed" => Some(SubmissionState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubmissionState::Completed | SubmissionState::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: SubmissionState) -> bool {
        use SubmissionState::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }
}

impl std::fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One user-initiated moderation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub content_type: ContentType,
    /// Unknown for images until the download succeeds.
    pub fingerprint: Option<Fingerprint>,
    pub submitter: String,
    /// Text body for text submissions, image URL for image submissions.
    /// Kept so recovery can re-run classification after a crash.
    pub source: String,
    pub state: SubmissionState,
    /// Set when the verdict was reused from an earlier submission.
    pub verdict_source: Option<SubmissionId>,
    pub failure_reason: Option<String>,
    pub recovery_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Data needed to create a submission row.
#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub content_type: ContentType,
    pub fingerprint: Option<Fingerprint>,
    pub submitter: String,
    pub source: String,
    pub state: SubmissionState,
    pub verdict_source: Option<SubmissionId>,
}

impl NewSubmission {
    pub fn pending(
        content_type: ContentType,
        submitter: &str,
        source: &str,
        fingerprint: Option<Fingerprint>,
    ) -> Self {
        Self {
            content_type,
            fingerprint,
            submitter: submitter.to_string(),
            source: source.to_string(),
            state: SubmissionState::Pending,
            verdict_source: None,
        }
    }

    /// A submission born `Completed`, sharing the verdict of `original`.
    pub fn deduplicated(
        content_type: ContentType,
        submitter: &str,
        source: &str,
        fingerprint: Fingerprint,
        original: SubmissionId,
    ) -> Self {
        Self {
            content_type,
            fingerprint: Some(fingerprint),
            submitter: submitter.to_string(),
            source: source.to_string(),
            state: SubmissionState::Completed,
            verdict_source: Some(original),
        }
    }
}

/// Closed classification set.
///
/// `Unknown` is produced when the classifier fails or its output can't be
/// validated. It is never treated as `Safe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Safe,
    Toxic,
    Spam,
    Harassment,
    Unknown,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Safe => "safe",
            Label::Toxic => "toxic",
            Label::Spam => "spam",
            Label::Harassment => "harassment",
            Label::Unknown => "unknown",
        }
    }

    /// Parses a stored label. Anything unrecognised maps to `Unknown`.
    pub fn from_stored(value: &str) -> Self {
        match value {
            "safe" => Label::Safe,
            "toxic" => Label::Toxic,
            "spam" => Label::Spam,
            "harassment" => Label::Harassment,
            _ => Label::Unknown,
        }
    }

    /// Parses a label produced by a classifier backend.
    ///
    /// Backends must pick one of the four concrete labels; `unknown` and any
    /// other value is rejected so the caller can treat the output as malformed.
    pub fn from_backend(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "safe" => Some(Label::Safe),
            "toxic" => Some(Label::Toxic),
            "spam" => Some(Label::Spam),
            "harassment" => Some(Label::Harassment),
            _ => None,
        }
    }

    /// Notifications fire only for concrete, non-safe labels.
    pub fn warrants_notification(&self) -> bool {
        !matches!(self, Label::Safe | Label::Unknown)
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of classifying one piece of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub label: Label,
    /// 0-100. Only meaningful when `label != Unknown`.
    pub confidence: u8,
    pub rationale: String,
    pub raw_backend_output: String,
}

impl Verdict {
    /// Sentinel verdict recorded for failed submissions.
    pub fn unknown(rationale: impl Into<String>, raw_backend_output: impl Into<String>) -> Self {
        Self {
            label: Label::Unknown,
            confidence: 0,
            rationale: rationale.into(),
            raw_backend_output: raw_backend_output.into(),
        }
    }
}

/// Authoritative verdict for a submission, as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct VerdictRecord {
    /// The submission that owns the verdict row. For deduplicated submissions
    /// this is the original submission.
    pub submission_id: SubmissionId,
    pub verdict: Verdict,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationOutcome {
    Sent,
    Suppressed,
    Failed,
}

impl NotificationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationOutcome::Sent => "sent",
            NotificationOutcome::Suppressed => "suppressed",
            NotificationOutcome::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sent" => Some(NotificationOutcome::Sent),
            "suppressed" => Some(NotificationOutcome::Suppressed),
            "failed" => Some(NotificationOutcome::Failed),
            _ => None,
        }
    }
}

/// Record of a decision to notify (or not).
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationAttempt {
    pub submission_id: SubmissionId,
    pub channel: String,
    pub outcome: NotificationOutcome,
    /// Why the attempt was suppressed or failed.
    pub detail: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// One row of the per-submitter summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionSummary {
    pub id: SubmissionId,
    pub content_type: ContentType,
    pub state: SubmissionState,
}

/// Read-only projection returned by `get_summary`.
#[derive(Debug, Clone, PartialEq)]
pub enum SummaryResult {
    /// The identity has never submitted anything. Not an error.
    NoSubmissions { identity: String },
    Found {
        identity: String,
        total: usize,
        submissions: Vec<SubmissionSummary>,
    },
}

/// Result of a synchronous text submission.
#[derive(Debug, Clone, PartialEq)]
pub enum TextOutcome {
    /// Classified (or deduplicated) and completed.
    Processed {
        id: SubmissionId,
        verdict: Verdict,
        deduplicated: bool,
    },
    /// Accepted but the classifier failed; the submission is `Failed`.
    Failed { id: SubmissionId, reason: String },
}

impl TextOutcome {
    pub fn id(&self) -> SubmissionId {
        match self {
            TextOutcome::Processed { id, .. } | TextOutcome::Failed { id, .. } => *id,
        }
    }
}

/// What a worker did with one job delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Label),
    Deduplicated { original: SubmissionId },
    Failed { reason: String },
    /// Nothing to do: already terminal, owned by another worker, or gone.
    Skipped { reason: String },
}

/// Tunables for the orchestrator.
#[derive(Debug, Clone)]
pub struct ModerationConfig {
    /// Deadline for a single classify call.
    pub classify_timeout: Duration,
    /// Worker-side retry policy for downloads and classification.
    pub retry: RetryPolicy,
    /// How long a submission may sit in `Pending`/`Processing` without a
    /// queued job before recovery treats it as abandoned.
    pub stale_after: Duration,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            classify_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            stale_after: Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_only_moves_forward() {
        use SubmissionState::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Completed));
    }

    #[test]
    fn test_backend_labels_are_validated() {
        assert_eq!(Label::from_backend(" Toxic "), Some(Label::Toxic));
        assert_eq!(Label::from_backend("HARASSMENT"), Some(Label::Harassment));
        assert_eq!(Label::from_backend("unknown"), None);
        assert_eq!(Label::from_backend("offensive"), None);
        assert_eq!(Label::from_stored("garbage"), Label::Unknown);
    }

    #[test]
    fn test_notification_policy() {
        assert!(Label::Toxic.warrants_notification());
        assert!(Label::Spam.warrants_notification());
        assert!(Label::Harassment.warrants_notification());
        assert!(!Label::Safe.warrants_notification());
        assert!(!Label::Unknown.warrants_notification());
    }
}
