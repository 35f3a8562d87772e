// Intake commands - one JSON object per request, one per response.
//
// Requests are tagged by `op`, responses by `status`. Each outcome gets its
// own status so callers can tell "queued" from "classified" from "failed".

use crate::core::moderation::{
    Label, ModerationError, ModerationService, SubmissionId, SubmissionSummary, SummaryResult,
    TextOutcome,
};
use serde::{Deserialize, Serialize};

/// Longest identity we accept (the RFC 5321 address limit).
const MAX_IDENTITY_LEN: usize = 320;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IntakeRequest {
    SubmitText { identity: String, text: String },
    SubmitImage { identity: String, image_url: String },
    Summary { identity: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IntakeResponse {
    /// Text classified (or answered from an identical earlier submission).
    Processed {
        submission_id: SubmissionId,
        label: Label,
        confidence: u8,
        rationale: String,
        deduplicated: bool,
    },
    /// Text accepted, but classification failed.
    Failed {
        submission_id: SubmissionId,
        reason: String,
    },
    /// Image queued for background moderation.
    Accepted { submission_id: SubmissionId },
    /// Invalid request, or the submission could not be queued.
    Rejected {
        #[serde(skip_serializing_if = "Option::is_none")]
        submission_id: Option<SubmissionId>,
        reason: String,
    },
    Summary {
        identity: String,
        total: usize,
        submissions: Vec<SubmissionSummary>,
    },
    /// The identity has no submissions.
    Empty { identity: String },
    /// Storage or queue trouble unrelated to the request itself.
    Error { reason: String },
}

impl IntakeResponse {
    fn rejected(reason: impl Into<String>) -> Self {
        IntakeResponse::Rejected {
            submission_id: None,
            reason: reason.into(),
        }
    }
}

/// Checks that an identity is usable as a submitter key. Contents aren't
/// interpreted beyond that.
pub fn validate_identity(identity: &str) -> Result<&str, String> {
    let identity = identity.trim();
    if identity.is_empty() {
        return Err("identity must not be empty".to_string());
    }
    if identity.len() > MAX_IDENTITY_LEN {
        return Err(format!(
            "identity must be at most {} characters",
            MAX_IDENTITY_LEN
        ));
    }
    if identity.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("identity must not contain whitespace".to_string());
    }
    Ok(identity)
}

/// Parses one request line and runs it.
pub async fn handle_line(service: &ModerationService, line: &str) -> IntakeResponse {
    match serde_json::from_str::<IntakeRequest>(line) {
        Ok(request) => handle(service, request).await,
        Err(e) => IntakeResponse::rejected(format!("invalid request: {}", e)),
    }
}

pub async fn handle(service: &ModerationService, request: IntakeRequest) -> IntakeResponse {
    match request {
        IntakeRequest::SubmitText { identity, text } => {
            let identity = match validate_identity(&identity) {
                Ok(identity) => identity,
                Err(reason) => return IntakeResponse::rejected(reason),
            };
            if text.trim().is_empty() {
                return IntakeResponse::rejected("text must not be empty");
            }
            match service.submit_text(identity, &text).await {
                Ok(TextOutcome::Processed {
                    id,
                    verdict,
                    deduplicated,
                }) => IntakeResponse::Processed {
                    submission_id: id,
                    label: verdict.label,
                    confidence: verdict.confidence,
                    rationale: verdict.rationale,
                    deduplicated,
                },
                Ok(TextOutcome::Failed { id, reason }) => IntakeResponse::Failed {
                    submission_id: id,
                    reason,
                },
                Err(e) => internal_error(e),
            }
        }
        IntakeRequest::SubmitImage {
            identity,
            image_url,
        } => {
            let identity = match validate_identity(&identity) {
                Ok(identity) => identity,
                Err(reason) => return IntakeResponse::rejected(reason),
            };
            if image_url.trim().is_empty() {
                return IntakeResponse::rejected("image_url must not be empty");
            }
            match service.submit_image(identity, image_url.trim()).await {
                Ok(id) => IntakeResponse::Accepted { submission_id: id },
                Err(ModerationError::Rejected { id, source }) => IntakeResponse::Rejected {
                    submission_id: Some(id),
                    reason: source.to_string(),
                },
                Err(e) => internal_error(e),
            }
        }
        IntakeRequest::Summary { identity } => {
            let identity = match validate_identity(&identity) {
                Ok(identity) => identity,
                Err(reason) => return IntakeResponse::rejected(reason),
            };
            match service.get_summary(identity).await {
                Ok(SummaryResult::NoSubmissions { identity }) => IntakeResponse::Empty { identity },
                Ok(SummaryResult::Found {
                    identity,
                    total,
                    submissions,
                }) => IntakeResponse::Summary {
                    identity,
                    total,
                    submissions,
                },
                Err(e) => internal_error(e),
            }
        }
    }
}

fn internal_error(e: ModerationError) -> IntakeResponse {
    tracing::error!("Intake request failed: {}", e);
    IntakeResponse::Error {
        reason: e.to_string(),
    }
}
