// Classifier port - anything that can turn raw content into a verdict.
//
// The orchestrator only sees this trait. Vendor clients live in infra/ai and
// are routed per content type by `ClassifierRouter`.

use super::moderation_models::{ContentType, Label, Verdict};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierErrorKind {
    Timeout,
    BackendUnavailable,
    MalformedResponse,
}

/// Classifier failure. All kinds are transient; the adapter never retries.
#[derive(Debug, Clone, Error)]
#[error("Classifier {kind:?}: {message}")]
pub struct ClassifierError {
    pub kind: ClassifierErrorKind,
    pub message: String,
    /// Whatever the backend returned, kept for the audit trail.
    pub raw_output: Option<String>,
}

impl ClassifierError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ClassifierErrorKind::Timeout,
            message: message.into(),
            raw_output: None,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            kind: ClassifierErrorKind::BackendUnavailable,
            message: message.into(),
            raw_output: None,
        }
    }

    pub fn malformed(message: impl Into<String>, raw_output: impl Into<String>) -> Self {
        Self {
            kind: ClassifierErrorKind::MalformedResponse,
            message: message.into(),
            raw_output: Some(raw_output.into()),
        }
    }

    pub fn is_transient(&self) -> bool {
        true
    }
}

// ============================================================================
// CLASSIFIER TRAIT (PORT)
// ============================================================================

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classifies raw content. Text arrives UTF-8 encoded, images as the
    /// downloaded binary payload.
    async fn classify(
        &self,
        content_type: ContentType,
        content: &[u8],
    ) -> Result<Verdict, ClassifierError>;
}

/// Dispatches to a dedicated backend per content type.
pub struct ClassifierRouter {
    text: Arc<dyn Classifier>,
    image: Arc<dyn Classifier>,
}

impl ClassifierRouter {
    pub fn new(text: Arc<dyn Classifier>, image: Arc<dyn Classifier>) -> Self {
        Self { text, image }
    }
}

#[async_trait]
impl Classifier for ClassifierRouter {
    async fn classify(
        &self,
        content_type: ContentType,
        content: &[u8],
    ) -> Result<Verdict, ClassifierError> {
        match content_type {
            ContentType::Text => self.text.classify(content_type, content).await,
            ContentType::Image => self.image.classify(content_type, content).await,
        }
    }
}

// ============================================================================
// OUTPUT VALIDATION
// ============================================================================

/// Instruction shared by all LLM backends so their output can be validated
/// the same way.
pub const CLASSIFICATION_INSTRUCTIONS: &str = "Classify the content as exactly one of: \
toxic, spam, harassment, safe. Provide a confidence score from 0 to 100 and a brief \
reasoning. Respond with a single JSON object and nothing else, shaped like \
{\"classification\": \"safe\", \"confidence\": 95, \"reasoning\": \"...\"}.";

#[derive(Debug, Deserialize)]
struct RawClassification {
    classification: String,
    confidence: serde_json::Value,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Validates model output against the closed label set.
///
/// Accepts a bare JSON object or one wrapped in a markdown code fence. Any
/// output that doesn't parse, names a label outside the set, or lacks a
/// numeric confidence is a `MalformedResponse` - it never defaults to `Safe`.
pub fn parse_verdict(raw: &str) -> Result<Verdict, ClassifierError> {
    let json = extract_json_object(raw)
        .ok_or_else(|| ClassifierError::malformed("no JSON object in response", raw))?;

    let parsed: RawClassification = serde_json::from_str(json)
        .map_err(|e| ClassifierError::malformed(format!("invalid JSON: {}", e), raw))?;

    let label = Label::from_backend(&parsed.classification).ok_or_else(|| {
        ClassifierError::malformed(
            format!("label '{}' is not in the closed set", parsed.classification),
            raw,
        )
    })?;

    let confidence = match &parsed.confidence {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok(),
        _ => None,
    }
    .filter(|c| c.is_finite())
    .ok_or_else(|| ClassifierError::malformed("confidence is not a number", raw))?;

    Ok(Verdict {
        label,
        confidence: confidence.round().clamp(0.0, 100.0) as u8,
        rationale: parsed.reasoning.unwrap_or_default().trim().to_string(),
        raw_backend_output: raw.to_string(),
    })
}

fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end > start {
        Some(&raw[start..=end])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let verdict = parse_verdict(
            r#"{"classification": "toxic", "confidence": 80, "reasoning": "insults"}"#,
        )
        .unwrap();
        assert_eq!(verdict.label, Label::Toxic);
        assert_eq!(verdict.confidence, 80);
        assert_eq!(verdict.rationale, "insults");
    }

    #[test]
    fn test_parse_fenced_json() {
        let raw = "```json\n{\"classification\": \"Safe\", \"confidence\": \"99%\"}\n```";
        let verdict = parse_verdict(raw).unwrap();
        assert_eq!(verdict.label, Label::Safe);
        assert_eq!(verdict.confidence, 99);
        assert_eq!(verdict.rationale, "");
        assert_eq!(verdict.raw_backend_output, raw);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let verdict =
            parse_verdict(r#"{"classification": "spam", "confidence": 140.4}"#).unwrap();
        assert_eq!(verdict.confidence, 100);
    }

    #[test]
    fn test_unlisted_label_is_malformed() {
        let err = parse_verdict(r#"{"classification": "offensive", "confidence": 70}"#)
            .unwrap_err();
        assert_eq!(err.kind, ClassifierErrorKind::MalformedResponse);
        assert!(err.raw_output.is_some());
    }

    #[test]
    fn test_prose_is_malformed() {
        let err = parse_verdict("Image analyzed for inappropriate content.").unwrap_err();
        assert_eq!(err.kind, ClassifierErrorKind::MalformedResponse);
    }

    #[test]
    fn test_missing_confidence_is_malformed() {
        let err = parse_verdict(r#"{"classification": "safe", "confidence": null}"#).unwrap_err();
        assert_eq!(err.kind, ClassifierErrorKind::MalformedResponse);
    }
}
