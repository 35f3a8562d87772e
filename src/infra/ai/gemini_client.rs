// =============================================================================
// GEMINI CLASSIFIER - Google AI Studio API Integration
// =============================================================================
//
// Implements the `Classifier` port against Google's Gemini API
// (https://ai.google.dev/gemini-api/docs).
//
// - Authentication: API key is passed as a query parameter (`?key=API_KEY`).
// - Text is sent as a plain text part; images are sent as an `inlineData`
//   part with base64 bytes and a mime type sniffed from the payload.
// - The classification instructions go in `systemInstruction`.
// - Response content is at `candidates[0].content.parts[*].text` and is
//   validated with `parse_verdict`.
//
// **Environment Variables:**
// - `GEMINI_API_KEY` - Your API key from https://aistudio.google.com/apikey

use super::request_error;
use crate::core::moderation::{
    parse_verdict, Classifier, ClassifierError, ContentType, Verdict, CLASSIFICATION_INSTRUCTIONS,
};
use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};

// =============================================================================
// REQUEST STRUCTURES
// =============================================================================
// See: https://ai.google.dev/api/generate-content

/// A single part of content. Gemini uses a "parts" array for multimodal
/// content, so a request carries either text or inline image data per part.
#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,

    /// Raw bytes (base64) for images.
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    /// Role: "user" or "model"
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<Part>,
}

/// Generation configuration options that control the model's output.
#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,

    /// Ask for JSON directly instead of prose.
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,

    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,

    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

// =============================================================================
// RESPONSE STRUCTURES
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,

    /// Why the model stopped generating (e.g., "STOP", "SAFETY").
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
    #[allow(dead_code)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorResponse {
    error: GeminiErrorDetail,
}

// =============================================================================
// GEMINI CLASSIFIER IMPLEMENTATION
// =============================================================================

pub struct GeminiClassifier {
    client: Client,
    api_key: String,
    model: String,
}

impl GeminiClassifier {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
        }
    }

    fn text_part(text: String) -> Part {
        Part {
            text: Some(text),
            inline_data: None,
        }
    }

    fn build_request(content_type: ContentType, content: &[u8]) -> GenerateContentRequest {
        let parts = match content_type {
            ContentType::Text => vec![Self::text_part(
                String::from_utf8_lossy(content).into_owned(),
            )],
            ContentType::Image => vec![
                Self::text_part("Classify this image.".to_string()),
                Part {
                    text: None,
                    inline_data: Some(InlineData {
                        mime_type: sniff_image_mime(content).to_string(),
                        data: base64::engine::general_purpose::STANDARD.encode(content),
                    }),
                },
            ],
        };

        GenerateContentRequest {
            contents: vec![Content {
                role: "user".to_string(),
                parts,
            }],
            system_instruction: Some(Content {
                role: "user".to_string(), // System instruction uses "user" role internally
                parts: vec![Self::text_part(CLASSIFICATION_INSTRUCTIONS.to_string())],
            }),
            generation_config: Some(GenerationConfig {
                temperature: Some(0.0),
                max_output_tokens: Some(256),
                response_mime_type: Some("application/json".to_string()),
            }),
        }
    }

    /// Joins the text parts of the first candidate.
    fn extract_text(
        response: GenerateContentResponse,
        raw: &str,
    ) -> Result<String, ClassifierError> {
        let candidate = response
            .candidates
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| {
                ClassifierError::malformed(
                    "No content in Gemini response - the model may have been blocked by safety filters",
                    raw,
                )
            })?;

        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(ClassifierError::malformed(
                format!(
                    "Empty Gemini response (finish reason: {})",
                    candidate.finish_reason.as_deref().unwrap_or("unknown")
                ),
                raw,
            ));
        }
        Ok(text)
    }
}

/// Picks a mime type from the leading magic bytes. Falls back to JPEG,
/// which Gemini accepts for most payloads.
fn sniff_image_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        "image/gif"
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

#[async_trait]
impl Classifier for GeminiClassifier {
    async fn classify(
        &self,
        content_type: ContentType,
        content: &[u8],
    ) -> Result<Verdict, ClassifierError> {
        // Format: https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );
        let request = Self::build_request(content_type, content);

        // Be careful not to log the API key!
        tracing::debug!(
            "Gemini request to model {}: {} content, {} bytes",
            self.model,
            content_type,
            content.len()
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| request_error("Gemini", e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| request_error("Gemini", e))?;

        if !status.is_success() {
            // Try to parse as Gemini error response for better error messages
            if let Ok(error_response) = serde_json::from_str::<GeminiErrorResponse>(&body) {
                return Err(ClassifierError::unavailable(format!(
                    "Gemini API error ({}): {}",
                    status, error_response.error.message
                )));
            }
            return Err(ClassifierError::unavailable(format!(
                "Gemini API error: {} - {}",
                status, body
            )));
        }

        let parsed: GenerateContentResponse = serde_json::from_str(&body).map_err(|e| {
            ClassifierError::malformed(format!("Unreadable Gemini response: {}", e), body.as_str())
        })?;
        let text = Self::extract_text(parsed, &body)?;

        tracing::debug!("Gemini response received: {} chars", text.len());
        parse_verdict(&text)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::moderation::{ClassifierErrorKind, Label};

    #[test]
    fn test_text_request_shape() {
        let request = GeminiClassifier::build_request(ContentType::Text, b"you are awful");
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["contents"][0]["parts"][0]["text"], "you are awful");
        assert!(json["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("toxic"));
        assert_eq!(
            json["generationConfig"]["responseMimeType"],
            "application/json"
        );
        assert!(json["generationConfig"].get("topK").is_none());
    }

    #[test]
    fn test_image_request_inlines_base64() {
        let png = b"\x89PNG\r\n\x1a\nrest";
        let request = GeminiClassifier::build_request(ContentType::Image, png);
        let json = serde_json::to_value(&request).unwrap();

        let inline = &json["contents"][0]["parts"][1]["inlineData"];
        assert_eq!(inline["mimeType"], "image/png");
        assert_eq!(
            inline["data"],
            base64::engine::general_purpose::STANDARD.encode(png)
        );
    }

    #[test]
    fn test_sniff_image_mime() {
        assert_eq!(sniff_image_mime(b"GIF89a...."), "image/gif");
        assert_eq!(sniff_image_mime(b"RIFF\0\0\0\0WEBPVP8 "), "image/webp");
        assert_eq!(sniff_image_mime(&[0xFF, 0xD8, 0xFF]), "image/jpeg");
    }

    #[test]
    fn test_extract_text_and_parse() {
        let body = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"{\"classification\":\"spam\",\"confidence\":88,\"reasoning\":\"ads\"}"}]},"finishReason":"STOP"}]}"#;
        let parsed: GenerateContentResponse = serde_json::from_str(body).unwrap();

        let text = GeminiClassifier::extract_text(parsed, body).unwrap();
        let verdict = parse_verdict(&text).unwrap();

        assert_eq!(verdict.label, Label::Spam);
        assert_eq!(verdict.confidence, 88);
    }

    #[test]
    fn test_blocked_response_is_malformed() {
        let body = r#"{"candidates":[{"finishReason":"SAFETY"}]}"#;
        let parsed: GenerateContentResponse = serde_json::from_str(body).unwrap();

        let err = GeminiClassifier::extract_text(parsed, body).unwrap_err();

        assert_eq!(err.kind, ClassifierErrorKind::MalformedResponse);
        assert!(err.message.contains("SAFETY"));
        assert_eq!(err.raw_output.as_deref(), Some(body));
    }

    #[test]
    fn test_no_candidates_is_malformed() {
        let parsed: GenerateContentResponse = serde_json::from_str("{}").unwrap();
        let err = GeminiClassifier::extract_text(parsed, "{}").unwrap_err();
        assert_eq!(err.kind, ClassifierErrorKind::MalformedResponse);
    }
}
