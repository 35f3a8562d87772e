use super::request_error;
use crate::core::moderation::{
    parse_verdict, Classifier, ClassifierError, ContentType, Verdict, CLASSIFICATION_INSTRUCTIONS,
};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

/// Text classifier backed by any chat model on OpenRouter.
pub struct OpenRouterClassifier {
    client: Client,
    api_key: String,
    model: String,
}

impl OpenRouterClassifier {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
        }
    }

    fn build_payload(&self, text: &str) -> serde_json::Value {
        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": CLASSIFICATION_INSTRUCTIONS },
                { "role": "user", "content": text },
            ],
            "temperature": 0.0,
            "max_tokens": 256,
        })
    }

    fn extract_content(
        response_json: &serde_json::Value,
        raw: &str,
    ) -> Result<String, ClassifierError> {
        response_json["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ClassifierError::malformed("Failed to parse response content", raw))
    }
}

#[async_trait]
impl Classifier for OpenRouterClassifier {
    async fn classify(
        &self,
        content_type: ContentType,
        content: &[u8],
    ) -> Result<Verdict, ClassifierError> {
        if content_type != ContentType::Text {
            return Err(ClassifierError::unavailable(
                "OpenRouter classifier only handles text",
            ));
        }
        let url = "https://openrouter.ai/api/v1/chat/completions";
        let payload = self.build_payload(&String::from_utf8_lossy(content));

        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| request_error("OpenRouter", e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| request_error("OpenRouter", e))?;
        if !status.is_success() {
            return Err(ClassifierError::unavailable(format!(
                "OpenRouter API error: {} - {}",
                status, text
            )));
        }

        let response_json: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            ClassifierError::malformed(
                format!("Unreadable OpenRouter response: {}", e),
                text.as_str(),
            )
        })?;
        let content = Self::extract_content(&response_json, &text)?;

        parse_verdict(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::moderation::{ClassifierErrorKind, Label};

    #[test]
    fn test_payload_carries_instructions_and_text() {
        let client = OpenRouterClassifier::new("key".to_string(), "some/model".to_string());
        let payload = client.build_payload("buy cheap pills");

        assert_eq!(payload["model"], "some/model");
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["messages"][1]["content"], "buy cheap pills");
    }

    #[test]
    fn test_extract_content() {
        let json = json!({
            "choices": [{ "message": { "content": "{\"classification\":\"harassment\",\"confidence\":\"75%\"}" } }]
        });
        let content = OpenRouterClassifier::extract_content(&json, "").unwrap();
        let verdict = parse_verdict(&content).unwrap();
        assert_eq!(verdict.label, Label::Harassment);
        assert_eq!(verdict.confidence, 75);
    }

    #[test]
    fn test_missing_choices_is_malformed() {
        let err = OpenRouterClassifier::extract_content(&json!({}), "{}").unwrap_err();
        assert_eq!(err.kind, ClassifierErrorKind::MalformedResponse);
    }

    #[tokio::test]
    async fn test_images_are_refused() {
        let client = OpenRouterClassifier::new("key".to_string(), "some/model".to_string());
        let err = client.classify(ContentType::Image, b"png").await.unwrap_err();
        assert_eq!(err.kind, ClassifierErrorKind::BackendUnavailable);
    }
}
