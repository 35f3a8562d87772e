use super::alert_text;
use crate::core::moderation::{Label, NotificationTransport, NotifyError};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

/// Posts alerts to a Slack incoming webhook.
pub struct SlackWebhookTransport {
    client: Client,
    webhook_url: String,
}

impl SlackWebhookTransport {
    pub fn new(webhook_url: String) -> Self {
        Self {
            client: Client::new(),
            webhook_url,
        }
    }

    fn payload(identity: &str, label: Label, rationale: &str) -> serde_json::Value {
        json!({ "text": format!(":warning: {}", alert_text(identity, label, rationale)) })
    }
}

#[async_trait]
impl NotificationTransport for SlackWebhookTransport {
    fn channel(&self) -> &str {
        "slack"
    }

    async fn send(&self, identity: &str, label: Label, rationale: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&Self::payload(identity, label, rationale))
            .send()
            .await
            .map_err(|e| NotifyError(format!("Slack request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(NotifyError(format!("Slack webhook error: {} - {}", status, text)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_mentions_label_and_identity() {
        let payload = SlackWebhookTransport::payload("a@example.com", Label::Spam, "ads");
        let text = payload["text"].as_str().unwrap();
        assert!(text.contains("spam"));
        assert!(text.contains("a@example.com"));
        assert!(text.contains("Reasoning: ads"));
    }
}
