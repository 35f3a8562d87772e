// E-mails the submitter through Brevo's transactional API.
// See: https://developers.brevo.com/reference/sendtransacemail

use super::alert_text;
use crate::core::moderation::{Label, NotificationTransport, NotifyError};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct EmailAddress {
    email: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendEmailRequest {
    sender: EmailAddress,
    to: Vec<EmailAddress>,
    subject: String,
    text_content: String,
}

pub struct BrevoEmailTransport {
    client: Client,
    api_key: String,
    sender_email: String,
}

impl BrevoEmailTransport {
    pub fn new(api_key: String, sender_email: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            sender_email,
        }
    }

    fn build_request(&self, identity: &str, label: Label, rationale: &str) -> SendEmailRequest {
        SendEmailRequest {
            sender: EmailAddress {
                email: self.sender_email.clone(),
            },
            to: vec![EmailAddress {
                email: identity.to_string(),
            }],
            subject: format!("Your submission was flagged as {}", label),
            text_content: alert_text(identity, label, rationale),
        }
    }
}

#[async_trait]
impl NotificationTransport for BrevoEmailTransport {
    fn channel(&self) -> &str {
        "email"
    }

    async fn send(&self, identity: &str, label: Label, rationale: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post("https://api.brevo.com/v3/smtp/email")
            .header("api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&self.build_request(identity, label, rationale))
            .send()
            .await
            .map_err(|e| NotifyError(format!("Brevo request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(NotifyError(format!("Brevo API error: {} - {}", status, text)));
        }
        Ok(())
    }
}
