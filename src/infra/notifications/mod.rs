// Notification transports used by the notification gate.

pub mod brevo_email;
pub mod log_transport;
pub mod slack_webhook;

pub use brevo_email::BrevoEmailTransport;
pub use log_transport::LogTransport;
pub use slack_webhook::SlackWebhookTransport;

use crate::core::moderation::Label;

fn alert_text(identity: &str, label: Label, rationale: &str) -> String {
    let mut text = format!(
        "Inappropriate content detected ({}) from {}",
        label, identity
    );
    if !rationale.is_empty() {
        text.push_str(&format!("\nReasoning: {}", rationale));
    }
    text
}
