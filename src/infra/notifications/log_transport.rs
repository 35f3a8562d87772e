use super::alert_text;
use crate::core::moderation::{Label, NotificationTransport, NotifyError};
use async_trait::async_trait;

/// Writes alerts to the log instead of delivering them. For local runs.
pub struct LogTransport;

#[async_trait]
impl NotificationTransport for LogTransport {
    fn channel(&self) -> &str {
        "log"
    }

    async fn send(&self, identity: &str, label: Label, rationale: &str) -> Result<(), NotifyError> {
        tracing::warn!("{}", alert_text(identity, label, rationale));
        Ok(())
    }
}
