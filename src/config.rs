// Runtime configuration, read once from the environment at startup.
//
// Every knob has a default except the API keys a chosen backend needs.

use anyhow::{anyhow, bail, Context};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextClassifier {
    Gemini,
    OpenRouter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyChannel {
    Log,
    Slack { webhook_url: String },
    Email { api_key: String, sender: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: String,
    pub store_backend: Backend,
    pub queue_backend: Backend,
    pub gemini_api_key: String,
    pub gemini_text_model: String,
    pub gemini_image_model: String,
    pub text_classifier: TextClassifier,
    pub openrouter_api_key: Option<String>,
    pub openrouter_model: String,
    pub classify_timeout: Duration,
    pub download_timeout: Duration,
    pub max_image_bytes: usize,
    pub worker_count: usize,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub stale_processing: Duration,
    pub recovery_interval: Duration,
    pub job_lease: Duration,
    pub notify: NotifyChannel,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup, so tests don't touch the
    /// process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let store_backend = parse_backend("STORE_BACKEND", var("STORE_BACKEND"))?;
        let queue_backend = parse_backend("QUEUE_BACKEND", var("QUEUE_BACKEND"))?;

        let text_classifier = match var("TEXT_CLASSIFIER").as_deref() {
            None | Some("gemini") => TextClassifier::Gemini,
            Some("openrouter") => TextClassifier::OpenRouter,
            Some(other) => bail!(
                "TEXT_CLASSIFIER must be 'gemini' or 'openrouter', got '{}'",
                other
            ),
        };

        // Images always go to Gemini, so its key is always required.
        let gemini_api_key = var("GEMINI_API_KEY")
            .ok_or_else(|| anyhow!("Missing GEMINI_API_KEY environment variable!"))?;
        let openrouter_api_key = var("OPENROUTER_API_KEY");
        if text_classifier == TextClassifier::OpenRouter && openrouter_api_key.is_none() {
            bail!("TEXT_CLASSIFIER=openrouter needs OPENROUTER_API_KEY");
        }

        let notify = match var("NOTIFY_CHANNEL").as_deref() {
            None | Some("log") => NotifyChannel::Log,
            Some("slack") => NotifyChannel::Slack {
                webhook_url: var("SLACK_WEBHOOK_URL")
                    .ok_or_else(|| anyhow!("NOTIFY_CHANNEL=slack needs SLACK_WEBHOOK_URL"))?,
            },
            Some("email") => NotifyChannel::Email {
                api_key: var("BREVO_API_KEY")
                    .ok_or_else(|| anyhow!("NOTIFY_CHANNEL=email needs BREVO_API_KEY"))?,
                sender: var("BREVO_SENDER_EMAIL")
                    .ok_or_else(|| anyhow!("NOTIFY_CHANNEL=email needs BREVO_SENDER_EMAIL"))?,
            },
            Some(other) => bail!("NOTIFY_CHANNEL must be log, slack or email, got '{}'", other),
        };

        let worker_count: usize = parse_or("WORKER_COUNT", var("WORKER_COUNT"), 2)?;
        let retry_max_attempts: u32 = parse_or("RETRY_MAX_ATTEMPTS", var("RETRY_MAX_ATTEMPTS"), 3)?;
        if worker_count == 0 || retry_max_attempts == 0 {
            bail!("WORKER_COUNT and RETRY_MAX_ATTEMPTS must be at least 1");
        }
        let job_lease =
            Duration::from_secs(parse_or("JOB_LEASE_SECS", var("JOB_LEASE_SECS"), 180)?);
        if job_lease.is_zero() {
            bail!("JOB_LEASE_SECS must be at least 1");
        }

        Ok(Self {
            data_dir: var("DATA_DIR").unwrap_or_else(|| "data".to_string()),
            store_backend,
            queue_backend,
            gemini_api_key,
            gemini_text_model: var("GEMINI_TEXT_MODEL")
                .unwrap_or_else(|| "gemini-1.5-flash".to_string()),
            gemini_image_model: var("GEMINI_IMAGE_MODEL")
                .unwrap_or_else(|| "gemini-1.5-flash".to_string()),
            text_classifier,
            openrouter_api_key,
            openrouter_model: var("OPENROUTER_MODEL")
                .unwrap_or_else(|| "deepseek/deepseek-chat-v3.1:free".to_string()),
            classify_timeout: Duration::from_secs(parse_or(
                "CLASSIFY_TIMEOUT_SECS",
                var("CLASSIFY_TIMEOUT_SECS"),
                30,
            )?),
            download_timeout: Duration::from_secs(parse_or(
                "DOWNLOAD_TIMEOUT_SECS",
                var("DOWNLOAD_TIMEOUT_SECS"),
                20,
            )?),
            max_image_bytes: parse_or("MAX_IMAGE_BYTES", var("MAX_IMAGE_BYTES"), 10 * 1024 * 1024)?,
            worker_count,
            retry_max_attempts,
            retry_base_delay: Duration::from_millis(parse_or(
                "RETRY_BASE_DELAY_MS",
                var("RETRY_BASE_DELAY_MS"),
                1000,
            )?),
            stale_processing: Duration::from_secs(parse_or(
                "STALE_PROCESSING_SECS",
                var("STALE_PROCESSING_SECS"),
                300,
            )?),
            recovery_interval: Duration::from_secs(parse_or(
                "RECOVERY_INTERVAL_SECS",
                var("RECOVERY_INTERVAL_SECS"),
                60,
            )?),
            job_lease,
            notify,
        })
    }

    pub fn database_path(&self) -> String {
        format!("{}/moderation.db", self.data_dir)
    }

    /// Longest one image job can legitimately run: every download and every
    /// classification attempt hitting its timeout, plus the backoff sleeps.
    pub fn worst_case_job_duration(&self) -> Duration {
        let attempts = self.retry_max_attempts;
        let backoff: Duration = (0..attempts.saturating_sub(1))
            .map(|i| self.retry_base_delay.saturating_mul(2u32.saturating_pow(i)))
            .sum();
        (self.download_timeout + self.classify_timeout).saturating_mul(attempts)
            + backoff.saturating_mul(2)
    }

    /// Workers renew their lease this often, three times per lease period.
    pub fn lease_renewal(&self) -> Duration {
        self.job_lease / 3
    }
}

fn parse_backend(key: &str, value: Option<String>) -> anyhow::Result<Backend> {
    match value.as_deref() {
        None | Some("sqlite") => Ok(Backend::Sqlite),
        Some("memory") => Ok(Backend::Memory),
        Some(other) => bail!("{} must be 'sqlite' or 'memory', got '{}'", key, other),
    }
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(v) => v
            .parse::<T>()
            .with_context(|| format!("Invalid value for {}: '{}'", key, v)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> anyhow::Result<AppConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[("GEMINI_API_KEY", "g")]).unwrap();

        assert_eq!(config.store_backend, Backend::Sqlite);
        assert_eq!(config.queue_backend, Backend::Sqlite);
        assert_eq!(config.text_classifier, TextClassifier::Gemini);
        assert_eq!(config.classify_timeout, Duration::from_secs(30));
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.retry_base_delay, Duration::from_secs(1));
        assert_eq!(config.max_image_bytes, 10 * 1024 * 1024);
        assert_eq!(config.notify, NotifyChannel::Log);
        assert_eq!(config.database_path(), "data/moderation.db");
    }

    #[test]
    fn test_default_lease_outlasts_the_slowest_job() {
        let config = config_from(&[("GEMINI_API_KEY", "g")]).unwrap();

        // 3 x (20s download + 30s classify) + (1s + 2s) backoff for each stage
        assert_eq!(config.worst_case_job_duration(), Duration::from_secs(156));
        assert!(config.job_lease > config.worst_case_job_duration());
        assert_eq!(config.lease_renewal(), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_lease_is_rejected() {
        assert!(config_from(&[("GEMINI_API_KEY", "g"), ("JOB_LEASE_SECS", "0")]).is_err());
    }

    #[test]
    fn test_missing_gemini_key_is_an_error() {
        assert!(config_from(&[]).is_err());
    }

    #[test]
    fn test_channel_specific_settings_are_required() {
        assert!(config_from(&[("GEMINI_API_KEY", "g"), ("NOTIFY_CHANNEL", "slack")]).is_err());
        let config = config_from(&[
            ("GEMINI_API_KEY", "g"),
            ("NOTIFY_CHANNEL", "email"),
            ("BREVO_API_KEY", "b"),
            ("BREVO_SENDER_EMAIL", "alerts@example.com"),
        ])
        .unwrap();
        assert!(matches!(config.notify, NotifyChannel::Email { .. }));
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        let err = config_from(&[("GEMINI_API_KEY", "g"), ("WORKER_COUNT", "many")]).unwrap_err();
        assert!(err.to_string().contains("WORKER_COUNT"));
        assert!(config_from(&[("GEMINI_API_KEY", "g"), ("WORKER_COUNT", "0")]).is_err());
    }
}
