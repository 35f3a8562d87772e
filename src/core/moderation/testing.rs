// Test doubles for the moderation ports.

use super::classifier::{Classifier, ClassifierError};
use super::image_fetcher::{DownloadError, ImageFetcher};
use super::moderation_models::{ContentType, Label, Verdict};
use super::notification_gate::{NotificationTransport, NotifyError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Returns a fixed verdict, optionally after failing a number of times.
pub struct ScriptedClassifier {
    verdict: Option<Verdict>,
    failures_before_success: u32,
    delay: Option<Duration>,
    calls: AtomicU32,
}

impl ScriptedClassifier {
    pub fn always(label: Label, confidence: u8) -> Self {
        Self {
            verdict: Some(Verdict {
                label,
                confidence,
                rationale: format!("scripted {}", label),
                raw_backend_output: format!(
                    "{{\"classification\": \"{}\", \"confidence\": {}}}",
                    label, confidence
                ),
            }),
            failures_before_success: 0,
            delay: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Always fails with `BackendUnavailable`.
    pub fn unavailable() -> Self {
        Self {
            verdict: None,
            failures_before_success: u32::MAX,
            delay: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn unavailable_then(failures: u32, label: Label, confidence: u8) -> Self {
        Self {
            failures_before_success: failures,
            ..Self::always(label, confidence)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(
        &self,
        _content_type: ContentType,
        _content: &[u8],
    ) -> Result<Verdict, ClassifierError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.verdict {
            Some(verdict) if call >= self.failures_before_success => Ok(verdict.clone()),
            _ => Err(ClassifierError::unavailable("scripted outage")),
        }
    }
}

/// Returns the same download result for every call.
pub struct ScriptedFetcher {
    result: Result<Vec<u8>, DownloadError>,
    calls: AtomicU32,
}

impl ScriptedFetcher {
    pub fn always(bytes: Vec<u8>) -> Self {
        Self {
            result: Ok(bytes),
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing(err: DownloadError) -> Self {
        Self {
            result: Err(err),
            calls: AtomicU32::new(0),
        }
    }

    /// For tests that never download anything.
    pub fn empty() -> Self {
        Self::failing(DownloadError::Permanent("no image configured".to_string()))
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageFetcher for ScriptedFetcher {
    async fn fetch(&self, _url: &str) -> Result<Vec<u8>, DownloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

/// Remembers every message it was asked to send.
pub struct RecordingTransport {
    sent: DashMap<u32, (String, Label)>,
    counter: AtomicU32,
    fail: bool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            sent: DashMap::new(),
            counter: AtomicU32::new(0),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn sent_count(&self) -> usize {
        self.sent.len()
    }
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    fn channel(&self) -> &str {
        "recording"
    }

    async fn send(
        &self,
        identity: &str,
        label: Label,
        _rationale: &str,
    ) -> Result<(), NotifyError> {
        if self.fail {
            return Err(NotifyError("provider returned 503".to_string()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.sent.insert(n, (identity.to_string(), label));
        Ok(())
    }
}
