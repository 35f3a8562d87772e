// Image download port.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DownloadError {
    /// Network error, timeout or a server-side failure. Retry-eligible.
    #[error("Transient download error: {0}")]
    Transient(String),

    /// Malformed URL, client error status, size limit, unsupported content.
    #[error("Permanent download error: {0}")]
    Permanent(String),
}

impl DownloadError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DownloadError::Transient(_))
    }
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Downloads the image at `url` and returns its raw bytes.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, DownloadError>;
}
