// Downloads submitted images over HTTP(S).
//
// Failures are split into transient (worth retrying) and permanent (fail the
// submission right away). Bodies are read chunk by chunk so an oversized
// payload is cut off at the limit instead of being buffered in full.

use crate::core::moderation::{DownloadError, ImageFetcher};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode, Url};
use std::time::Duration;

pub struct HttpImageFetcher {
    client: Client,
    max_bytes: usize,
}

impl HttpImageFetcher {
    pub fn new(timeout: Duration, max_bytes: usize) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, max_bytes })
    }
}

fn parse_image_url(url: &str) -> Result<Url, DownloadError> {
    let parsed = Url::parse(url.trim())
        .map_err(|e| DownloadError::Permanent(format!("invalid URL '{}': {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(DownloadError::Permanent(format!(
            "unsupported URL scheme '{}'",
            other
        ))),
    }
}

/// Maps a non-success status onto a download error.
fn status_error(status: StatusCode) -> DownloadError {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        DownloadError::Transient(format!("HTTP {}", status))
    } else {
        DownloadError::Permanent(format!("HTTP {}", status))
    }
}

fn request_error(e: reqwest::Error) -> DownloadError {
    if e.is_builder() || e.is_redirect() {
        DownloadError::Permanent(e.to_string())
    } else {
        DownloadError::Transient(e.to_string())
    }
}

fn accepts_content_type(value: &str) -> bool {
    let mime = value.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    mime.starts_with("image/") || mime == "application/octet-stream"
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        let url = parse_image_url(url)?;

        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status));
        }

        if let Some(content_type) = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            if !accepts_content_type(content_type) {
                return Err(DownloadError::Permanent(format!(
                    "content type '{}' is not an image",
                    content_type
                )));
            }
        }

        if let Some(length) = response.content_length() {
            if length as usize > self.max_bytes {
                return Err(DownloadError::Permanent(format!(
                    "image is {} bytes, limit is {}",
                    length, self.max_bytes
                )));
            }
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(request_error)? {
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(DownloadError::Permanent(format!(
                    "image exceeds {} byte limit",
                    self.max_bytes
                )));
            }
            bytes.extend_from_slice(&chunk);
        }

        if bytes.is_empty() {
            return Err(DownloadError::Permanent("empty response body".to_string()));
        }

        tracing::debug!("Downloaded {} bytes from {}", bytes.len(), url.host_str().unwrap_or(""));
        Ok(bytes)
    }
}
