pub mod gemini_client;
pub mod openrouter_client;

pub use gemini_client::GeminiClassifier;
pub use openrouter_client::OpenRouterClassifier;

use crate::core::moderation::ClassifierError;

/// Maps a transport-level reqwest failure onto the classifier error kinds.
fn request_error(backend: &str, e: reqwest::Error) -> ClassifierError {
    if e.is_timeout() {
        ClassifierError::timeout(format!("{} request timed out: {}", backend, e))
    } else {
        ClassifierError::unavailable(format!("{} request failed: {}", backend, e))
    }
}
