// Core moderation module - the submission pipeline.
//
// Ports (traits) for the store, queue, classifier, image fetcher and
// notification transport live here next to the logic that uses them.
// Implementations are in infra/.

pub mod classifier;
pub mod fingerprint;
pub mod image_fetcher;
pub mod job_queue;
pub mod moderation_models;
pub mod moderation_service;
pub mod moderation_store;
pub mod notification_gate;
pub mod retry;
pub mod worker;

#[cfg(test)]
pub mod testing;

pub use classifier::*;
pub use fingerprint::*;
pub use image_fetcher::*;
pub use job_queue::*;
pub use moderation_models::*;
pub use moderation_service::*;
pub use moderation_store::*;
pub use notification_gate::*;
pub use retry::*;
pub use worker::*;
