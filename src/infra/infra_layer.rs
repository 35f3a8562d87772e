// The infra module contains implementations of core traits.
// Each feature implementation goes in its own submodule.

#[path = "moderation/mod.rs"]
pub mod moderation;

#[path = "ai/mod.rs"]
pub mod ai;

#[path = "images/mod.rs"]
pub mod images;

#[path = "notifications/mod.rs"]
pub mod notifications;
