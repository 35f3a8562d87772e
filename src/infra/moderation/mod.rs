// Implementations of the moderation store and job queue.

pub mod in_memory_queue;
pub mod in_memory_store;
pub mod sqlite_job_queue;
pub mod sqlite_moderation_store;

pub use in_memory_queue::InMemoryJobQueue;
pub use in_memory_store::InMemoryModerationStore;
pub use sqlite_job_queue::SqliteJobQueue;
pub use sqlite_moderation_store::SqliteModerationStore;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};
use std::path::Path;

/// Opens (and creates if needed) a SQLite database file.
pub async fn connect_sqlite(database_url: &str) -> anyhow::Result<Pool<Sqlite>> {
    // Ensure the file exists if it's a file path
    let path_str = database_url.trim_start_matches("sqlite://");
    if !database_url.contains(":memory:") && !Path::new(path_str).exists() {
        if let Some(parent) = Path::new(path_str).parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::File::create(path_str)?;
    }

    let conn_str = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite://{}", database_url)
    };

    let pool = SqlitePoolOptions::new().connect(&conn_str).await?;
    Ok(pool)
}

// Fixed-width UTC timestamps so string comparison in SQL matches time order.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
