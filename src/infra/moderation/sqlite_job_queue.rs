// SQLite-backed job queue.
//
// A job row lives until it is acked. Dequeue claims the oldest row whose
// lease is empty or expired by pushing `leased_until` forward; an un-acked
// delivery therefore reappears once its lease lapses, including after a
// process restart.

use super::format_ts;
use crate::core::moderation::{Delivery, JobQueue, ModerationJob, QueueError, SubmissionId};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use std::time::Duration;
use uuid::Uuid;

fn storage(e: sqlx::Error) -> QueueError {
    QueueError::Unavailable(e.to_string())
}

pub struct SqliteJobQueue {
    pool: Pool<Sqlite>,
    lease_duration: Duration,
}

impl SqliteJobQueue {
    pub fn new(pool: Pool<Sqlite>, lease_duration: Duration) -> Self {
        Self {
            pool,
            lease_duration,
        }
    }

    pub async fn migrate(&self) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS moderation_jobs (
                id TEXT PRIMARY KEY,
                submission_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                enqueued_at TEXT NOT NULL,
                leased_until TEXT,
                delivery_count INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_moderation_jobs_submission \
             ON moderation_jobs(submission_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }

    fn lease_until(&self) -> String {
        let lease = chrono::Duration::from_std(self.lease_duration)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        format_ts(Utc::now() + lease)
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, job: ModerationJob) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&job)?;
        sqlx::query(
            r#"
            INSERT INTO moderation_jobs
                (id, submission_id, payload, enqueued_at, leased_until, delivery_count)
            VALUES (?, ?, ?, ?, NULL, 0)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(job.submission_id.to_string())
        .bind(payload)
        .bind(format_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        // Claim and read in one statement so concurrent workers never hold a
        // read lock they then need to upgrade.
        let row = sqlx::query(
            r#"
            UPDATE moderation_jobs
            SET leased_until = ?, delivery_count = delivery_count + 1
            WHERE id = (
                SELECT id FROM moderation_jobs
                WHERE leased_until IS NULL OR leased_until <= ?
                ORDER BY enqueued_at, rowid
                LIMIT 1
            )
            RETURNING id, payload, delivery_count
            "#,
        )
        .bind(self.lease_until())
        .bind(format_ts(Utc::now()))
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: String = row.get("id");
        let delivery_count = row.get::<i64, _>("delivery_count") as u32;
        if delivery_count > 1 {
            tracing::debug!("Lease on job {} expired, redelivering", id);
        }

        let payload: String = row.get("payload");
        let job: ModerationJob = serde_json::from_str(&payload)?;
        let delivery_id =
            Uuid::parse_str(&id).map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(Some(Delivery {
            delivery_id,
            job,
            delivery_count,
        }))
    }

    async fn ack(&self, delivery_id: Uuid) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM moderation_jobs WHERE id = ?")
            .bind(delivery_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn renew_lease(&self, delivery_id: Uuid) -> Result<bool, QueueError> {
        let result = sqlx::query("UPDATE moderation_jobs SET leased_until = ? WHERE id = ?")
            .bind(self.lease_until())
            .bind(delivery_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_in_flight(&self, submission_id: SubmissionId) -> Result<bool, QueueError> {
        let row = sqlx::query("SELECT 1 FROM moderation_jobs WHERE submission_id = ? LIMIT 1")
            .bind(submission_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.is_some())
    }
}
