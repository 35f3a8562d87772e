// SQLite-backed moderation store.
//
// Tables:
// - submissions: one row per submission, `state` is the CAS column
// - verdicts: at most one authoritative verdict per submission
// - notification_attempts: every attempt; a partial unique index allows only
//   one 'sent' row per submission

use super::{format_ts, parse_ts};
use crate::core::moderation::{
    ContentType, Fingerprint, Label, ModerationStore, NewSubmission, NotificationAttempt,
    NotificationOutcome, StoreError, Submission, SubmissionId, SubmissionState, Transition,
    Verdict, VerdictRecord,
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite, SqliteConnection};
use uuid::Uuid;

const SUBMISSION_COLUMNS: &str = "id, content_type, fingerprint, submitter, source, state, \
     verdict_source, failure_reason, recovery_attempts, created_at, updated_at";

fn storage(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn corrupt(what: &str, value: &str) -> StoreError {
    StoreError::Unavailable(format!("corrupt {} in store: {}", what, value))
}

pub struct SqliteModerationStore {
    pool: Pool<Sqlite>,
}

impl SqliteModerationStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Run database migrations to create required tables.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS submissions (
                id TEXT PRIMARY KEY,
                content_type TEXT NOT NULL,
                fingerprint TEXT,
                submitter TEXT NOT NULL,
                source TEXT NOT NULL,
                state TEXT NOT NULL,
                verdict_source TEXT,
                failure_reason TEXT,
                recovery_attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_submissions_fingerprint \
             ON submissions(content_type, fingerprint, state)",
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_submissions_submitter ON submissions(submitter)",
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_submissions_state ON submissions(state)")
            .execute(&self.pool)
            .await
            .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS verdicts (
                submission_id TEXT PRIMARY KEY REFERENCES submissions(id),
                label TEXT NOT NULL,
                confidence INTEGER NOT NULL,
                rationale TEXT NOT NULL DEFAULT '',
                raw_backend_output TEXT NOT NULL DEFAULT '',
                recorded_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notification_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                submission_id TEXT NOT NULL REFERENCES submissions(id),
                channel TEXT NOT NULL,
                outcome TEXT NOT NULL,
                detail TEXT,
                sent_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_notification_sent_once \
             ON notification_attempts(submission_id) WHERE outcome = 'sent'",
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }

    fn map_submission(row: &SqliteRow) -> Result<Submission, StoreError> {
        let id: String = row.get("id");
        let content_type: String = row.get("content_type");
        let state: String = row.get("state");
        let verdict_source: Option<String> = row.get("verdict_source");
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");

        Ok(Submission {
            id: Uuid::parse_str(&id).map_err(|_| corrupt("submission id", &id))?,
            content_type: ContentType::parse(&content_type)
                .ok_or_else(|| corrupt("content type", &content_type))?,
            fingerprint: row
                .get::<Option<String>, _>("fingerprint")
                .map(Fingerprint::from_hex),
            submitter: row.get("submitter"),
            source: row.get("source"),
            state: SubmissionState::parse(&state).ok_or_else(|| corrupt("state", &state))?,
            verdict_source: verdict_source
                .map(|v| Uuid::parse_str(&v).map_err(|_| corrupt("verdict source", &v)))
                .transpose()?,
            failure_reason: row.get("failure_reason"),
            recovery_attempts: row.get::<i64, _>("recovery_attempts") as u32,
            created_at: parse_ts(&created_at).ok_or_else(|| corrupt("timestamp", &created_at))?,
            updated_at: parse_ts(&updated_at).ok_or_else(|| corrupt("timestamp", &updated_at))?,
        })
    }

    fn map_attempt(row: &SqliteRow) -> Result<NotificationAttempt, StoreError> {
        let submission_id: String = row.get("submission_id");
        let outcome: String = row.get("outcome");
        let sent_at: String = row.get("sent_at");
        Ok(NotificationAttempt {
            submission_id: Uuid::parse_str(&submission_id)
                .map_err(|_| corrupt("submission id", &submission_id))?,
            channel: row.get("channel"),
            outcome: NotificationOutcome::parse(&outcome)
                .ok_or_else(|| corrupt("notification outcome", &outcome))?,
            detail: row.get("detail"),
            sent_at: parse_ts(&sent_at).ok_or_else(|| corrupt("timestamp", &sent_at))?,
        })
    }

    async fn fetch_submission(
        conn: &mut SqliteConnection,
        id: SubmissionId,
    ) -> Result<Option<Submission>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM submissions WHERE id = ?",
            SUBMISSION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage)?;
        row.as_ref().map(Self::map_submission).transpose()
    }

    /// Compare-and-set on `state`. Must run inside the caller's transaction.
    async fn apply_transition(
        conn: &mut SqliteConnection,
        id: SubmissionId,
        transition: &Transition,
    ) -> Result<(), StoreError> {
        transition.validate()?;
        let result = sqlx::query(
            r#"
            UPDATE submissions
            SET state = ?, failure_reason = COALESCE(?, failure_reason), updated_at = ?
            WHERE id = ? AND state = ?
            "#,
        )
        .bind(transition.to.as_str())
        .bind(transition.failure_reason.as_deref())
        .bind(format_ts(Utc::now()))
        .bind(id.to_string())
        .bind(transition.from.as_str())
        .execute(&mut *conn)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(Self::conflict_or_missing(conn, id, transition.from).await);
        }
        Ok(())
    }

    async fn conflict_or_missing(
        conn: &mut SqliteConnection,
        id: SubmissionId,
        expected: SubmissionState,
    ) -> StoreError {
        match Self::fetch_submission(conn, id).await {
            Ok(Some(current)) => StoreError::Conflict {
                id,
                expected,
                actual: current.state,
            },
            Ok(None) => StoreError::NotFound(id),
            Err(e) => e,
        }
    }

    async fn list_where(&self, clause: &str, value: &str) -> Result<Vec<Submission>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM submissions WHERE {} = ? ORDER BY created_at, rowid",
            SUBMISSION_COLUMNS, clause
        ))
        .bind(value)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(Self::map_submission).collect()
    }
}

#[async_trait]
impl ModerationStore for SqliteModerationStore {
    async fn create_submission(&self, new: NewSubmission) -> Result<Submission, StoreError> {
        let now = Utc::now();
        let submission = Submission {
            id: Uuid::new_v4(),
            content_type: new.content_type,
            fingerprint: new.fingerprint,
            submitter: new.submitter,
            source: new.source,
            state: new.state,
            verdict_source: new.verdict_source,
            failure_reason: None,
            recovery_attempts: 0,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO submissions (
                id, content_type, fingerprint, submitter, source, state,
                verdict_source, failure_reason, recovery_attempts, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, NULL, 0, ?, ?)
            "#,
        )
        .bind(submission.id.to_string())
        .bind(submission.content_type.as_str())
        .bind(submission.fingerprint.as_ref().map(|f| f.as_str().to_string()))
        .bind(&submission.submitter)
        .bind(&submission.source)
        .bind(submission.state.as_str())
        .bind(submission.verdict_source.map(|id| id.to_string()))
        .bind(format_ts(now))
        .bind(format_ts(now))
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(submission)
    }

    async fn get_submission(&self, id: SubmissionId) -> Result<Option<Submission>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        Self::fetch_submission(&mut conn, id).await
    }

    async fn transition_state(
        &self,
        id: SubmissionId,
        transition: Transition,
    ) -> Result<Submission, StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        Self::apply_transition(&mut tx, id, &transition).await?;
        let submission = Self::fetch_submission(&mut tx, id)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        tx.commit().await.map_err(storage)?;
        Ok(submission)
    }

    async fn record_fingerprint(
        &self,
        id: SubmissionId,
        fingerprint: &Fingerprint,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE submissions SET fingerprint = ?, updated_at = ? WHERE id = ?")
                .bind(fingerprint.as_str())
                .bind(format_ts(Utc::now()))
                .bind(id.to_string())
                .execute(&self.pool)
                .await
                .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn put_verdict(
        &self,
        id: SubmissionId,
        transition: Transition,
        verdict: Verdict,
    ) -> Result<Submission, StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        Self::apply_transition(&mut tx, id, &transition).await?;

        sqlx::query(
            r#"
            INSERT INTO verdicts
                (submission_id, label, confidence, rationale, raw_backend_output, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(submission_id) DO UPDATE SET
                label = excluded.label,
                confidence = excluded.confidence,
                rationale = excluded.rationale,
                raw_backend_output = excluded.raw_backend_output,
                recorded_at = excluded.recorded_at
            "#,
        )
        .bind(id.to_string())
        .bind(verdict.label.as_str())
        .bind(verdict.confidence as i64)
        .bind(&verdict.rationale)
        .bind(&verdict.raw_backend_output)
        .bind(format_ts(Utc::now()))
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        let submission = Self::fetch_submission(&mut tx, id)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        tx.commit().await.map_err(storage)?;
        Ok(submission)
    }

    async fn reuse_verdict(
        &self,
        id: SubmissionId,
        transition: Transition,
        original: SubmissionId,
    ) -> Result<Submission, StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let has_verdict = sqlx::query("SELECT 1 FROM verdicts WHERE submission_id = ?")
            .bind(original.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?
            .is_some();
        if !has_verdict {
            return Err(StoreError::NotFound(original));
        }

        Self::apply_transition(&mut tx, id, &transition).await?;
        sqlx::query("UPDATE submissions SET verdict_source = ? WHERE id = ?")
            .bind(original.to_string())
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        let submission = Self::fetch_submission(&mut tx, id)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        tx.commit().await.map_err(storage)?;
        Ok(submission)
    }

    async fn get_verdict(&self, id: SubmissionId) -> Result<Option<VerdictRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT v.submission_id, v.label, v.confidence, v.rationale,
                   v.raw_backend_output, v.recorded_at
            FROM submissions s
            JOIN verdicts v ON v.submission_id = COALESCE(s.verdict_source, s.id)
            WHERE s.id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let owner: String = row.get("submission_id");
        let recorded_at: String = row.get("recorded_at");
        Ok(Some(VerdictRecord {
            submission_id: Uuid::parse_str(&owner).map_err(|_| corrupt("submission id", &owner))?,
            verdict: Verdict {
                label: Label::from_stored(&row.get::<String, _>("label")),
                confidence: row.get::<i64, _>("confidence").clamp(0, 100) as u8,
                rationale: row.get("rationale"),
                raw_backend_output: row.get("raw_backend_output"),
            },
            recorded_at: parse_ts(&recorded_at)
                .ok_or_else(|| corrupt("timestamp", &recorded_at))?,
        }))
    }

    async fn put_notification_attempt(
        &self,
        attempt: NotificationAttempt,
    ) -> Result<NotificationAttempt, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO notification_attempts (submission_id, channel, outcome, detail, sent_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(attempt.submission_id.to_string())
        .bind(&attempt.channel)
        .bind(attempt.outcome.as_str())
        .bind(attempt.detail.as_deref())
        .bind(format_ts(attempt.sent_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(attempt),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::AlreadyNotified(attempt.submission_id))
            }
            Err(e) => Err(storage(e)),
        }
    }

    async fn find_sent_notification(
        &self,
        id: SubmissionId,
    ) -> Result<Option<NotificationAttempt>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM notification_attempts WHERE submission_id = ? AND outcome = 'sent'",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        row.as_ref().map(Self::map_attempt).transpose()
    }

    async fn list_notification_attempts(
        &self,
        id: SubmissionId,
    ) -> Result<Vec<NotificationAttempt>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM notification_attempts WHERE submission_id = ? ORDER BY id",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(Self::map_attempt).collect()
    }

    async fn find_by_fingerprint(
        &self,
        content_type: ContentType,
        fingerprint: &Fingerprint,
        state: SubmissionState,
    ) -> Result<Option<Submission>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM submissions
            WHERE content_type = ? AND fingerprint = ? AND state = ?
            ORDER BY created_at, rowid
            LIMIT 1
            "#,
            SUBMISSION_COLUMNS
        ))
        .bind(content_type.as_str())
        .bind(fingerprint.as_str())
        .bind(state.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        row.as_ref().map(Self::map_submission).transpose()
    }

    async fn list_by_submitter(&self, identity: &str) -> Result<Vec<Submission>, StoreError> {
        self.list_where("submitter", identity).await
    }

    async fn list_by_state(&self, state: SubmissionState) -> Result<Vec<Submission>, StoreError> {
        self.list_where("state", state.as_str()).await
    }

    async fn mark_recovery_attempt(
        &self,
        id: SubmissionId,
        expected: SubmissionState,
    ) -> Result<Submission, StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let result = sqlx::query(
            r#"
            UPDATE submissions
            SET recovery_attempts = recovery_attempts + 1, updated_at = ?
            WHERE id = ? AND state = ?
            "#,
        )
        .bind(format_ts(Utc::now()))
        .bind(id.to_string())
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await
        .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(Self::conflict_or_missing(&mut tx, id, expected).await);
        }
        let submission = Self::fetch_submission(&mut tx, id)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        tx.commit().await.map_err(storage)?;
        Ok(submission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::moderation::fingerprint;
    use crate::infra::moderation::connect_sqlite;
    use tempfile::NamedTempFile;

    async fn open_store() -> (SqliteModerationStore, NamedTempFile) {
        let tmp = NamedTempFile::new().unwrap();
        let pool = connect_sqlite(tmp.path().to_str().unwrap()).await.unwrap();
        let store = SqliteModerationStore::new(pool);
        store.migrate().await.unwrap();
        (store, tmp)
    }

    fn pending_text(submitter: &str, text: &str) -> NewSubmission {
        NewSubmission::pending(
            ContentType::Text,
            submitter,
            text,
            Some(fingerprint(text.as_bytes())),
        )
    }

    fn toxic() -> Verdict {
        Verdict {
            label: Label::Toxic,
            confidence: 80,
            rationale: "insult".to_string(),
            raw_backend_output: "{}".to_string(),
        }
    }

    async fn complete(store: &SqliteModerationStore, id: SubmissionId) -> Submission {
        store
            .transition_state(
                id,
                Transition::new(SubmissionState::Pending, SubmissionState::Processing),
            )
            .await
            .unwrap();
        store
            .put_verdict(
                id,
                Transition::new(SubmissionState::Processing, SubmissionState::Completed),
                toxic(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_submission_roundtrip() {
        let (store, _tmp) = open_store().await;
        let created = store
            .create_submission(pending_text("a@example.com", "hello"))
            .await
            .unwrap();

        let loaded = store.get_submission(created.id).await.unwrap().unwrap();

        assert_eq!(loaded.id, created.id);
        assert_eq!(loaded.state, SubmissionState::Pending);
        assert_eq!(loaded.fingerprint, created.fingerprint);
        assert_eq!(loaded.source, "hello");
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let (store, _tmp) = open_store().await;
        let s = store
            .create_submission(pending_text("a@example.com", "hello"))
            .await
            .unwrap();

        store
            .transition_state(
                s.id,
                Transition::new(SubmissionState::Pending, SubmissionState::Processing),
            )
            .await
            .unwrap();
        let err = store
            .transition_state(
                s.id,
                Transition::new(SubmissionState::Pending, SubmissionState::Processing),
            )
            .await
            .unwrap_err();

        match err {
            StoreError::Conflict { actual, .. } => assert_eq!(actual, SubmissionState::Processing),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_conflicting_put_verdict_writes_nothing() {
        let (store, _tmp) = open_store().await;
        let s = store
            .create_submission(pending_text("a@example.com", "hello"))
            .await
            .unwrap();
        complete(&store, s.id).await;

        let err = store
            .put_verdict(
                s.id,
                Transition::to_failed(SubmissionState::Processing, "late"),
                Verdict::unknown("late", ""),
            )
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        let verdict = store.get_verdict(s.id).await.unwrap().unwrap();
        assert_eq!(verdict.verdict.label, Label::Toxic);
        let loaded = store.get_submission(s.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, SubmissionState::Completed);
        assert!(loaded.failure_reason.is_none());
    }

    #[tokio::test]
    async fn test_find_by_fingerprint_and_reuse() {
        let (store, _tmp) = open_store().await;
        let original = store
            .create_submission(pending_text("a@example.com", "spam spam"))
            .await
            .unwrap();
        complete(&store, original.id).await;
        let fp = fingerprint(b"spam spam");

        let found = store
            .find_by_fingerprint(ContentType::Text, &fp, SubmissionState::Completed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, original.id);
        assert!(store
            .find_by_fingerprint(ContentType::Image, &fp, SubmissionState::Completed)
            .await
            .unwrap()
            .is_none());

        let copy = store
            .create_submission(NewSubmission::deduplicated(
                ContentType::Text,
                "b@example.com",
                "spam spam",
                fp,
                original.id,
            ))
            .await
            .unwrap();
        let verdict = store.get_verdict(copy.id).await.unwrap().unwrap();
        assert_eq!(verdict.submission_id, original.id);
        assert_eq!(verdict.verdict, toxic());
    }

    #[tokio::test]
    async fn test_only_one_sent_attempt_per_submission() {
        let (store, _tmp) = open_store().await;
        let s = store
            .create_submission(pending_text("a@example.com", "hello"))
            .await
            .unwrap();
        let attempt = |outcome| NotificationAttempt {
            submission_id: s.id,
            channel: "slack".to_string(),
            outcome,
            detail: None,
            sent_at: Utc::now(),
        };

        store
            .put_notification_attempt(attempt(NotificationOutcome::Sent))
            .await
            .unwrap();
        let err = store
            .put_notification_attempt(attempt(NotificationOutcome::Sent))
            .await
            .unwrap_err();
        store
            .put_notification_attempt(attempt(NotificationOutcome::Suppressed))
            .await
            .unwrap();

        assert!(matches!(err, StoreError::AlreadyNotified(_)));
        assert!(store.find_sent_notification(s.id).await.unwrap().is_some());
        assert_eq!(store.list_notification_attempts(s.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_listings() {
        let (store, _tmp) = open_store().await;
        let first = store
            .create_submission(pending_text("a@example.com", "one"))
            .await
            .unwrap();
        let second = store
            .create_submission(pending_text("a@example.com", "two"))
            .await
            .unwrap();
        store
            .create_submission(pending_text("b@example.com", "three"))
            .await
            .unwrap();
        complete(&store, second.id).await;

        let mine = store.list_by_submitter("a@example.com").await.unwrap();
        assert_eq!(
            mine.iter().map(|s| s.id).collect::<Vec<_>>(),
            vec![first.id, second.id]
        );
        assert!(store.list_by_submitter("nobody").await.unwrap().is_empty());

        let pending = store.list_by_state(SubmissionState::Pending).await.unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn test_mark_recovery_attempt() {
        let (store, _tmp) = open_store().await;
        let s = store
            .create_submission(pending_text("a@example.com", "hello"))
            .await
            .unwrap();

        let marked = store
            .mark_recovery_attempt(s.id, SubmissionState::Pending)
            .await
            .unwrap();
        assert_eq!(marked.recovery_attempts, 1);

        let err = store
            .mark_recovery_attempt(s.id, SubmissionState::Processing)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }
}
