use chrono::{DateTime, Utc};
use models::ResponseStatus;

/// One unit of LLM work: a (batch, document body, prompt, connection)
/// pairing with its full result payload. This row is the authoritative state
/// of the work; catalog-side batch counters are projections over it.
#[derive(Debug, serde::Serialize, sqlx::FromRow)]
pub struct Response {
    pub id: i64,
    pub batch_id: i32,
    pub doc_id: i64,
    pub prompt_id: i32,
    pub connection_id: i32,
    pub connection_details: Option<serde_json::Value>,
    pub task_id: Option<String>,
    pub status: ResponseStatus,
    pub response_text: Option<String>,
    pub response_json: Option<String>,
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub time_taken_seconds: Option<f64>,
    pub tokens_per_second: Option<f64>,
    pub overall_score: Option<f64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_processing_at: Option<DateTime<Utc>>,
    pub completed_processing_at: Option<DateTime<Utc>>,
}

const RESPONSE_COLUMNS: &str = "id, batch_id, doc_id, prompt_id, connection_id, \
     connection_details, task_id, status, response_text, response_json, \
     input_tokens, output_tokens, time_taken_seconds, tokens_per_second, \
     overall_score, error_message, created_at, started_processing_at, \
     completed_processing_at";

/// Per-batch status breakdown, the input to the fan-in predicate and the
/// monitoring projection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, sqlx::FromRow)]
pub struct StatusCounts {
    pub total: i64,
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub timeout: i64,
}

impl StatusCounts {
    pub fn terminal(&self) -> i64 {
        self.completed + self.failed + self.timeout
    }

    pub fn all_terminal(&self) -> bool {
        self.total > 0 && self.terminal() == self.total
    }
}

/// Materialize one QUEUED slot. `ON CONFLICT DO NOTHING` over the unique
/// (batch, doc, prompt, connection) index makes staging idempotent: the
/// return value is false when the slot already existed.
pub async fn enqueue(
    batch_id: i32,
    doc_id: i64,
    prompt_id: i32,
    connection_id: i32,
    connection_details: Option<&serde_json::Value>,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<bool> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO llm_responses (batch_id, doc_id, prompt_id, connection_id, connection_details, status)
        VALUES ($1, $2, $3, $4, $5, 'QUEUED')
        ON CONFLICT (batch_id, doc_id, prompt_id, connection_id) DO NOTHING
        "#,
    )
    .bind(batch_id)
    .bind(doc_id)
    .bind(prompt_id)
    .bind(connection_id)
    .bind(connection_details)
    .execute(db)
    .await?;
    Ok(inserted.rows_affected() == 1)
}

/// Lease up to `limit` QUEUED rows for processing.
///
/// `FOR UPDATE SKIP LOCKED` is the lease primitive: concurrent schedulers
/// never pick the same row. Each leased row is flipped to PROCESSING with a
/// fresh synthetic task id inside the same transaction, so an observed
/// PROCESSING row always carries a task id and a start timestamp. This is
/// the only code path that sets PROCESSING.
#[tracing::instrument(skip(pool))]
pub async fn lease(limit: i64, pool: &sqlx::PgPool) -> sqlx::Result<Vec<Response>> {
    let mut txn = pool.begin().await?;

    let picked = sqlx::query_as::<_, Response>(&format!(
        r#"
        SELECT {RESPONSE_COLUMNS} FROM llm_responses
        WHERE status = 'QUEUED'
        ORDER BY id
        LIMIT $1
        FOR UPDATE SKIP LOCKED
        "#,
    ))
    .bind(limit)
    .fetch_all(&mut *txn)
    .await?;

    let mut leased = Vec::with_capacity(picked.len());
    for mut row in picked {
        let task_id = format!("lease_{}", uuid::Uuid::new_v4());
        let started = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            UPDATE llm_responses
            SET status = 'PROCESSING', task_id = $2, started_processing_at = NOW()
            WHERE id = $1
            RETURNING started_processing_at
            "#,
        )
        .bind(row.id)
        .bind(&task_id)
        .fetch_one(&mut *txn)
        .await?;

        row.status = ResponseStatus::Processing;
        row.task_id = Some(task_id);
        row.started_processing_at = Some(started);
        leased.push(row);
    }

    txn.commit().await?;
    Ok(leased)
}

/// Replace the synthetic lease task id with the remote task handle.
pub async fn assign_remote_task(
    id: i64,
    remote_task_id: &str,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<bool> {
    let updated = sqlx::query(
        "UPDATE llm_responses SET task_id = $2 WHERE id = $1 AND status = 'PROCESSING'",
    )
    .bind(id)
    .bind(remote_task_id)
    .execute(db)
    .await?;
    Ok(updated.rows_affected() == 1)
}

/// Record a successful remote result. Guarded on PROCESSING so that a
/// completion racing a batch reset (row deleted) or the reaper (row timed
/// out) becomes a no-op; the caller observes false and discards the result.
pub async fn complete(
    id: i64,
    response_text: &str,
    response_json: Option<&str>,
    input_tokens: Option<i32>,
    output_tokens: Option<i32>,
    time_taken_seconds: Option<f64>,
    tokens_per_second: Option<f64>,
    overall_score: Option<f64>,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<bool> {
    let updated = sqlx::query(
        r#"
        UPDATE llm_responses SET
            status = 'COMPLETED',
            response_text = $2,
            response_json = $3,
            input_tokens = $4,
            output_tokens = $5,
            time_taken_seconds = $6,
            tokens_per_second = $7,
            overall_score = $8,
            completed_processing_at = NOW()
        WHERE id = $1 AND status = 'PROCESSING'
        "#,
    )
    .bind(id)
    .bind(response_text)
    .bind(response_json)
    .bind(input_tokens)
    .bind(output_tokens)
    .bind(time_taken_seconds)
    .bind(tokens_per_second)
    .bind(overall_score)
    .execute(db)
    .await?;
    Ok(updated.rows_affected() == 1)
}

/// Record a remote or local failure. Same PROCESSING guard as `complete`.
pub async fn fail(
    id: i64,
    error_message: &str,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<bool> {
    let updated = sqlx::query(
        r#"
        UPDATE llm_responses SET
            status = 'FAILED', error_message = $2, completed_processing_at = NOW()
        WHERE id = $1 AND status = 'PROCESSING'
        "#,
    )
    .bind(id)
    .bind(error_message)
    .execute(db)
    .await?;
    Ok(updated.rows_affected() == 1)
}

/// Return a leased row to the queue untouched. Used when the connection's
/// circuit breaker is open and the work should not be attempted yet.
pub async fn release(id: i64, db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<bool> {
    let updated = sqlx::query(
        r#"
        UPDATE llm_responses SET
            status = 'QUEUED', task_id = NULL, started_processing_at = NULL
        WHERE id = $1 AND status = 'PROCESSING'
        "#,
    )
    .bind(id)
    .execute(db)
    .await?;
    Ok(updated.rows_affected() == 1)
}

/// The stuck-task reaper: PROCESSING rows older than the timeout flip to
/// TIMEOUT. Returns the affected (response id, batch id) pairs so the
/// caller can run the batch fan-in for each.
pub async fn reap_stuck(
    timeout: std::time::Duration,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Vec<(i64, i32)>> {
    let rows = sqlx::query_as::<_, (i64, i32)>(
        r#"
        UPDATE llm_responses SET
            status = 'TIMEOUT',
            error_message = 'task exceeded the processing deadline and was reaped',
            completed_processing_at = NOW()
        WHERE status = 'PROCESSING'
          AND started_processing_at < NOW() - make_interval(secs => $1)
        RETURNING id, batch_id
        "#,
    )
    .bind(timeout.as_secs_f64())
    .fetch_all(db)
    .await?;
    Ok(rows)
}

/// Startup recovery: mark stuck-PROCESSING rows FAILED with a distinct
/// recovery-marker message. Unlike the reaper this also catches rows whose
/// start timestamp was never written.
pub async fn fail_stuck_for_recovery(
    timeout: std::time::Duration,
    marker: &str,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<u64> {
    let updated = sqlx::query(
        r#"
        UPDATE llm_responses SET
            status = 'FAILED', error_message = $2, completed_processing_at = NOW()
        WHERE status = 'PROCESSING'
          AND (started_processing_at IS NULL
               OR started_processing_at < NOW() - make_interval(secs => $1))
        "#,
    )
    .bind(timeout.as_secs_f64())
    .bind(marker)
    .execute(db)
    .await?;
    Ok(updated.rows_affected())
}

pub async fn status_counts(
    batch_id: i32,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<StatusCounts> {
    sqlx::query_as::<_, StatusCounts>(
        r#"
        SELECT
            COUNT(*) AS total,
            COUNT(*) FILTER (WHERE status = 'QUEUED') AS queued,
            COUNT(*) FILTER (WHERE status = 'PROCESSING') AS processing,
            COUNT(*) FILTER (WHERE status = 'COMPLETED') AS completed,
            COUNT(*) FILTER (WHERE status = 'FAILED') AS failed,
            COUNT(*) FILTER (WHERE status = 'TIMEOUT') AS timeout
        FROM llm_responses WHERE batch_id = $1
        "#,
    )
    .bind(batch_id)
    .fetch_one(db)
    .await
}

pub async fn fetch_by_batch(
    batch_id: i32,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Vec<Response>> {
    sqlx::query_as::<_, Response>(&format!(
        "SELECT {RESPONSE_COLUMNS} FROM llm_responses WHERE batch_id = $1 ORDER BY id"
    ))
    .bind(batch_id)
    .fetch_all(db)
    .await
}

/// Drop every response row of a batch. Part of batch reset; any still-active
/// dispatch for these rows becomes an orphan whose completion write no-ops.
pub async fn delete_by_batch(batch_id: i32, db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<u64> {
    let deleted = sqlx::query("DELETE FROM llm_responses WHERE batch_id = $1")
        .bind(batch_id)
        .execute(db)
        .await?;
    Ok(deleted.rows_affected())
}

/// Count of distinct documents with at least one terminal response, used to
/// maintain the batch's processed_documents projection.
pub async fn processed_document_count(
    batch_id: i32,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<i64> {
    sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COUNT(DISTINCT doc_id) FROM llm_responses
        WHERE batch_id = $1 AND status IN ('COMPLETED', 'FAILED', 'TIMEOUT')
        "#,
    )
    .bind(batch_id)
    .fetch_one(db)
    .await
}

pub async fn queued_depth(db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<i64> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM llm_responses WHERE status = 'QUEUED'")
        .fetch_one(db)
        .await
}

pub async fn processing_count(db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<i64> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM llm_responses WHERE status = 'PROCESSING'")
        .fetch_one(db)
        .await
}

pub async fn stuck_count(
    timeout: std::time::Duration,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<i64> {
    sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COUNT(*) FROM llm_responses
        WHERE status = 'PROCESSING'
          AND started_processing_at < NOW() - make_interval(secs => $1)
        "#,
    )
    .bind(timeout.as_secs_f64())
    .fetch_one(db)
    .await
}

pub async fn completed_last_hour(db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<i64> {
    sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COUNT(*) FROM llm_responses
        WHERE status = 'COMPLETED'
          AND completed_processing_at > NOW() - INTERVAL '1 hour'
        "#,
    )
    .fetch_one(db)
    .await
}

#[cfg(test)]
mod test {
    use super::StatusCounts;

    #[test]
    fn fan_in_predicate() {
        let counts = StatusCounts {
            total: 4,
            completed: 2,
            failed: 1,
            timeout: 1,
            ..Default::default()
        };
        assert!(counts.all_terminal());

        let counts = StatusCounts {
            total: 4,
            completed: 3,
            processing: 1,
            ..Default::default()
        };
        assert_eq!(counts.terminal(), 3);
        assert!(!counts.all_terminal());

        // An empty batch is never considered complete by the predicate;
        // recovery handles the zero-row case separately.
        assert!(!StatusCounts::default().all_terminal());
    }
}
