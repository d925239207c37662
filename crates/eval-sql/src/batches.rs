use chrono::{DateTime, Utc};
use models::BatchStatus;

#[derive(Debug, serde::Serialize, sqlx::FromRow)]
pub struct Batch {
    pub id: i32,
    pub batch_number: i32,
    pub batch_name: Option<String>,
    pub description: Option<String>,
    pub folder_ids: Option<serde_json::Value>,
    pub config_snapshot: Option<serde_json::Value>,
    pub status: BatchStatus,
    pub total_documents: i32,
    pub processed_documents: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

const BATCH_COLUMNS: &str = "id, batch_number, batch_name, description, folder_ids, \
     config_snapshot, status, total_documents, processed_documents, \
     created_at, started_at, completed_at";

/// Create a SAVED batch, assigning the next user-visible batch number.
/// The configuration snapshot is frozen at save time and is immutable once
/// the batch reaches STAGED.
pub async fn create(
    name: Option<&str>,
    description: Option<&str>,
    folder_ids: &serde_json::Value,
    config_snapshot: &serde_json::Value,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Batch> {
    sqlx::query_as::<_, Batch>(&format!(
        r#"
        INSERT INTO batches (batch_number, batch_name, description, folder_ids, config_snapshot, status)
        SELECT COALESCE(MAX(batch_number), 0) + 1, $1, $2, $3, $4, 'SAVED' FROM batches
        RETURNING {BATCH_COLUMNS}
        "#,
    ))
    .bind(name)
    .bind(description)
    .bind(folder_ids)
    .bind(config_snapshot)
    .fetch_one(db)
    .await
}

pub async fn fetch(id: i32, db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<Option<Batch>> {
    sqlx::query_as::<_, Batch>(&format!(
        "SELECT {BATCH_COLUMNS} FROM batches WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(db)
    .await
}

pub async fn list(db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<Vec<Batch>> {
    sqlx::query_as::<_, Batch>(&format!(
        "SELECT {BATCH_COLUMNS} FROM batches ORDER BY batch_number DESC"
    ))
    .fetch_all(db)
    .await
}

/// Batches whose status suggests in-flight work; inspected by recovery.
pub async fn fetch_inflight(db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<Vec<Batch>> {
    sqlx::query_as::<_, Batch>(&format!(
        "SELECT {BATCH_COLUMNS} FROM batches WHERE status IN ('STAGING', 'ANALYZING') ORDER BY id"
    ))
    .fetch_all(db)
    .await
}

/// Conditionally advance a batch. Returns false when the batch was not in
/// `from`; callers treat that as losing a race, not as an error.
pub async fn transition(
    id: i32,
    from: BatchStatus,
    to: BatchStatus,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<bool> {
    let updated = sqlx::query("UPDATE batches SET status = $3 WHERE id = $1 AND status = $2")
        .bind(id)
        .bind(from)
        .bind(to)
        .execute(db)
        .await?;
    Ok(updated.rows_affected() == 1)
}

/// Begin analysis: STAGED -> ANALYZING, stamping started_at.
pub async fn mark_started(id: i32, db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<bool> {
    let updated = sqlx::query(
        "UPDATE batches SET status = 'ANALYZING', started_at = NOW()
         WHERE id = $1 AND status = 'STAGED'",
    )
    .bind(id)
    .execute(db)
    .await?;
    Ok(updated.rows_affected() == 1)
}

/// Fan-in: flip ANALYZING -> COMPLETED exactly once.
///
/// The terminal/total comparison is made by the caller against the work
/// store; the `status = 'ANALYZING'` guard makes the flip race-safe when
/// several workers observe completion simultaneously.
pub async fn mark_completed(
    id: i32,
    processed_documents: i32,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<bool> {
    let updated = sqlx::query(
        r#"
        UPDATE batches SET status = 'COMPLETED', completed_at = NOW(), processed_documents = $2
        WHERE id = $1 AND status = 'ANALYZING'
        "#,
    )
    .bind(id)
    .bind(processed_documents)
    .execute(db)
    .await?;
    Ok(updated.rows_affected() == 1)
}

/// Reset a batch to SAVED, clearing run state. Legal from any status.
pub async fn reset(id: i32, db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE batches SET status = 'SAVED', started_at = NULL, completed_at = NULL,
            processed_documents = 0
        WHERE id = $1
        "#,
    )
    .bind(id)
    .execute(db)
    .await?;
    Ok(())
}

/// Force a status without a guard. Reserved for startup recovery, which runs
/// before any concurrent writer exists.
pub async fn force_status(
    id: i32,
    status: BatchStatus,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE batches SET status = $2 WHERE id = $1")
        .bind(id)
        .bind(status)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn clear_started(id: i32, db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<()> {
    sqlx::query("UPDATE batches SET started_at = NULL WHERE id = $1")
        .bind(id)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn stamp_completed_now(id: i32, db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<()> {
    sqlx::query("UPDATE batches SET completed_at = NOW() WHERE id = $1")
        .bind(id)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn set_total_documents(
    id: i32,
    total: i32,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE batches SET total_documents = $2 WHERE id = $1")
        .bind(id)
        .bind(total)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn set_processed_documents(
    id: i32,
    processed: i32,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE batches SET processed_documents = $2 WHERE id = $1")
        .bind(id)
        .bind(processed)
        .execute(db)
        .await?;
    Ok(())
}

/// Archive a batch ahead of deletion: the serialized batch, its documents,
/// and its (work store) responses, kept for audit after the rows are gone.
pub async fn insert_archive(
    batch: &Batch,
    archived_by: &str,
    reason: &str,
    batch_data: &serde_json::Value,
    documents_data: &serde_json::Value,
    responses_data: &serde_json::Value,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO batch_archive
            (original_batch_id, batch_number, batch_name, archived_by, archive_reason,
             batch_data, documents_data, responses_data)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(batch.id)
    .bind(batch.batch_number)
    .bind(batch.batch_name.as_deref())
    .bind(archived_by)
    .bind(reason)
    .bind(batch_data)
    .bind(documents_data)
    .bind(responses_data)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn delete(id: i32, db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM batches WHERE id = $1")
        .bind(id)
        .execute(db)
        .await?;
    Ok(())
}
