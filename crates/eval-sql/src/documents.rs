use chrono::{DateTime, Utc};
use models::Validity;

#[derive(Debug, serde::Serialize, sqlx::FromRow)]
pub struct Document {
    pub id: i32,
    pub folder_id: i32,
    pub filepath: String,
    pub filename: String,
    pub valid: Validity,
    pub batch_id: Option<i32>,
    pub task_id: Option<String>,
    /// Work-store body id, stored by value; the stores share no foreign keys.
    pub encoded_body_id: Option<i64>,
    pub meta_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Record one scanned file, with the validation verdict and its reason in
/// the metadata bag. Re-preprocessing the same path replaces the verdict and
/// drops any stale batch assignment.
pub async fn upsert(
    folder_id: i32,
    filepath: &str,
    filename: &str,
    valid: Validity,
    meta_data: &serde_json::Value,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<i32> {
    sqlx::query_scalar::<_, i32>(
        r#"
        INSERT INTO documents (folder_id, filepath, filename, valid, meta_data)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (filepath) DO UPDATE SET
            folder_id = EXCLUDED.folder_id,
            filename = EXCLUDED.filename,
            valid = EXCLUDED.valid,
            meta_data = EXCLUDED.meta_data,
            batch_id = NULL,
            task_id = NULL,
            encoded_body_id = NULL
        RETURNING id
        "#,
    )
    .bind(folder_id)
    .bind(filepath)
    .bind(filename)
    .bind(valid)
    .bind(meta_data)
    .fetch_one(db)
    .await
}

pub async fn fetch(id: i32, db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<Option<Document>> {
    sqlx::query_as::<_, Document>(
        "SELECT id, folder_id, filepath, filename, valid, batch_id, task_id, encoded_body_id, meta_data, created_at
         FROM documents WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(db)
    .await
}

pub async fn fetch_by_batch(
    batch_id: i32,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Vec<Document>> {
    sqlx::query_as::<_, Document>(
        "SELECT id, folder_id, filepath, filename, valid, batch_id, task_id, encoded_body_id, meta_data, created_at
         FROM documents WHERE batch_id = $1 ORDER BY id",
    )
    .bind(batch_id)
    .fetch_all(db)
    .await
}

/// Assign every valid, unassigned document of the given folders to a batch.
/// Invalid documents are never assigned. Returns the number assigned.
pub async fn assign_unassigned(
    folder_ids: &[i32],
    batch_id: i32,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<u64> {
    let updated = sqlx::query(
        r#"
        UPDATE documents SET batch_id = $2
        WHERE folder_id = ANY($1) AND batch_id IS NULL AND valid = 'Y'
        "#,
    )
    .bind(folder_ids)
    .bind(batch_id)
    .execute(db)
    .await?;
    Ok(updated.rows_affected())
}

/// Release every document of a batch. Part of batch reset.
pub async fn unassign_batch(batch_id: i32, db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<u64> {
    let updated =
        sqlx::query("UPDATE documents SET batch_id = NULL, task_id = NULL WHERE batch_id = $1")
            .bind(batch_id)
            .execute(db)
            .await?;
    Ok(updated.rows_affected())
}

/// Link a document to its encoded body in the work store.
pub async fn set_encoded_body(
    id: i32,
    encoded_body_id: i64,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE documents SET encoded_body_id = $2 WHERE id = $1")
        .bind(id)
        .bind(encoded_body_id)
        .execute(db)
        .await?;
    Ok(())
}

/// Record the latest dispatch task handle observed for a document.
pub async fn set_task_id(
    id: i32,
    task_id: &str,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE documents SET task_id = $2 WHERE id = $1")
        .bind(id)
        .bind(task_id)
        .execute(db)
        .await?;
    Ok(())
}
