use chrono::{DateTime, Utc};
use models::FolderStatus;

#[derive(Debug, serde::Serialize, sqlx::FromRow)]
pub struct Folder {
    pub id: i32,
    pub folder_path: String,
    pub folder_name: Option<String>,
    pub status: FolderStatus,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Create a folder record, or re-name an existing record for the same path.
/// The status of an existing folder is left untouched; preprocessing owns it.
pub async fn upsert(
    path: &str,
    name: &str,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Folder> {
    sqlx::query_as::<_, Folder>(
        r#"
        INSERT INTO folders (folder_path, folder_name, status, active)
        VALUES ($1, $2, 'NOT_PROCESSED', TRUE)
        ON CONFLICT (folder_path) DO UPDATE SET folder_name = EXCLUDED.folder_name
        RETURNING id, folder_path, folder_name, status, active, created_at
        "#,
    )
    .bind(path)
    .bind(name)
    .fetch_one(db)
    .await
}

pub async fn fetch(id: i32, db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<Option<Folder>> {
    sqlx::query_as::<_, Folder>(
        "SELECT id, folder_path, folder_name, status, active, created_at
         FROM folders WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(db)
    .await
}

pub async fn list(db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<Vec<Folder>> {
    sqlx::query_as::<_, Folder>(
        "SELECT id, folder_path, folder_name, status, active, created_at
         FROM folders ORDER BY id",
    )
    .fetch_all(db)
    .await
}

/// Conditionally advance a folder's status. Returns false if the folder was
/// not in `from`, in which case a concurrent actor won the transition.
pub async fn transition(
    id: i32,
    from: FolderStatus,
    to: FolderStatus,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<bool> {
    let updated = sqlx::query("UPDATE folders SET status = $3 WHERE id = $1 AND status = $2")
        .bind(id)
        .bind(from)
        .bind(to)
        .execute(db)
        .await?;
    Ok(updated.rows_affected() == 1)
}

/// Force a folder's status, regardless of its prior state. Used by the
/// preprocessor's error path and by explicit re-preprocess requests.
pub async fn set_status(
    id: i32,
    status: FolderStatus,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE folders SET status = $2 WHERE id = $1")
        .bind(id)
        .bind(status)
        .execute(db)
        .await?;
    Ok(())
}

/// Delete a folder and every document observed under it.
pub async fn delete(id: i32, db: &mut sqlx::PgConnection) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM documents WHERE folder_id = $1")
        .bind(id)
        .execute(&mut *db)
        .await?;
    sqlx::query("DELETE FROM folders WHERE id = $1")
        .bind(id)
        .execute(&mut *db)
        .await?;
    Ok(())
}
