#[derive(Debug, serde::Serialize, sqlx::FromRow)]
pub struct DocumentType {
    pub id: i32,
    pub extension: String,
    pub mime_type: Option<String>,
    pub description: Option<String>,
    pub is_valid: bool,
}

pub async fn list(db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<Vec<DocumentType>> {
    sqlx::query_as::<_, DocumentType>(
        "SELECT id, extension, mime_type, description, is_valid
         FROM document_types ORDER BY extension",
    )
    .fetch_all(db)
    .await
}

/// The extension allow-list consulted by the folder preprocessor.
/// Extensions are stored lowercase with a leading dot, e.g. `.pdf`.
pub async fn valid_extensions(db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<Vec<String>> {
    sqlx::query_scalar::<_, String>(
        "SELECT extension FROM document_types WHERE is_valid ORDER BY extension",
    )
    .fetch_all(db)
    .await
}
