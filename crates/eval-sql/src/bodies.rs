use chrono::{DateTime, Utc};

/// One encoded document body in the work store. Content is base64 text whose
/// length is always a multiple of four; the row is immutable once written
/// except through a full re-encode of the same document key.
#[derive(Debug, sqlx::FromRow)]
pub struct EncodedBody {
    pub id: i64,
    pub document_id: String,
    pub content: String,
    pub content_type: Option<String>,
    pub doc_type: Option<String>,
    pub file_size: i64,
    pub encoding: String,
    pub created_at: DateTime<Utc>,
}

/// Upsert the encoded body for a document key, replacing any prior encode.
pub async fn upsert(
    document_id: &str,
    content: &str,
    content_type: &str,
    doc_type: &str,
    file_size: i64,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<i64> {
    sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO docs (document_id, content, content_type, doc_type, file_size, encoding)
        VALUES ($1, $2, $3, $4, $5, 'base64')
        ON CONFLICT (document_id) DO UPDATE SET
            content = EXCLUDED.content,
            content_type = EXCLUDED.content_type,
            doc_type = EXCLUDED.doc_type,
            file_size = EXCLUDED.file_size,
            created_at = NOW()
        RETURNING id
        "#,
    )
    .bind(document_id)
    .bind(content)
    .bind(content_type)
    .bind(doc_type)
    .bind(file_size)
    .fetch_one(db)
    .await
}

pub async fn fetch(id: i64, db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<Option<EncodedBody>> {
    sqlx::query_as::<_, EncodedBody>(
        "SELECT id, document_id, content, content_type, doc_type, file_size, encoding, created_at
         FROM docs WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(db)
    .await
}

pub async fn fetch_by_document_id(
    document_id: &str,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Option<i64>> {
    sqlx::query_scalar::<_, i64>("SELECT id FROM docs WHERE document_id = $1")
        .bind(document_id)
        .fetch_optional(db)
        .await
}
