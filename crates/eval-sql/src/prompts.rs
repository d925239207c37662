use chrono::{DateTime, Utc};

#[derive(Debug, serde::Serialize, sqlx::FromRow)]
pub struct Prompt {
    pub id: i32,
    pub prompt_text: String,
    pub description: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

pub async fn create(
    prompt_text: &str,
    description: Option<&str>,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Prompt> {
    sqlx::query_as::<_, Prompt>(
        r#"
        INSERT INTO prompts (prompt_text, description, active)
        VALUES ($1, $2, TRUE)
        RETURNING id, prompt_text, description, active, created_at
        "#,
    )
    .bind(prompt_text)
    .bind(description)
    .fetch_one(db)
    .await
}

pub async fn fetch(id: i32, db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<Option<Prompt>> {
    sqlx::query_as::<_, Prompt>(
        "SELECT id, prompt_text, description, active, created_at FROM prompts WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(db)
    .await
}

pub async fn fetch_many(
    ids: &[i32],
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Vec<Prompt>> {
    sqlx::query_as::<_, Prompt>(
        "SELECT id, prompt_text, description, active, created_at
         FROM prompts WHERE id = ANY($1) ORDER BY id",
    )
    .bind(ids)
    .fetch_all(db)
    .await
}

pub async fn list(db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<Vec<Prompt>> {
    sqlx::query_as::<_, Prompt>(
        "SELECT id, prompt_text, description, active, created_at FROM prompts ORDER BY id",
    )
    .fetch_all(db)
    .await
}
