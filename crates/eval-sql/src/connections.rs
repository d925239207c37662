use chrono::{DateTime, Utc};
use models::ConnectionState;

/// A connection joined with its provider and model rows, as consumed by the
/// config formatter and the snapshot capture. The secret is carried here but
/// is never included in snapshots.
#[derive(Debug, serde::Serialize, sqlx::FromRow)]
pub struct ConnectionInfo {
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
    pub base_url: Option<String>,
    pub port_no: Option<i32>,
    /// Never serialized: snapshots and API responses must not leak secrets.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub is_active: bool,
    pub connection_status: ConnectionState,
    pub last_tested: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub provider_id: Option<i32>,
    pub provider_type: Option<String>,
    pub provider_name: Option<String>,
    pub model_id: Option<i32>,
    pub model_name: Option<String>,
    pub model_identifier: Option<String>,
}

const INFO_QUERY: &str = r#"
    SELECT
        c.id, c.name, c.description, c.base_url, c.port_no, c.api_key,
        c.is_active, c.connection_status, c.last_tested, c.created_at,
        p.id AS provider_id, p.provider_type, p.name AS provider_name,
        m.id AS model_id, m.display_name AS model_name, m.common_name AS model_identifier
    FROM connections c
    LEFT JOIN llm_providers p ON c.provider_id = p.id
    LEFT JOIN models m ON c.model_id = m.id
"#;

pub async fn fetch_info(
    id: i32,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Option<ConnectionInfo>> {
    sqlx::query_as::<_, ConnectionInfo>(&format!("{INFO_QUERY} WHERE c.id = $1"))
        .bind(id)
        .fetch_optional(db)
        .await
}

pub async fn list(db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<Vec<ConnectionInfo>> {
    sqlx::query_as::<_, ConnectionInfo>(&format!("{INFO_QUERY} ORDER BY c.id"))
        .fetch_all(db)
        .await
}

/// Resolve a model id to its display name, for connections that carry only
/// the reference.
pub async fn resolve_model_name(
    model_id: i32,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Option<String>> {
    sqlx::query_scalar::<_, String>("SELECT display_name FROM models WHERE id = $1")
        .bind(model_id)
        .fetch_optional(db)
        .await
}

#[derive(Debug, serde::Serialize, sqlx::FromRow)]
pub struct Provider {
    pub id: i32,
    pub name: String,
    pub provider_type: String,
    pub default_base_url: Option<String>,
}

#[derive(Debug, serde::Serialize, sqlx::FromRow)]
pub struct Model {
    pub id: i32,
    pub common_name: String,
    pub display_name: String,
}

pub async fn list_providers(db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<Vec<Provider>> {
    sqlx::query_as::<_, Provider>(
        "SELECT id, name, provider_type, default_base_url FROM llm_providers ORDER BY id",
    )
    .fetch_all(db)
    .await
}

pub async fn list_models(db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<Vec<Model>> {
    sqlx::query_as::<_, Model>("SELECT id, common_name, display_name FROM models ORDER BY id")
        .fetch_all(db)
        .await
}

/// Create a connection. The secret is stored as given and only ever leaves
/// this table inside an outbound wire config.
pub async fn create(
    name: &str,
    description: Option<&str>,
    provider_id: i32,
    model_id: Option<i32>,
    base_url: Option<&str>,
    port_no: Option<i32>,
    api_key: Option<&str>,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<i32> {
    sqlx::query_scalar::<_, i32>(
        r#"
        INSERT INTO connections
            (name, description, provider_id, model_id, base_url, port_no, api_key)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id
        "#,
    )
    .bind(name)
    .bind(description)
    .bind(provider_id)
    .bind(model_id)
    .bind(base_url)
    .bind(port_no)
    .bind(api_key)
    .fetch_one(db)
    .await
}

/// Flip a connection's active flag. Deactivation only blocks new batch
/// selections; responses already staged against it still run.
pub async fn set_active(
    id: i32,
    is_active: bool,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<bool> {
    let updated = sqlx::query("UPDATE connections SET is_active = $2 WHERE id = $1")
        .bind(id)
        .bind(is_active)
        .execute(db)
        .await?;
    Ok(updated.rows_affected() == 1)
}

/// Persist the outcome of a reachability probe.
pub async fn record_test_result(
    id: i32,
    state: ConnectionState,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE connections SET connection_status = $2, last_tested = NOW() WHERE id = $1")
        .bind(id)
        .bind(state)
        .execute(db)
        .await?;
    Ok(())
}
