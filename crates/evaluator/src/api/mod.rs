//! HTTP surface: CRUD over the catalog entities, batch lifecycle verbs,
//! queue control, and the monitoring projections. Long-running starts
//! return 202 and proceed in the background.

mod error;

pub use error::ApiError;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

/// Shared state behind every handler.
pub struct AppState {
    pub app: crate::App,
    pub processor: Arc<crate::processor::Processor>,
    pub document_types: Arc<crate::preprocess::DocumentTypeCache>,
}

type ApiState = State<Arc<AppState>>;
type ApiResult<T> = Result<T, ApiError>;

pub fn build_router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/health", get(health))
        .route("/folders", get(list_folders).post(create_folder))
        .route("/folders/:id", get(get_folder).delete(delete_folder))
        .route("/folders/:id/preprocess", post(preprocess_folder))
        .route("/documents/:id", get(get_document))
        .route("/document-types", get(list_document_types))
        .route("/document-types/refresh", post(refresh_document_types))
        .route("/providers", get(list_providers))
        .route("/models", get(list_models))
        .route("/connections", get(list_connections).post(create_connection))
        .route("/connections/:id/activate", post(activate_connection))
        .route("/connections/:id/deactivate", post(deactivate_connection))
        .route("/connections/:id/test", post(test_connection))
        .route("/prompts", get(list_prompts).post(create_prompt))
        .route("/batches", get(list_batches).post(create_batch))
        .route("/batches/:id", get(get_batch).delete(delete_batch))
        .route("/batches/:id/stage", post(stage_batch))
        .route("/batches/:id/run", post(run_batch))
        .route("/batches/:id/reset", post(reset_batch))
        .route("/batches/:id/responses", get(batch_responses))
        .route("/monitoring/batches/:id", get(batch_progress))
        .route("/monitoring/system", get(system_status))
        .route("/queue/status", get(queue_status))
        .route("/queue/start", post(queue_start))
        .route("/queue/stop", post(queue_stop))
        .route("/queue/restart", post(queue_restart))
        .route("/maintenance/recovery/run", post(run_recovery))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): ApiState) -> Json<crate::monitor::Health> {
    Json(crate::monitor::health(&state.app).await)
}

// Folders.

#[derive(Deserialize)]
struct CreateFolder {
    folder_path: String,
    folder_name: String,
}

async fn list_folders(State(state): ApiState) -> ApiResult<Json<Vec<eval_sql::folders::Folder>>> {
    Ok(Json(eval_sql::folders::list(&state.app.catalog).await?))
}

async fn create_folder(
    State(state): ApiState,
    Json(body): Json<CreateFolder>,
) -> ApiResult<(StatusCode, Json<eval_sql::folders::Folder>)> {
    if body.folder_path.is_empty() {
        return Err(ApiError::BadRequest("folder_path is required".to_string()));
    }
    let folder = eval_sql::folders::upsert(&body.folder_path, &body.folder_name, &state.app.catalog)
        .await?;
    Ok((StatusCode::CREATED, Json(folder)))
}

async fn get_folder(
    State(state): ApiState,
    Path(id): Path<i32>,
) -> ApiResult<Json<eval_sql::folders::Folder>> {
    eval_sql::folders::fetch(id, &state.app.catalog)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("folder {id}")))
}

/// Kick off preprocessing in the background and return 202 immediately; the
/// folder's status reflects progress.
async fn preprocess_folder(
    State(state): ApiState,
    Path(id): Path<i32>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let folder = eval_sql::folders::fetch(id, &state.app.catalog)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("folder {id}")))?;

    let app = state.app.clone();
    let types = state.document_types.clone();
    tokio::spawn(async move {
        if let Err(err) = crate::preprocess::preprocess_folder(&app, &types, id).await {
            tracing::error!(folder_id = id, ?err, "background preprocessing failed");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "folder_id": folder.id,
            "status": "PREPROCESSING",
        })),
    ))
}

/// Remove a folder and its whole document inventory. Encoded bodies in the
/// work store are left behind; response rows referencing them keep working.
async fn delete_folder(
    State(state): ApiState,
    Path(id): Path<i32>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut conn = state.app.catalog.acquire().await?;
    eval_sql::folders::delete(id, &mut *conn).await?;
    Ok(Json(serde_json::json!({ "folder_id": id, "deleted": true })))
}

async fn get_document(
    State(state): ApiState,
    Path(id): Path<i32>,
) -> ApiResult<Json<eval_sql::documents::Document>> {
    eval_sql::documents::fetch(id, &state.app.catalog)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("document {id}")))
}

// Document types.

async fn list_document_types(
    State(state): ApiState,
) -> ApiResult<Json<Vec<eval_sql::document_types::DocumentType>>> {
    Ok(Json(
        eval_sql::document_types::list(&state.app.catalog).await?,
    ))
}

async fn refresh_document_types(
    State(state): ApiState,
) -> ApiResult<Json<serde_json::Value>> {
    let count = state
        .document_types
        .refresh(&state.app.catalog)
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(serde_json::json!({ "valid_extensions": count })))
}

// Connections.

#[derive(Deserialize)]
struct CreateConnection {
    name: String,
    description: Option<String>,
    provider_id: i32,
    model_id: Option<i32>,
    base_url: Option<String>,
    port_no: Option<i32>,
    api_key: Option<String>,
}

async fn list_providers(
    State(state): ApiState,
) -> ApiResult<Json<Vec<eval_sql::connections::Provider>>> {
    Ok(Json(
        eval_sql::connections::list_providers(&state.app.catalog).await?,
    ))
}

async fn list_models(
    State(state): ApiState,
) -> ApiResult<Json<Vec<eval_sql::connections::Model>>> {
    Ok(Json(
        eval_sql::connections::list_models(&state.app.catalog).await?,
    ))
}

async fn list_connections(
    State(state): ApiState,
) -> ApiResult<Json<Vec<eval_sql::connections::ConnectionInfo>>> {
    Ok(Json(eval_sql::connections::list(&state.app.catalog).await?))
}

async fn create_connection(
    State(state): ApiState,
    Json(body): Json<CreateConnection>,
) -> ApiResult<(StatusCode, Json<eval_sql::connections::ConnectionInfo>)> {
    if body.name.is_empty() {
        return Err(ApiError::BadRequest("name is required".to_string()));
    }
    let id = eval_sql::connections::create(
        &body.name,
        body.description.as_deref(),
        body.provider_id,
        body.model_id,
        body.base_url.as_deref(),
        body.port_no,
        body.api_key.as_deref(),
        &state.app.catalog,
    )
    .await?;
    let info = eval_sql::connections::fetch_info(id, &state.app.catalog)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("connection {id}")))?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn activate_connection(
    State(state): ApiState,
    Path(id): Path<i32>,
) -> ApiResult<Json<serde_json::Value>> {
    set_connection_active(&state, id, true).await
}

async fn deactivate_connection(
    State(state): ApiState,
    Path(id): Path<i32>,
) -> ApiResult<Json<serde_json::Value>> {
    set_connection_active(&state, id, false).await
}

async fn set_connection_active(
    state: &AppState,
    id: i32,
    is_active: bool,
) -> ApiResult<Json<serde_json::Value>> {
    if !eval_sql::connections::set_active(id, is_active, &state.app.catalog).await? {
        return Err(ApiError::not_found(format!("connection {id}")));
    }
    Ok(Json(serde_json::json!({
        "connection_id": id,
        "is_active": is_active,
    })))
}

/// Probe a connection's composed base URL and persist the outcome.
async fn test_connection(
    State(state): ApiState,
    Path(id): Path<i32>,
) -> ApiResult<Json<serde_json::Value>> {
    let info = eval_sql::connections::fetch_info(id, &state.app.catalog)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("connection {id}")))?;

    let url = crate::format::compose_base_url(info.base_url.as_deref().unwrap_or(""), info.port_no);
    let reachable = state.app.rpc.probe(&url).await;
    let result = if reachable {
        models::ConnectionState::Connected
    } else {
        models::ConnectionState::Failed
    };
    eval_sql::connections::record_test_result(id, result, &state.app.catalog).await?;
    Ok(Json(serde_json::json!({
        "connection_id": id,
        "connection_status": result,
    })))
}

// Prompts.

#[derive(Deserialize)]
struct CreatePrompt {
    prompt_text: String,
    description: Option<String>,
}

async fn list_prompts(State(state): ApiState) -> ApiResult<Json<Vec<eval_sql::prompts::Prompt>>> {
    Ok(Json(eval_sql::prompts::list(&state.app.catalog).await?))
}

async fn create_prompt(
    State(state): ApiState,
    Json(body): Json<CreatePrompt>,
) -> ApiResult<(StatusCode, Json<eval_sql::prompts::Prompt>)> {
    if body.prompt_text.is_empty() {
        return Err(ApiError::BadRequest("prompt_text is required".to_string()));
    }
    let prompt = eval_sql::prompts::create(
        &body.prompt_text,
        body.description.as_deref(),
        &state.app.catalog,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(prompt)))
}

// Batches.

#[derive(Deserialize)]
struct CreateBatch {
    batch_name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    folder_ids: Vec<i32>,
    connection_ids: Vec<i32>,
    prompt_ids: Vec<i32>,
}

async fn list_batches(State(state): ApiState) -> ApiResult<Json<Vec<eval_sql::batches::Batch>>> {
    Ok(Json(eval_sql::batches::list(&state.app.catalog).await?))
}

async fn create_batch(
    State(state): ApiState,
    Json(body): Json<CreateBatch>,
) -> ApiResult<(StatusCode, Json<eval_sql::batches::Batch>)> {
    let config = crate::staging::ConfigSnapshot {
        folder_ids: body.folder_ids,
        connection_ids: body.connection_ids,
        prompt_ids: body.prompt_ids,
    };
    let batch = crate::batches::save(
        &state.app,
        body.batch_name.as_deref(),
        body.description.as_deref(),
        &config,
    )
    .await
    .map_err(|err| ApiError::BadRequest(format!("{err:#}")))?;
    Ok((StatusCode::CREATED, Json(batch)))
}

async fn get_batch(
    State(state): ApiState,
    Path(id): Path<i32>,
) -> ApiResult<Json<eval_sql::batches::Batch>> {
    eval_sql::batches::fetch(id, &state.app.catalog)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("batch {id}")))
}

async fn delete_batch(
    State(state): ApiState,
    Path(id): Path<i32>,
) -> ApiResult<Json<serde_json::Value>> {
    crate::batches::delete(&state.app, id, "api").await?;
    Ok(Json(serde_json::json!({ "batch_id": id, "deleted": true })))
}

async fn stage_batch(
    State(state): ApiState,
    Path(id): Path<i32>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let app = state.app.clone();
    tokio::spawn(async move {
        if let Err(err) = crate::staging::stage(&app, id).await {
            tracing::error!(batch_id = id, ?err, "background staging failed");
        }
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "batch_id": id, "status": "STAGING" })),
    ))
}

async fn run_batch(
    State(state): ApiState,
    Path(id): Path<i32>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let app = state.app.clone();
    tokio::spawn(async move {
        if let Err(err) = crate::batches::run(&app, id).await {
            tracing::error!(batch_id = id, ?err, "background run failed");
        }
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "batch_id": id, "status": "ANALYZING" })),
    ))
}

async fn reset_batch(
    State(state): ApiState,
    Path(id): Path<i32>,
) -> ApiResult<Json<serde_json::Value>> {
    let deleted = crate::batches::reset(&state.app, id).await?;
    Ok(Json(serde_json::json!({
        "batch_id": id,
        "status": "SAVED",
        "responses_deleted": deleted,
    })))
}

async fn batch_responses(
    State(state): ApiState,
    Path(id): Path<i32>,
) -> ApiResult<Json<Vec<eval_sql::responses::Response>>> {
    Ok(Json(
        eval_sql::responses::fetch_by_batch(id, &state.app.work).await?,
    ))
}

// Monitoring.

async fn batch_progress(
    State(state): ApiState,
    Path(id): Path<i32>,
) -> ApiResult<Json<crate::monitor::BatchProgress>> {
    crate::monitor::batch_progress(&state.app, id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("batch {id}")))
}

async fn system_status(State(state): ApiState) -> Json<crate::monitor::SystemStatus> {
    let timeout = state.processor.config().task_timeout;
    Json(crate::monitor::system_status(&state.app, timeout).await)
}

// Queue control.

async fn queue_status(State(state): ApiState) -> Json<crate::processor::ProcessorStatus> {
    Json(state.processor.status())
}

async fn queue_start(State(state): ApiState) -> StatusCode {
    state.processor.start();
    StatusCode::ACCEPTED
}

async fn queue_stop(State(state): ApiState) -> StatusCode {
    state.processor.stop().await;
    StatusCode::OK
}

async fn queue_restart(State(state): ApiState) -> StatusCode {
    state.processor.restart().await;
    StatusCode::ACCEPTED
}

// Maintenance.

async fn run_recovery(State(state): ApiState) -> ApiResult<Json<crate::recovery::RecoveryReport>> {
    let timeout = state.processor.config().task_timeout;
    let report = crate::recovery::run(&state.app, timeout).await?;
    Ok(Json(report))
}
