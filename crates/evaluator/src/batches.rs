//! Batch lifecycle operations: save, run, reset, delete-with-archive, and
//! the completion fan-in.

use anyhow::Context;
use models::BatchStatus;

/// Save a new batch from the user's selection, freezing the configuration
/// snapshot. Inactive connections cannot be selected; in-flight work on a
/// connection that is later deactivated still runs to completion.
pub async fn save(
    app: &crate::App,
    name: Option<&str>,
    description: Option<&str>,
    config: &crate::staging::ConfigSnapshot,
) -> anyhow::Result<eval_sql::batches::Batch> {
    anyhow::ensure!(
        !config.connection_ids.is_empty(),
        "a batch must select at least one connection"
    );
    anyhow::ensure!(
        !config.prompt_ids.is_empty(),
        "a batch must select at least one prompt"
    );

    for &connection_id in &config.connection_ids {
        let info = eval_sql::connections::fetch_info(connection_id, &app.catalog)
            .await?
            .with_context(|| format!("connection {connection_id} not found"))?;
        anyhow::ensure!(
            info.is_active,
            "connection {} ({}) is inactive and cannot be selected",
            info.id,
            info.name
        );
    }

    let folder_ids = serde_json::to_value(&config.folder_ids)?;
    let snapshot = serde_json::to_value(config)?;
    let batch =
        eval_sql::batches::create(name, description, &folder_ids, &snapshot, &app.catalog).await?;

    tracing::info!(
        batch_id = batch.id,
        batch_number = batch.batch_number,
        "saved batch"
    );
    Ok(batch)
}

/// Run a batch: STAGED flips to ANALYZING and the queue processor picks up
/// its QUEUED rows. Running a SAVED batch stages it first. Running never
/// re-creates response rows; staging idempotency guarantees that.
#[tracing::instrument(skip(app), err)]
pub async fn run(app: &crate::App, batch_id: i32) -> anyhow::Result<()> {
    let batch = eval_sql::batches::fetch(batch_id, &app.catalog)
        .await?
        .with_context(|| format!("batch {batch_id} not found"))?;

    match batch.status {
        BatchStatus::Saved => {
            crate::staging::stage(app, batch_id).await?;
        }
        BatchStatus::Staged => {}
        BatchStatus::Analyzing => return Ok(()), // Already running.
        other => anyhow::bail!("batch {batch_id} cannot run from status {other:?}"),
    }

    if !eval_sql::batches::mark_started(batch_id, &app.catalog).await? {
        // A concurrent run won the STAGED -> ANALYZING flip.
        tracing::debug!(batch_id, "batch was already started");
    }
    Ok(())
}

/// Reset a batch to SAVED: drop every response row in the work store and
/// release the batch's documents. Any still-active dispatch becomes an
/// orphan whose completion write finds no row and no-ops.
#[tracing::instrument(skip(app), err)]
pub async fn reset(app: &crate::App, batch_id: i32) -> anyhow::Result<u64> {
    let deleted = eval_sql::responses::delete_by_batch(batch_id, &app.work).await?;
    eval_sql::documents::unassign_batch(batch_id, &app.catalog).await?;
    eval_sql::batches::reset(batch_id, &app.catalog).await?;
    tracing::info!(batch_id, deleted, "batch reset to SAVED");
    Ok(deleted)
}

/// The completion fan-in, run after every terminal response write and by
/// the reaper. Recomputes the processed-documents projection and, when
/// every response is terminal, flips ANALYZING -> COMPLETED exactly once
/// (the conditional update makes concurrent observers race-safe).
pub async fn check_fan_in(app: &crate::App, batch_id: i32) -> anyhow::Result<bool> {
    let counts = eval_sql::responses::status_counts(batch_id, &app.work).await?;
    let processed =
        eval_sql::responses::processed_document_count(batch_id, &app.work).await? as i32;

    if !counts.all_terminal() {
        eval_sql::batches::set_processed_documents(batch_id, processed, &app.catalog).await?;
        return Ok(false);
    }

    let completed = eval_sql::batches::mark_completed(batch_id, processed, &app.catalog).await?;
    if completed {
        tracing::info!(
            batch_id,
            completed = counts.completed,
            failed = counts.failed,
            timeout = counts.timeout,
            "batch completed"
        );
    }
    Ok(completed)
}

/// Delete a batch, archiving its full state first: the batch row, its
/// document rows, and its response rows are serialized into one
/// batch_archive record so the history survives the deletion.
#[tracing::instrument(skip(app), err)]
pub async fn delete(app: &crate::App, batch_id: i32, archived_by: &str) -> anyhow::Result<()> {
    let batch = eval_sql::batches::fetch(batch_id, &app.catalog)
        .await?
        .with_context(|| format!("batch {batch_id} not found"))?;

    let documents = eval_sql::documents::fetch_by_batch(batch_id, &app.catalog).await?;
    let responses = eval_sql::responses::fetch_by_batch(batch_id, &app.work).await?;

    let batch_data = serde_json::json!({
        "id": batch.id,
        "batch_number": batch.batch_number,
        "batch_name": batch.batch_name,
        "description": batch.description,
        "status": batch.status,
        "folder_ids": batch.folder_ids,
        "config_snapshot": batch.config_snapshot,
        "total_documents": batch.total_documents,
        "processed_documents": batch.processed_documents,
        "created_at": batch.created_at,
        "started_at": batch.started_at,
        "completed_at": batch.completed_at,
    });
    let documents_data = serde_json::to_value(
        documents
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id,
                    "filepath": d.filepath,
                    "filename": d.filename,
                    "valid": d.valid,
                    "encoded_body_id": d.encoded_body_id,
                })
            })
            .collect::<Vec<_>>(),
    )?;
    let responses_data = serde_json::to_value(
        responses
            .iter()
            .map(|r| {
                serde_json::json!({
                    "id": r.id,
                    "doc_id": r.doc_id,
                    "prompt_id": r.prompt_id,
                    "connection_id": r.connection_id,
                    "status": r.status,
                    "overall_score": r.overall_score,
                    "input_tokens": r.input_tokens,
                    "output_tokens": r.output_tokens,
                    "error_message": r.error_message,
                    "connection_details": r.connection_details,
                })
            })
            .collect::<Vec<_>>(),
    )?;

    eval_sql::batches::insert_archive(
        &batch,
        archived_by,
        "batch deletion",
        &batch_data,
        &documents_data,
        &responses_data,
        &app.catalog,
    )
    .await?;

    eval_sql::responses::delete_by_batch(batch_id, &app.work).await?;
    eval_sql::documents::unassign_batch(batch_id, &app.catalog).await?;
    eval_sql::batches::delete(batch_id, &app.catalog).await?;

    tracing::info!(batch_id, responses = responses.len(), "batch archived and deleted");
    Ok(())
}
