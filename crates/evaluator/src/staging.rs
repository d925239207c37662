//! Staging: materialize one QUEUED response slot per (document, prompt,
//! connection) triple implied by a batch's configuration snapshot.

use anyhow::Context;
use models::BatchStatus;
use serde::{Deserialize, Serialize};

/// The selection frozen onto a batch at save time. Immutable once the batch
/// reaches STAGED; later edits create a new batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub folder_ids: Vec<i32>,
    pub connection_ids: Vec<i32>,
    pub prompt_ids: Vec<i32>,
}

#[derive(Debug, Default, Serialize)]
pub struct StagingSummary {
    pub batch_id: i32,
    pub documents_staged: usize,
    pub responses_created: usize,
    pub total_responses: i64,
}

/// Stage a batch. Safe to call repeatedly and concurrently: the unique
/// (batch, doc, prompt, connection) index makes materialization idempotent,
/// and a caller that finds the batch already STAGING or STAGED returns
/// success without duplicating work.
#[tracing::instrument(skip(app), err)]
pub async fn stage(app: &crate::App, batch_id: i32) -> anyhow::Result<StagingSummary> {
    let batch = eval_sql::batches::fetch(batch_id, &app.catalog)
        .await?
        .with_context(|| format!("batch {batch_id} not found"))?;

    let entered = match batch.status {
        BatchStatus::Saved => {
            eval_sql::batches::transition(
                batch_id,
                BatchStatus::Saved,
                BatchStatus::Staging,
                &app.catalog,
            )
            .await?
        }
        BatchStatus::Staging | BatchStatus::Staged => {
            // A concurrent or prior staging owns (or finished) the work.
            let total = eval_sql::responses::status_counts(batch_id, &app.work)
                .await?
                .total;
            return Ok(StagingSummary {
                batch_id,
                total_responses: total,
                ..Default::default()
            });
        }
        // FAILED_STAGING and terminal states leave only through reset.
        other => anyhow::bail!("batch {batch_id} cannot be staged from status {other:?}"),
    };
    if !entered {
        // Lost the SAVED -> STAGING race; the winner stages.
        let total = eval_sql::responses::status_counts(batch_id, &app.work)
            .await?
            .total;
        return Ok(StagingSummary {
            batch_id,
            total_responses: total,
            ..Default::default()
        });
    }

    match materialize(app, batch_id, &batch).await {
        Ok(summary) => {
            eval_sql::batches::transition(
                batch_id,
                BatchStatus::Staging,
                BatchStatus::Staged,
                &app.catalog,
            )
            .await?;
            tracing::info!(
                batch_id,
                documents = summary.documents_staged,
                responses = summary.responses_created,
                "batch staged"
            );
            Ok(summary)
        }
        Err(err) => {
            eval_sql::batches::transition(
                batch_id,
                BatchStatus::Staging,
                BatchStatus::FailedStaging,
                &app.catalog,
            )
            .await?;
            Err(err)
        }
    }
}

async fn materialize(
    app: &crate::App,
    batch_id: i32,
    batch: &eval_sql::batches::Batch,
) -> anyhow::Result<StagingSummary> {
    let config: ConfigSnapshot = batch
        .config_snapshot
        .clone()
        .map(serde_json::from_value)
        .transpose()
        .context("decoding batch config_snapshot")?
        .with_context(|| format!("batch {batch_id} has no config_snapshot"))?;

    anyhow::ensure!(
        !config.connection_ids.is_empty() && !config.prompt_ids.is_empty(),
        "batch {batch_id} selects no connections or no prompts"
    );
    let prompts = eval_sql::prompts::fetch_many(&config.prompt_ids, &app.catalog).await?;
    anyhow::ensure!(
        prompts.len() == config.prompt_ids.len(),
        "batch {batch_id} references prompts that no longer exist"
    );

    // Assign documents from the batch's folders if none are assigned yet.
    let mut documents = eval_sql::documents::fetch_by_batch(batch_id, &app.catalog).await?;
    if documents.is_empty() && !config.folder_ids.is_empty() {
        let assigned =
            eval_sql::documents::assign_unassigned(&config.folder_ids, batch_id, &app.catalog)
                .await?;
        tracing::info!(batch_id, assigned, "assigned folder documents to batch");
        documents = eval_sql::documents::fetch_by_batch(batch_id, &app.catalog).await?;
    }
    anyhow::ensure!(
        !documents.is_empty(),
        "no valid documents available for batch {batch_id}"
    );
    eval_sql::batches::set_total_documents(batch_id, documents.len() as i32, &app.catalog).await?;

    // One frozen connection snapshot per connection, captured once and
    // shared across every slot that references it.
    let mut snapshots = Vec::with_capacity(config.connection_ids.len());
    for &connection_id in &config.connection_ids {
        snapshots.push((
            connection_id,
            crate::snapshot::capture(connection_id, &app.catalog).await,
        ));
    }

    let mut summary = StagingSummary {
        batch_id,
        ..Default::default()
    };

    for document in &documents {
        // The preprocessor normally linked a body already; encode here only
        // when no body exists yet, keyed by the batch-scoped convention.
        // One unencodable document (deleted or unreadable since its scan)
        // is logged and skipped rather than failing the whole batch.
        let body_id = match document.encoded_body_id {
            Some(id) => id,
            None => {
                let key = models::work_document_id(batch_id, document.id);
                let existing = eval_sql::bodies::fetch_by_document_id(&key, &app.work).await?;
                let encoded = match existing {
                    Some(id) => id,
                    None => {
                        match crate::encode::encode_and_store(&key, &document.filepath, &app.work)
                            .await
                        {
                            Ok(id) => id,
                            Err(err) => {
                                tracing::warn!(
                                    document_id = document.id,
                                    file = %document.filepath,
                                    %err,
                                    "skipping document that failed to encode"
                                );
                                continue;
                            }
                        }
                    }
                };
                eval_sql::documents::set_encoded_body(document.id, encoded, &app.catalog).await?;
                encoded
            }
        };
        summary.documents_staged += 1;

        for (connection_id, details) in &snapshots {
            for &prompt_id in &config.prompt_ids {
                let created = eval_sql::responses::enqueue(
                    batch_id,
                    body_id,
                    prompt_id,
                    *connection_id,
                    details.as_ref(),
                    &app.work,
                )
                .await?;
                if created {
                    summary.responses_created += 1;
                }
            }
        }
    }

    anyhow::ensure!(
        summary.documents_staged > 0,
        "no documents could be staged for batch {batch_id}"
    );

    summary.total_responses = eval_sql::responses::status_counts(batch_id, &app.work)
        .await?
        .total;
    Ok(summary)
}
