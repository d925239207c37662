//! Worker path: one leased response from dispatch through terminal write.

use crate::breaker::CircuitBreakers;
use crate::processor::{Config, Stats};
use anyhow::Context;
use eval_sql::responses::Response;
use models::WireConfig;
use std::sync::atomic::Ordering;
use tokio::sync::OwnedSemaphorePermit;

/// Drive one leased response to a terminal state. Every exit path either
/// writes a terminal status through a PROCESSING-guarded update, releases
/// the lease (open circuit), or deliberately abandons the row to the reaper
/// (polling deadline). The permit is held for the full duration; dropping it
/// returns capacity to the scheduler.
pub(super) async fn process_response(
    app: &crate::App,
    config: &Config,
    breakers: &CircuitBreakers,
    stats: &Stats,
    response: Response,
    _permit: OwnedSemaphorePermit,
) {
    let response_id = response.id;
    let batch_id = response.batch_id;
    let connection_id = response.connection_id;

    if !breakers.admit(connection_id) {
        tracing::debug!(
            response_id,
            connection_id,
            "connection circuit is open, releasing lease"
        );
        if let Err(err) = eval_sql::responses::release(response_id, &app.work).await {
            tracing::error!(response_id, ?err, "failed to release leased response");
        }
        return;
    }

    match run_to_completion(app, config, breakers, stats, &response).await {
        Ok(Outcome::Terminal) => {
            if let Err(err) = crate::batches::check_fan_in(app, batch_id).await {
                tracing::error!(batch_id, ?err, "fan-in check failed");
            }
        }
        Ok(Outcome::Abandoned) => {
            // Deadline elapsed or the row vanished under us; the reaper (or
            // nobody, for a reset batch) owns the row now.
        }
        Err(err) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            let message = format!("{err:#}");
            tracing::warn!(response_id, connection_id, error = %message, "response failed");
            let failed = crate::retry::with_store_retries("record failure", || {
                eval_sql::responses::fail(response_id, &message, &app.work)
            })
            .await;
            match failed {
                Ok(true) => {
                    if let Err(err) = crate::batches::check_fan_in(app, batch_id).await {
                        tracing::error!(batch_id, ?err, "fan-in check failed");
                    }
                }
                Ok(false) => {
                    tracing::debug!(response_id, "failure write found no PROCESSING row, discarded");
                }
                Err(err) => tracing::error!(response_id, ?err, "failed to record failure"),
            }
        }
    }
}

enum Outcome {
    /// A terminal status was written for this row.
    Terminal,
    /// The row was left PROCESSING (deadline) or no longer exists (reset).
    Abandoned,
}

async fn run_to_completion(
    app: &crate::App,
    config: &Config,
    breakers: &CircuitBreakers,
    stats: &Stats,
    response: &Response,
) -> anyhow::Result<Outcome> {
    // The stored body is authoritative; the source file is never re-read.
    let body = eval_sql::bodies::fetch(response.doc_id, &app.work)
        .await?
        .with_context(|| format!("encoded body {} not found", response.doc_id))?;

    // A body that does not decode is a corrupt payload: deterministic, so
    // fail permanently rather than retry.
    if let Err(err) = crate::encode::decode_body(&body.content) {
        anyhow::bail!("corrupt payload: stored body does not decode: {err}");
    }

    let prompt = eval_sql::prompts::fetch(response.prompt_id, &app.catalog)
        .await?
        .with_context(|| format!("prompt {} not found", response.prompt_id))?;

    let wire_config = wire_config_for(app, response).await?;

    // The wire doc_id always follows the batch-scoped convention, even when
    // the body was stored under its preprocess-time (doc-only) key.
    let request = crate::rpc::AnalyzeRequest {
        doc_id: outbound_doc_id(response.batch_id, &body.document_id),
        content_b64: body.content,
        prompts: vec![crate::rpc::PromptEntry {
            prompt: prompt.prompt_text,
        }],
        llm_provider: wire_config,
        meta_data: None,
    };

    // Only remote-side failures feed the connection's circuit breaker;
    // local errors (corrupt payloads, missing prompts) say nothing about
    // the endpoint's health.
    let accepted = match app.rpc.analyze(&request).await {
        Ok(accepted) => accepted,
        Err(err) => {
            breakers.record_failure(response.connection_id);
            return Err(err.context("dispatching to inference service"));
        }
    };
    breakers.record_success(response.connection_id);

    if !eval_sql::responses::assign_remote_task(response.id, &accepted.task_id, &app.work).await? {
        // The batch was reset between lease and acceptance; the remote task
        // runs unobserved and its result is discarded.
        tracing::debug!(
            response_id = response.id,
            task_id = %accepted.task_id,
            "leased row vanished before dispatch completed, discarding task"
        );
        return Ok(Outcome::Abandoned);
    }
    if let Some(document_id) = parse_document_id(&body.document_id) {
        if let Err(err) =
            eval_sql::documents::set_task_id(document_id, &accepted.task_id, &app.catalog).await
        {
            tracing::warn!(document_id, ?err, "failed to record document task id");
        }
    }

    tracing::debug!(
        response_id = response.id,
        task_id = %accepted.task_id,
        "remote task accepted"
    );

    poll_until_terminal(app, config, breakers, stats, response, &accepted.task_id).await
}

async fn poll_until_terminal(
    app: &crate::App,
    config: &Config,
    breakers: &CircuitBreakers,
    stats: &Stats,
    response: &Response,
    task_id: &str,
) -> anyhow::Result<Outcome> {
    let started = response
        .started_processing_at
        .unwrap_or_else(chrono::Utc::now);
    let deadline = tokio::time::Instant::now() + config.task_timeout;

    loop {
        tokio::time::sleep(config.poll_interval).await;

        if tokio::time::Instant::now() >= deadline {
            // The reaper is the only authority that ends PROCESSING without
            // a remote result; abandon the row to it.
            tracing::warn!(
                response_id = response.id,
                task_id,
                "polling deadline elapsed, abandoning row to the reaper"
            );
            return Ok(Outcome::Abandoned);
        }

        let status = match app.rpc.task_status(task_id).await {
            Ok(status) => status,
            Err(err) => {
                tracing::debug!(task_id, ?err, "status poll failed, will retry");
                continue;
            }
        };

        match status.status {
            crate::rpc::RemoteState::Processing => continue,
            crate::rpc::RemoteState::Completed => {
                let mut aggregated = status.aggregate();
                if aggregated.time_taken_seconds.is_none() {
                    let elapsed = (chrono::Utc::now() - started).num_milliseconds() as f64 / 1000.0;
                    aggregated.time_taken_seconds = Some(elapsed);
                    aggregated.tokens_per_second = match aggregated.output_tokens {
                        Some(tokens) if elapsed > 0.0 => Some(f64::from(tokens) / elapsed),
                        _ => None,
                    };
                }
                let response_json = serde_json::to_string(&serde_json::json!({
                    "task_id": task_id,
                    "results": aggregated.response_text,
                    "overall_score": aggregated.overall_score,
                }))
                .ok();

                let updated = crate::retry::with_store_retries("record completion", || {
                    eval_sql::responses::complete(
                        response.id,
                        &aggregated.response_text,
                        response_json.as_deref(),
                        aggregated.input_tokens,
                        aggregated.output_tokens,
                        aggregated.time_taken_seconds,
                        aggregated.tokens_per_second,
                        aggregated.overall_score,
                        &app.work,
                    )
                })
                .await?;

                breakers.record_success(response.connection_id);
                if updated {
                    stats.processed.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        response_id = response.id,
                        score = ?aggregated.overall_score,
                        "response completed"
                    );
                    return Ok(Outcome::Terminal);
                }
                // The row was reset or reaped while we polled.
                tracing::debug!(
                    response_id = response.id,
                    "completion write found no PROCESSING row, discarded"
                );
                return Ok(Outcome::Abandoned);
            }
            crate::rpc::RemoteState::Failed => {
                breakers.record_failure(response.connection_id);
                let message = status
                    .error
                    .unwrap_or_else(|| "remote task failed without detail".to_string());
                anyhow::bail!("remote task failed: {message}");
            }
        }
    }
}

/// Build the outbound provider config, preferring the live connection and
/// falling back to the frozen snapshot when the connection row was deleted
/// mid-flight.
async fn wire_config_for(app: &crate::App, response: &Response) -> anyhow::Result<WireConfig> {
    match eval_sql::connections::fetch_info(response.connection_id, &app.catalog).await? {
        Some(info) => {
            let resolved = match (&info.model_name, info.model_id) {
                (None, Some(model_id)) => {
                    eval_sql::connections::resolve_model_name(model_id, &app.catalog).await?
                }
                _ => None,
            };
            Ok(crate::format::format_wire_config(&info, resolved.as_deref()))
        }
        None => {
            let details = response
                .connection_details
                .as_ref()
                .context("connection deleted and no snapshot was captured")?;
            wire_config_from_snapshot(details)
                .context("connection deleted and snapshot is unusable")
        }
    }
}

/// Reconstruct a wire config from a frozen connection snapshot. Snapshots
/// exclude secrets, so the fallback dispatch carries no api key.
fn wire_config_from_snapshot(details: &serde_json::Value) -> Option<WireConfig> {
    let connection = details.get("connection")?;
    let base_url = connection.get("base_url").and_then(|v| v.as_str())?;
    let port = connection
        .get("port_no")
        .and_then(|v| v.as_i64())
        .map(|p| p as i32);
    let provider_type = details
        .get("provider")
        .and_then(|p| p.get("provider_type"))
        .and_then(|v| v.as_str())
        .unwrap_or("ollama");
    let model_name = details
        .get("model")
        .and_then(|m| m.get("display_name"))
        .and_then(|v| v.as_str())
        .unwrap_or("default");

    Some(WireConfig {
        provider_type: provider_type.to_string(),
        base_url: crate::format::compose_base_url(base_url, port),
        model_name: model_name.to_string(),
        api_key: None,
    })
}

/// Extract the catalog document id from a work-store body key, which is
/// either `doc_{id}` or `batch_{batch}_doc_{id}`.
fn parse_document_id(document_key: &str) -> Option<i32> {
    let (_, id) = document_key.rsplit_once("doc_")?;
    id.parse().ok()
}

/// The `batch_{batch_id}_doc_{document_id}` identifier sent with every
/// dispatch. A body key that does not parse is passed through unchanged
/// rather than dropping the dispatch.
fn outbound_doc_id(batch_id: i32, document_key: &str) -> String {
    match parse_document_id(document_key) {
        Some(document_id) => models::work_document_id(batch_id, document_id),
        None => document_key.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn document_id_parses_from_both_key_forms() {
        assert_eq!(parse_document_id("doc_42"), Some(42));
        assert_eq!(parse_document_id("batch_7_doc_42"), Some(42));
        assert_eq!(parse_document_id("nonsense"), None);
    }

    #[test]
    fn outbound_doc_id_is_batch_scoped_for_both_key_forms() {
        assert_eq!(outbound_doc_id(7, "doc_42"), "batch_7_doc_42");
        assert_eq!(outbound_doc_id(7, "batch_7_doc_42"), "batch_7_doc_42");
        // A batch-scoped key is re-derived against the dispatching batch,
        // which owns the row.
        assert_eq!(outbound_doc_id(9, "batch_7_doc_42"), "batch_9_doc_42");
        assert_eq!(outbound_doc_id(9, "opaque-key"), "opaque-key");
    }

    #[test]
    fn snapshot_fallback_builds_config_without_secret() {
        let details = serde_json::json!({
            "connection": {"id": 3, "name": "x", "base_url": "http://studio.local", "port_no": 11434},
            "provider": {"id": 1, "provider_type": "ollama"},
            "model": {"id": 2, "display_name": "gemma3"},
            "captured_at": "2026-01-01T00:00:00Z",
            "version": "1.0",
        });
        let config = wire_config_from_snapshot(&details).unwrap();
        assert_eq!(config.base_url, "http://studio.local:11434");
        assert_eq!(config.model_name, "gemma3");
        assert_eq!(config.api_key, None);
    }

    #[test]
    fn snapshot_without_connection_section_is_unusable() {
        assert!(wire_config_from_snapshot(&serde_json::json!({})).is_none());
    }
}
