//! Read-only projections over both stores for dashboards. Nothing in this
//! module mutates state, and every projection degrades gracefully when a
//! store is unreachable.

use eval_sql::responses::StatusCounts;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct BatchProgress {
    pub batch_id: i32,
    pub batch_number: i32,
    pub status: models::BatchStatus,
    pub total_documents: i32,
    pub processed_documents: i32,
    pub responses: StatusCounts,
}

#[derive(Debug, Default, Serialize)]
pub struct SystemStatus {
    /// QUEUED rows awaiting lease. None when the work store is unreachable.
    pub queued_depth: Option<i64>,
    /// Rows currently leased (PROCESSING).
    pub active_leases: Option<i64>,
    /// PROCESSING rows past the task timeout, awaiting the reaper.
    pub stuck_processing: Option<i64>,
    /// Completions in the trailing hour.
    pub completed_last_hour: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub catalog_store: bool,
    pub work_store: bool,
    pub llm_service: bool,
}

pub async fn batch_progress(app: &crate::App, batch_id: i32) -> anyhow::Result<Option<BatchProgress>> {
    let Some(batch) = eval_sql::batches::fetch(batch_id, &app.catalog).await? else {
        return Ok(None);
    };
    let responses = eval_sql::responses::status_counts(batch_id, &app.work)
        .await
        .unwrap_or_else(|err| {
            tracing::warn!(batch_id, ?err, "work store unreachable for batch progress");
            StatusCounts::default()
        });
    Ok(Some(BatchProgress {
        batch_id: batch.id,
        batch_number: batch.batch_number,
        status: batch.status,
        total_documents: batch.total_documents,
        processed_documents: batch.processed_documents,
        responses,
    }))
}

pub async fn system_status(app: &crate::App, task_timeout: std::time::Duration) -> SystemStatus {
    let queued_depth = log_none(eval_sql::responses::queued_depth(&app.work).await, "queue depth");
    let active_leases = log_none(
        eval_sql::responses::processing_count(&app.work).await,
        "active leases",
    );
    let stuck_processing = log_none(
        eval_sql::responses::stuck_count(task_timeout, &app.work).await,
        "stuck count",
    );
    let completed_last_hour = log_none(
        eval_sql::responses::completed_last_hour(&app.work).await,
        "throughput",
    );
    SystemStatus {
        queued_depth,
        active_leases,
        stuck_processing,
        completed_last_hour,
    }
}

pub async fn health(app: &crate::App) -> Health {
    Health {
        catalog_store: ping(&app.catalog).await,
        work_store: ping(&app.work).await,
        llm_service: app.rpc.probe(app.rpc.base_url().as_str()).await,
    }
}

async fn ping(pool: &sqlx::PgPool) -> bool {
    match sqlx::query("SELECT 1").execute(pool).await {
        Ok(_) => true,
        Err(err) => {
            tracing::warn!(?err, "store health ping failed");
            false
        }
    }
}

fn log_none<T>(result: sqlx::Result<T>, what: &str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(what, ?err, "monitoring query failed");
            None
        }
    }
}
