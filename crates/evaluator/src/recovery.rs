//! Startup reconciliation of half-finished state across both stores.
//!
//! Runs once, before the queue processor is allowed to accept work, and
//! touches only local state: the remote service is never consulted. Losing
//! a few in-flight results to a crash is acceptable; silently re-running
//! completed work is not.

use eval_sql::responses::StatusCounts;
use models::BatchStatus;

/// Error text stamped onto responses failed by recovery, kept distinct so
/// audits can separate crash fallout from ordinary failures.
pub const RECOVERY_MARKER: &str = "marked as failed by startup recovery - task was stuck";

/// What to do with a batch found in STAGING or ANALYZING at startup, as a
/// pure function of its work-store counts.
#[derive(Debug, PartialEq, Eq)]
pub enum RecoveryAction {
    /// No response rows exist: the crash predated staging's first write.
    RevertToSaved,
    /// Every response is terminal: only the batch flip was lost.
    MarkCompleted,
    /// Mixed state: park on STAGED so a run resumes the QUEUED remainder.
    ResumeStaged,
}

impl RecoveryAction {
    pub fn decide(counts: &StatusCounts) -> Self {
        if counts.total == 0 {
            RecoveryAction::RevertToSaved
        } else if counts.all_terminal() {
            RecoveryAction::MarkCompleted
        } else {
            RecoveryAction::ResumeStaged
        }
    }
}

#[derive(Debug, Default, serde::Serialize)]
pub struct RecoveryReport {
    pub batches_inspected: usize,
    pub batches_fixed: usize,
    pub responses_failed: u64,
}

/// Reconcile both stores. Idempotent across repeated crashes: re-running
/// recovery over an already-recovered system changes nothing.
#[tracing::instrument(skip(app, task_timeout), err)]
pub async fn run(
    app: &crate::App,
    task_timeout: std::time::Duration,
) -> anyhow::Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    // Stuck or timestamp-less PROCESSING rows first, so the per-batch counts
    // below observe their terminal state.
    report.responses_failed =
        eval_sql::responses::fail_stuck_for_recovery(task_timeout, RECOVERY_MARKER, &app.work)
            .await?;
    if report.responses_failed > 0 {
        tracing::warn!(
            count = report.responses_failed,
            "recovery failed stuck PROCESSING responses"
        );
    }

    let inflight = eval_sql::batches::fetch_inflight(&app.catalog).await?;
    report.batches_inspected = inflight.len();

    for batch in inflight {
        let counts = eval_sql::responses::status_counts(batch.id, &app.work).await?;
        let action = RecoveryAction::decide(&counts);
        tracing::info!(
            batch_id = batch.id,
            prior_status = ?batch.status,
            total = counts.total,
            terminal = counts.terminal(),
            ?action,
            "recovering batch"
        );

        match action {
            RecoveryAction::RevertToSaved => {
                eval_sql::batches::force_status(batch.id, BatchStatus::Saved, &app.catalog).await?;
                eval_sql::batches::clear_started(batch.id, &app.catalog).await?;
            }
            RecoveryAction::MarkCompleted => {
                let processed =
                    eval_sql::responses::processed_document_count(batch.id, &app.work).await?;
                eval_sql::batches::force_status(batch.id, BatchStatus::Completed, &app.catalog)
                    .await?;
                eval_sql::batches::stamp_completed_now(batch.id, &app.catalog).await?;
                eval_sql::batches::set_processed_documents(
                    batch.id,
                    processed as i32,
                    &app.catalog,
                )
                .await?;
            }
            RecoveryAction::ResumeStaged => {
                eval_sql::batches::force_status(batch.id, BatchStatus::Staged, &app.catalog)
                    .await?;
            }
        }
        report.batches_fixed += 1;
    }

    tracing::info!(
        batches = report.batches_fixed,
        responses = report.responses_failed,
        "startup recovery completed"
    );
    Ok(report)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_rows_reverts_to_saved() {
        assert_eq!(
            RecoveryAction::decide(&StatusCounts::default()),
            RecoveryAction::RevertToSaved
        );
    }

    #[test]
    fn all_terminal_marks_completed() {
        let counts = StatusCounts {
            total: 3,
            completed: 1,
            failed: 1,
            timeout: 1,
            ..Default::default()
        };
        assert_eq!(
            RecoveryAction::decide(&counts),
            RecoveryAction::MarkCompleted
        );
    }

    #[test]
    fn mixed_state_resumes_staged() {
        let counts = StatusCounts {
            total: 4,
            completed: 1,
            queued: 3,
            ..Default::default()
        };
        assert_eq!(RecoveryAction::decide(&counts), RecoveryAction::ResumeStaged);

        // Post-sweep PROCESSING rows are young ones still in flight; the
        // batch resumes rather than completing over them.
        let counts = StatusCounts {
            total: 4,
            completed: 3,
            processing: 1,
            ..Default::default()
        };
        assert_eq!(RecoveryAction::decide(&counts), RecoveryAction::ResumeStaged);
    }
}
