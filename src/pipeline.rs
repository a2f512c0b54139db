use crate::config::Config;
use crate::db::{Candidate, CandidateSource, Ledger};
use crate::drive::Publish;
use crate::error::{LedgerError, SelectionError};
use crate::render::Render;
use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub selected: usize,
    pub completed: usize,
    pub failed: usize,
    pub conflicts: usize,
}

enum Outcome {
    Completed,
    Failed,
    Conflict,
}

/// Drain one batch: every pending candidate is taken through
/// processing -> render -> publish -> completed, with per-candidate failures
/// recorded in the ledger and never aborting the rest of the batch. Only a
/// failing selection aborts, with nothing processed.
pub async fn run_batch(
    config: &Config,
    source: &impl CandidateSource,
    ledger: &impl Ledger,
    renderer: &impl Render,
    publisher: &impl Publish,
) -> Result<BatchReport, SelectionError> {
    let candidates = source
        .select_pending(config.minimum_grade, config.max_attempts)
        .await?;

    let mut report = BatchReport {
        selected: candidates.len(),
        ..Default::default()
    };
    if candidates.is_empty() {
        info!("no pending certificates");
        return Ok(report);
    }
    info!(count = candidates.len(), "processing pending certificates");

    for candidate in &candidates {
        match process_candidate(candidate, ledger, renderer, publisher).await {
            Outcome::Completed => report.completed += 1,
            Outcome::Failed => report.failed += 1,
            Outcome::Conflict => report.conflicts += 1,
        }
    }

    info!(
        selected = report.selected,
        completed = report.completed,
        failed = report.failed,
        conflicts = report.conflicts,
        "batch finished"
    );
    Ok(report)
}

async fn process_candidate(
    candidate: &Candidate,
    ledger: &impl Ledger,
    renderer: &impl Render,
    publisher: &impl Publish,
) -> Outcome {
    let student_id = candidate.student_id;
    let course_id = candidate.course_id;

    // Visible "stuck" state beats silence if we crash mid-render.
    match ledger.mark_processing(candidate).await {
        Ok(()) => {}
        Err(LedgerError::Conflict { .. }) => {
            warn!(student_id, course_id, "certificate already active, likely a concurrent run");
            return Outcome::Conflict;
        }
        Err(err) => {
            error!(student_id, course_id, %err, "could not mark candidate as processing");
            return Outcome::Failed;
        }
    }

    let rendered = match renderer.render(candidate).await {
        Ok(rendered) => rendered,
        Err(err) => {
            record_failure(ledger, candidate, "render", &err.to_string()).await;
            return Outcome::Failed;
        }
    };

    let link = match publisher.publish(&rendered, candidate).await {
        Ok(link) => link,
        Err(err) => {
            record_failure(ledger, candidate, "publish", &err.to_string()).await;
            return Outcome::Failed;
        }
    };

    if let Err(err) = ledger
        .mark_completed(student_id, course_id, &rendered.certificate_id, &link)
        .await
    {
        error!(student_id, course_id, %err, "certificate published but completion not recorded");
        return Outcome::Failed;
    }

    info!(
        student_id,
        course_id,
        code = %rendered.certificate_id,
        link,
        "certificate issued"
    );
    Outcome::Completed
}

async fn record_failure(ledger: &impl Ledger, candidate: &Candidate, stage: &str, message: &str) {
    error!(
        student_id = candidate.student_id,
        course_id = candidate.course_id,
        stage,
        message,
        "certificate attempt failed"
    );
    // Best-effort: a broken ledger must not take down the batch either.
    if let Err(err) = ledger
        .mark_error(candidate.student_id, candidate.course_id, message)
        .await
    {
        error!(
            student_id = candidate.student_id,
            course_id = candidate.course_id,
            %err,
            "could not record error state"
        );
    }
}
