//! The gate: one pass/fail signal over all jobs of a trigger.

use chrono::Utc;
use gridline_core::ids::TriggerId;
use gridline_core::job::{GateEntry, GateResult, GateStatus, JobReport};
use gridline_core::{Error, Result};
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Folds terminal job outcomes into a [`GateResult`]. Performs no retries.
pub struct GateAggregator;

impl GateAggregator {
    /// Pure fold: pass iff every report passed. Entries are ordered by job
    /// index regardless of completion order.
    pub fn aggregate(
        trigger_id: TriggerId,
        reports: impl IntoIterator<Item = JobReport>,
    ) -> GateResult {
        let mut entries: Vec<GateEntry> = reports
            .into_iter()
            .map(|r| GateEntry {
                job_id: r.job_id,
                index: r.index,
                name: r.name,
                tag: r.tag,
                outcome: r.outcome,
            })
            .collect();
        entries.sort_by_key(|e| e.index);

        let aggregate = if entries.iter().all(|e| e.outcome.is_passed()) {
            GateStatus::Pass
        } else {
            GateStatus::Fail
        };

        GateResult {
            trigger_id,
            entries,
            aggregate,
            completed_at: Utc::now(),
        }
    }

    /// Wait for every job task in `jobs` to finish, then aggregate.
    ///
    /// Job tasks are expected to fold their own failures into a report. A
    /// task that was aborted means the trigger was cancelled, and no gate
    /// result is produced.
    pub async fn join(trigger_id: TriggerId, mut jobs: JoinSet<JobReport>) -> Result<GateResult> {
        let expected = jobs.len();
        let mut reports = Vec::with_capacity(expected);

        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok(report) => {
                    debug!(
                        trigger = %trigger_id,
                        job = %report.job_id,
                        outcome = %report.outcome,
                        remaining = jobs.len(),
                        "Job reached terminal state"
                    );
                    reports.push(report);
                }
                Err(e) if e.is_cancelled() => {
                    return Err(Error::Cancelled(trigger_id.to_string()));
                }
                Err(e) => {
                    return Err(Error::Internal(format!("Job task failed: {}", e)));
                }
            }
        }

        let result = Self::aggregate(trigger_id, reports);
        info!(
            trigger = %trigger_id,
            jobs = expected,
            failed = result.failures().count(),
            passed = result.passed(),
            "Gate completed"
        );
        Ok(result)
    }
}
