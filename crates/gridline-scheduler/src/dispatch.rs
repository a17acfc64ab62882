//! Trigger dispatch: one matrix run per trigger, with a newer trigger for the
//! same reference hard-cancelling the older one.

use crate::gate::GateAggregator;
use crate::matrix::MatrixPlan;
use crate::triggers::{GitRef, TriggerEvent, TriggerMatcher};
use chrono::Utc;
use futures::FutureExt;
use gridline_core::config::MatrixConfig;
use gridline_core::events::{
    Event, GateCompletedPayload, JobCompletedPayload, JobStartedPayload, MatrixResolvedPayload,
    TriggerCancelledPayload,
};
use gridline_core::ids::TriggerId;
use gridline_core::job::{GateResult, Job, JobOutcome, JobReport};
use gridline_core::ports::{ArtifactSink, EventBus, JobExecutor};
use gridline_core::{Error, Result};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{info, warn};

/// State of an in-flight trigger.
#[derive(Debug)]
struct ActiveTrigger {
    trigger_id: TriggerId,
    abort: AbortHandle,
}

/// Handle to a dispatched trigger.
pub struct TriggerHandle {
    pub trigger_id: TriggerId,
    pub reference: GitRef,
    pub jobs: usize,
    task: JoinHandle<Result<GateResult>>,
}

impl TriggerHandle {
    /// Wait for the gate. Fails with [`Error::Cancelled`] if the trigger was
    /// superseded or cancelled before every job finished.
    pub async fn wait(self) -> Result<GateResult> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(Error::Cancelled(self.trigger_id.to_string())),
            Err(e) => Err(Error::Internal(format!("Gate task failed: {}", e))),
        }
    }
}

/// Turns trigger events into jobs and gates.
pub struct Dispatcher {
    config: Arc<MatrixConfig>,
    matcher: TriggerMatcher,
    executor: Arc<dyn JobExecutor>,
    sink: Arc<dyn ArtifactSink>,
    event_bus: Arc<dyn EventBus>,
    active: Arc<Mutex<HashMap<GitRef, ActiveTrigger>>>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<MatrixConfig>,
        executor: Arc<dyn JobExecutor>,
        sink: Arc<dyn ArtifactSink>,
        event_bus: Arc<dyn EventBus>,
    ) -> Result<Self> {
        let matcher = TriggerMatcher::new(&config.triggers)?;
        Ok(Self {
            config,
            matcher,
            executor,
            sink,
            event_bus,
            active: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Handle a trigger event.
    ///
    /// Returns `None` when the event is filtered out. Configuration errors,
    /// including an empty matrix, are returned before any job is created.
    pub async fn submit(&self, event: TriggerEvent) -> Result<Option<TriggerHandle>> {
        if !self.matcher.matches(&event) {
            info!(reference = %event.reference, commit = %event.commit, "Trigger filtered out");
            return Ok(None);
        }

        let plan = MatrixPlan::from_config(&self.config)?;
        let trigger_id = TriggerId::new();
        let reference = event.reference.clone();

        let jobs: Vec<Job> = plan
            .combinations()
            .enumerate()
            .map(|(index, combination)| Job::new(trigger_id, index, combination.clone()))
            .collect();
        let job_count = jobs.len();

        self.publish(Event::MatrixResolved(MatrixResolvedPayload {
            trigger_id,
            reference: reference.to_string(),
            commit: event.commit.clone(),
            candidates: plan.candidates(),
            combinations: plan.primary.len(),
            min_version_combinations: plan.min_version.as_ref().map_or(0, |m| m.len()),
            resolved_at: Utc::now(),
        }))
        .await;

        let mut active = self.active.lock().await;

        if let Some(previous) = active.remove(&reference) {
            self.supersede(&reference, previous, Some(trigger_id)).await;
        }

        let task = tokio::spawn(run_trigger(
            trigger_id,
            reference.clone(),
            jobs,
            self.executor.clone(),
            self.sink.clone(),
            self.event_bus.clone(),
            self.active.clone(),
        ));

        active.insert(
            reference.clone(),
            ActiveTrigger {
                trigger_id,
                abort: task.abort_handle(),
            },
        );

        info!(
            trigger = %trigger_id,
            reference = %reference,
            commit = %event.commit,
            jobs = job_count,
            "Trigger dispatched"
        );

        Ok(Some(TriggerHandle {
            trigger_id,
            reference,
            jobs: job_count,
            task,
        }))
    }

    /// Cancel the in-flight trigger for `reference`, if any.
    pub async fn cancel(&self, reference: &GitRef) -> Option<TriggerId> {
        let previous = self.active.lock().await.remove(reference)?;
        let trigger_id = previous.trigger_id;
        self.supersede(reference, previous, None).await;
        Some(trigger_id)
    }

    /// Currently in-flight triggers.
    pub async fn active(&self) -> Vec<(GitRef, TriggerId)> {
        self.active
            .lock()
            .await
            .iter()
            .map(|(r, a)| (r.clone(), a.trigger_id))
            .collect()
    }

    async fn supersede(
        &self,
        reference: &GitRef,
        previous: ActiveTrigger,
        superseded_by: Option<TriggerId>,
    ) {
        // Aborting the gate task drops its JoinSet, which aborts every job.
        previous.abort.abort();
        warn!(
            trigger = %previous.trigger_id,
            reference = %reference,
            superseded_by = ?superseded_by.map(|id| id.to_string()),
            "Trigger cancelled"
        );
        self.publish(Event::TriggerCancelled(TriggerCancelledPayload {
            trigger_id: previous.trigger_id,
            reference: reference.to_string(),
            superseded_by,
            cancelled_at: Utc::now(),
        }))
        .await;
    }

    async fn publish(&self, event: Event) {
        if let Err(e) = self.event_bus.publish(event).await {
            warn!(error = %e, "Failed to publish event");
        }
    }
}

async fn run_trigger(
    trigger_id: TriggerId,
    reference: GitRef,
    jobs: Vec<Job>,
    executor: Arc<dyn JobExecutor>,
    sink: Arc<dyn ArtifactSink>,
    event_bus: Arc<dyn EventBus>,
    active: Arc<Mutex<HashMap<GitRef, ActiveTrigger>>>,
) -> Result<GateResult> {
    let mut set = JoinSet::new();
    for job in jobs {
        set.spawn(run_job(job, executor.clone(), event_bus.clone()));
    }

    let gate = GateAggregator::join(trigger_id, set).await?;

    if let Err(e) = sink.seal(&gate).await {
        warn!(trigger = %trigger_id, error = %e, "Failed to seal trigger artifacts");
    }

    let completed = Event::GateCompleted(GateCompletedPayload {
        trigger_id,
        aggregate: gate.aggregate,
        total: gate.entries.len(),
        failed: gate.failures().count(),
        completed_at: gate.completed_at,
    });
    if let Err(e) = event_bus.publish(completed).await {
        warn!(error = %e, "Failed to publish event");
    }

    let mut active = active.lock().await;
    if active
        .get(&reference)
        .is_some_and(|a| a.trigger_id == trigger_id)
    {
        active.remove(&reference);
    }

    Ok(gate)
}

/// Run one job, converting a panic into a failed report so siblings and the
/// gate are unaffected.
async fn run_job(job: Job, executor: Arc<dyn JobExecutor>, event_bus: Arc<dyn EventBus>) -> JobReport {
    let started_at = Utc::now();
    let trigger_id = job.trigger_id;
    let job_id = job.id;
    let index = job.index;
    let tag = job.tag().clone();
    let name = job.combination.display_name();

    let started = Event::JobStarted(JobStartedPayload {
        trigger_id,
        job_id,
        index,
        tag: tag.clone(),
        started_at,
    });
    if let Err(e) = event_bus.publish(started).await {
        warn!(error = %e, "Failed to publish event");
    }

    let report = match AssertUnwindSafe(executor.run(job)).catch_unwind().await {
        Ok(report) => report,
        Err(_) => JobReport {
            job_id,
            trigger_id,
            index,
            name,
            tag: tag.clone(),
            outcome: JobOutcome::Failed {
                reason: "job executor panicked".to_string(),
            },
            artifacts: Vec::new(),
            started_at,
            finished_at: Utc::now(),
        },
    };

    let completed = Event::JobCompleted(JobCompletedPayload {
        trigger_id,
        job_id,
        index,
        tag,
        outcome: report.outcome.clone(),
        duration_ms: report.duration_ms(),
        completed_at: report.finished_at,
    });
    if let Err(e) = event_bus.publish(completed).await {
        warn!(error = %e, "Failed to publish event");
    }

    report
}
