//! Lifecycle events.

use crate::axis::ArtifactTag;
use crate::ids::*;
use crate::job::{GateStatus, JobOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// All events emitted by Gridline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    MatrixResolved(MatrixResolvedPayload),
    JobStarted(JobStartedPayload),
    JobCompleted(JobCompletedPayload),
    GateCompleted(GateCompletedPayload),
    TriggerCancelled(TriggerCancelledPayload),
    BuildCompleted(BuildCompletedPayload),
}

impl Event {
    /// Dotted subject used for pattern subscriptions.
    pub fn subject(&self) -> String {
        match self {
            Event::MatrixResolved(p) => format!("matrix.resolved.{}", p.trigger_id),
            Event::JobStarted(p) => format!("trigger.{}.job.{}.started", p.trigger_id, p.job_id),
            Event::JobCompleted(p) => {
                format!("trigger.{}.job.{}.completed", p.trigger_id, p.job_id)
            }
            Event::GateCompleted(p) => format!("trigger.{}.gate.completed", p.trigger_id),
            Event::TriggerCancelled(p) => format!("trigger.{}.cancelled", p.trigger_id),
            Event::BuildCompleted(p) => format!("build.completed.{}", p.build_id),
        }
    }
}

/// Match a subject against a pattern where `*` matches one token and `>`
/// matches the rest.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    for token in pattern.split('.') {
        match token {
            ">" => return subject_tokens.next().is_some(),
            "*" => {
                if subject_tokens.next().is_none() {
                    return false;
                }
            }
            literal => {
                if subject_tokens.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    subject_tokens.next().is_none()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixResolvedPayload {
    pub trigger_id: TriggerId,
    pub reference: String,
    pub commit: String,
    pub candidates: usize,
    pub combinations: usize,
    pub min_version_combinations: usize,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStartedPayload {
    pub trigger_id: TriggerId,
    pub job_id: JobId,
    pub index: usize,
    pub tag: ArtifactTag,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCompletedPayload {
    pub trigger_id: TriggerId,
    pub job_id: JobId,
    pub index: usize,
    pub tag: ArtifactTag,
    pub outcome: JobOutcome,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateCompletedPayload {
    pub trigger_id: TriggerId,
    pub aggregate: GateStatus,
    pub total: usize,
    pub failed: usize,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerCancelledPayload {
    pub trigger_id: TriggerId,
    pub reference: String,
    pub superseded_by: Option<TriggerId>,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildCompletedPayload {
    pub build_id: BuildId,
    pub backends: BTreeSet<String>,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}
