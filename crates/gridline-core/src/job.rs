//! Jobs, job outcomes and gate results.

use crate::axis::{ArtifactTag, Combination};
use crate::ids::{JobId, TriggerId};
use crate::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Provisioning,
    Installing,
    Staging,
    Testing,
    Reporting,
    Finished,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished)
    }
}

/// A provisioned, network-addressable service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub service: String,
    pub host: String,
    pub port: u16,
    /// Environment-style discovery pairs exported to install and test steps.
    pub env: BTreeMap<String, String>,
    /// Provisioner-specific handle (e.g. a container id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

/// One unit of work created from a surviving combination.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub trigger_id: TriggerId,
    /// Position within the trigger's job list.
    pub index: usize,
    pub combination: Arc<Combination>,
    pub services: Vec<ServiceEndpoint>,
    pub state: JobState,
}

impl Job {
    pub fn new(trigger_id: TriggerId, index: usize, combination: Arc<Combination>) -> Self {
        Self {
            id: JobId::new(),
            trigger_id,
            index,
            combination,
            services: Vec::new(),
            state: JobState::Pending,
        }
    }

    pub fn tag(&self) -> &ArtifactTag {
        self.combination.tag()
    }

    /// Merged discovery environment of every provisioned service.
    pub fn service_env(&self) -> BTreeMap<String, String> {
        self.services
            .iter()
            .flat_map(|s| s.env.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }

    pub fn transition(&mut self, state: JobState) {
        tracing::debug!(job = %self.id, from = ?self.state, to = ?state, "Job state transition");
        self.state = state;
    }
}

/// Terminal outcome of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Passed,
    Failed { reason: String },
    InfrastructureError { step: String, message: String },
}

impl JobOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, JobOutcome::Passed)
    }

    /// Error classification for a non-passing outcome.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            JobOutcome::Passed => None,
            JobOutcome::Failed { .. } => Some(ErrorKind::TestFailure),
            JobOutcome::InfrastructureError { .. } => Some(ErrorKind::Infrastructure),
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Passed => write!(f, "passed"),
            JobOutcome::Failed { reason } => write!(f, "failed: {}", reason),
            JobOutcome::InfrastructureError { step, message } => {
                write!(f, "infrastructure error during {}: {}", step, message)
            }
        }
    }
}

/// What a finished job hands to the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub trigger_id: TriggerId,
    /// Position of the job within its trigger.
    pub index: usize,
    pub name: String,
    pub tag: ArtifactTag,
    pub outcome: JobOutcome,
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobReport {
    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

/// Overall gate status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pass,
    Fail,
}

/// One job's line in the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateEntry {
    pub job_id: JobId,
    pub index: usize,
    pub name: String,
    pub tag: ArtifactTag,
    pub outcome: JobOutcome,
}

/// The single aggregate signal for a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub trigger_id: TriggerId,
    /// Entries ordered by job index.
    pub entries: Vec<GateEntry>,
    pub aggregate: GateStatus,
    pub completed_at: DateTime<Utc>,
}

impl GateResult {
    pub fn passed(&self) -> bool {
        self.aggregate == GateStatus::Pass
    }

    pub fn job_results(&self) -> BTreeMap<JobId, bool> {
        self.entries
            .iter()
            .map(|e| (e.job_id, e.outcome.is_passed()))
            .collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = &GateEntry> {
        self.entries.iter().filter(|e| !e.outcome.is_passed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_kinds() {
        assert_eq!(JobOutcome::Passed.error_kind(), None);
        assert_eq!(
            JobOutcome::Failed {
                reason: "x".into()
            }
            .error_kind(),
            Some(ErrorKind::TestFailure)
        );
        assert_eq!(
            JobOutcome::InfrastructureError {
                step: "provision".into(),
                message: "timeout".into()
            }
            .error_kind(),
            Some(ErrorKind::Infrastructure)
        );
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(JobOutcome::InfrastructureError {
            step: "install".into(),
            message: "pip exited 1".into(),
        })
        .unwrap();
        assert_eq!(json["outcome"], "infrastructure_error");
        assert_eq!(json["step"], "install");
    }
}
