//! CI-side job types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobId;

/// Lifecycle of a CI job as seen by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Reported by the backend, not yet admitted.
    Runnable,
    /// A cluster job was created for it.
    Admitted,
    /// The cluster reports the job as running.
    Running,
    /// The cluster reports the job as finished (either way).
    Completed,
    /// Removed upstream before completion.
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled)
    }

    /// Whether this job holds a unit of admission capacity.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobState::Admitted | JobState::Running)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Runnable, Admitted)
                | (Admitted, Running)
                | (Admitted, Completed)
                | (Running, Completed)
                | (Runnable, Cancelled)
                | (Admitted, Cancelled)
                | (Running, Cancelled)
        )
    }
}

/// Execution payload of a CI job.
///
/// Passed through to the cluster executor unchanged; the scheduler never
/// looks inside.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Command the agent will run.
    pub command: String,
    /// Environment as `KEY=VALUE` strings.
    pub env: Vec<String>,
    /// Agent targeting rules as `key=value` strings.
    pub agent_query_rules: Vec<String>,
}

impl JobPayload {
    /// Value of an agent tag, e.g. `tag("image")` for `image=alpine:3`.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.agent_query_rules.iter().find_map(|rule| {
            let (k, v) = rule.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// Environment split into pairs. Entries without `=` are skipped.
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().filter_map(|entry| entry.split_once('='))
    }
}

/// A runnable unit of work reported by the CI backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: JobId,
    pub payload: JobPayload,
    pub state: JobState,
    /// When the backend scheduled the job, if it said.
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl JobDescriptor {
    pub fn new(id: impl Into<JobId>, payload: JobPayload) -> Self {
        Self {
            id: id.into(),
            payload,
            state: JobState::Runnable,
            scheduled_at: None,
        }
    }
}
