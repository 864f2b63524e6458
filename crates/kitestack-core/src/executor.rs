//! Cluster executor trait and job handle types.
//!
//! Executors create one cluster-native job per admitted CI job and report
//! its progress. Creation is keyed by a deterministic name so that repeated
//! calls converge on a single resource.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobDescriptor, JobId, Result};

/// Status of a cluster job as reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterStatus {
    /// Created, nothing running yet.
    Pending,
    /// At least one pod is active.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished unsuccessfully.
    Failed,
}

impl ClusterStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClusterStatus::Succeeded | ClusterStatus::Failed)
    }
}

/// Handle to a cluster job created for a CI job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterJobHandle {
    /// Resource name, derived from the job id.
    pub name: String,
    /// The CI job this resource runs.
    pub job_id: JobId,
    /// When the cluster created the resource.
    pub created_at: DateTime<Utc>,
    /// When the job was seen to finish. Unset until observed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last status reported by the cluster.
    pub status: ClusterStatus,
}

impl ClusterJobHandle {
    pub fn new(job_id: JobId, created_at: DateTime<Utc>) -> Self {
        Self {
            name: job_id.cluster_name(),
            job_id,
            created_at,
            completed_at: None,
            status: ClusterStatus::Pending,
        }
    }
}

/// Trait for cluster job executors.
#[async_trait]
pub trait ClusterExecutor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Label selector matching every job this executor manages.
    fn label_selector(&self) -> String;

    /// Create the cluster job `name` for `job`.
    ///
    /// Idempotent on `name`: when the resource already exists the existing
    /// handle is returned instead of an error. Fails with `QuotaExceeded`
    /// or `Unavailable`.
    async fn create_job(&self, name: &str, job: &JobDescriptor) -> Result<ClusterJobHandle>;

    /// Delete a cluster job. A job that is already gone counts as deleted.
    async fn delete_job(&self, handle: &ClusterJobHandle) -> Result<()>;

    /// List managed jobs matching a label selector.
    async fn list_jobs(&self, label_selector: &str) -> Result<Vec<ClusterJobHandle>>;

    /// Get the current status of a job. Fails with `NotFound` when the
    /// resource no longer exists.
    async fn get_status(&self, handle: &ClusterJobHandle) -> Result<ClusterStatus>;
}
