//! CI backend capability.
//!
//! A backend knows which jobs of a pipeline are waiting for, or currently
//! occupying, agent capacity.

use async_trait::async_trait;

use crate::{JobDescriptor, Result};

/// Source of runnable work.
#[async_trait]
pub trait CiBackend: Send + Sync {
    /// Name of this backend.
    fn name(&self) -> &'static str;

    /// Jobs of the pipeline that are eligible to run or already running,
    /// oldest first.
    ///
    /// Fails with `Network`, `Auth` or `RateLimited`.
    async fn list_runnable(&self, org: &str, pipeline: &str) -> Result<Vec<JobDescriptor>>;

    /// Number of the pipeline's jobs currently holding agent capacity.
    async fn count_occupied_capacity(&self, org: &str, pipeline: &str) -> Result<usize>;
}
