//! Registry of cluster jobs and admission accounting.
//!
//! Both are plain data owned by the scheduler task; nothing here locks.

use chrono::{DateTime, Duration, Utc};
use kitestack_core::{ClusterJobHandle, Error, JobId, JobState, Result};
use std::collections::HashMap;
use tracing::error;

/// A tracked cluster job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub handle: ClusterJobHandle,
    pub state: JobState,
    /// Whether this entry holds a unit of `AdmissionState::count`.
    pub counted: bool,
}

impl RegistryEntry {
    /// Move to `next` if the lifecycle allows it.
    pub fn advance(&mut self, next: JobState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        true
    }
}

/// Job id to cluster job. Holds at most one handle per id.
#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<JobId, RegistryEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &JobId) -> Option<&RegistryEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &JobId) -> Option<&mut RegistryEntry> {
        self.entries.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&JobId, &RegistryEntry)> {
        self.entries.iter()
    }

    /// Track a new handle. A second handle for the same job is a defect.
    pub fn insert(
        &mut self,
        handle: ClusterJobHandle,
        state: JobState,
        counted: bool,
    ) -> Result<()> {
        if let Some(existing) = self.entries.get(&handle.job_id) {
            error!(
                job_id = %handle.job_id,
                existing = %existing.handle.name,
                rejected = %handle.name,
                "Refusing second cluster job for the same CI job"
            );
            return Err(Error::InvariantViolation(format!(
                "job {} already tracked as {}",
                handle.job_id, existing.handle.name
            )));
        }

        self.entries.insert(
            handle.job_id.clone(),
            RegistryEntry {
                handle,
                state,
                counted,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, id: &JobId) -> Option<RegistryEntry> {
        self.entries.remove(id)
    }

    /// Handles of jobs still admitted or running.
    pub fn in_flight(&self) -> Vec<ClusterJobHandle> {
        self.entries
            .values()
            .filter(|e| e.state.is_in_flight())
            .map(|e| e.handle.clone())
            .collect()
    }

    /// Jobs whose completion is at least `ttl` old at `now`.
    ///
    /// Entries without a completion timestamp never expire.
    pub fn expired(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                e.handle
                    .completed_at
                    .is_some_and(|completed| now - completed >= ttl)
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// Concurrency cap accounting.
///
/// `count` only moves through `try_acquire` and `release`, so it never
/// exceeds `max_in_flight`. `baseline` is the backend's own view of
/// occupied capacity; it keeps admission honest after a restart, when the
/// registry has not yet seen every running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionState {
    count: usize,
    baseline: usize,
    max_in_flight: usize,
}

impl AdmissionState {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            count: 0,
            baseline: 0,
            max_in_flight,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn baseline(&self) -> usize {
        self.baseline
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Capacity considered in use.
    pub fn in_flight(&self) -> usize {
        self.count.max(self.baseline)
    }

    pub fn has_capacity(&self) -> bool {
        self.in_flight() < self.max_in_flight
    }

    /// Take one unit if any is free.
    pub fn try_acquire(&mut self) -> bool {
        if !self.has_capacity() {
            return false;
        }
        self.count += 1;
        true
    }

    /// Give back capacity held by a finished job. The backend will stop
    /// counting it too, so the baseline drops with it.
    pub fn release(&mut self, counted: bool) {
        if counted {
            self.count = self.count.saturating_sub(1);
        }
        self.baseline = self.baseline.saturating_sub(1);
    }

    /// Undo a `try_acquire` whose job never reached the cluster.
    pub fn rollback(&mut self) {
        self.count = self.count.saturating_sub(1);
    }

    pub fn set_baseline(&mut self, occupied: usize) {
        self.baseline = occupied;
    }
}
