//! Admission, reconciliation and garbage collection.
//!
//! The scheduler is the only component that creates or deletes cluster
//! jobs, and the only writer of the registry, the admission counter, the
//! pending queue and the cancel-pending set.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use kitestack_config::{Config, RetryPolicy};
use kitestack_core::{
    ClusterExecutor, ClusterJobHandle, ClusterStatus, Error, JobDescriptor, JobId, JobState,
    Result,
};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::event::{Event, Tick};
use crate::registry::{AdmissionState, Registry};
use crate::retry::with_retry;

/// Outcome of one admission attempt.
enum Admission {
    Admitted,
    /// Not admitted this time; retry at the head of the queue later.
    Deferred(JobDescriptor),
    /// Failed for a reason retrying soon will not fix.
    Rejected(JobDescriptor),
}

pub struct Scheduler {
    executor: Arc<dyn ClusterExecutor>,
    registry: Registry,
    admission: AdmissionState,
    /// Jobs waiting for capacity, oldest first.
    pending: VecDeque<JobDescriptor>,
    /// Cancelled jobs whose cluster job could not be deleted yet.
    cancel_pending: BTreeSet<JobId>,
    /// Surplus cluster jobs for an already tracked CI job, awaiting deletion.
    orphans: Vec<ClusterJobHandle>,
    /// Whether the registry has been rebuilt from the cluster.
    reconciled: bool,
    job_ttl: Duration,
    retry: RetryPolicy,
    span: Span,
}

impl Scheduler {
    pub fn new(executor: Arc<dyn ClusterExecutor>, config: &Config, span: Span) -> Self {
        Self {
            executor,
            registry: Registry::new(),
            admission: AdmissionState::new(config.max_in_flight),
            pending: VecDeque::new(),
            cancel_pending: BTreeSet::new(),
            orphans: Vec::new(),
            reconciled: false,
            job_ttl: config.job_ttl,
            retry: config.retry,
            span,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn admission(&self) -> &AdmissionState {
        &self.admission
    }

    /// Ids waiting for capacity, oldest first.
    pub fn pending(&self) -> Vec<JobId> {
        self.pending.iter().map(|job| job.id.clone()).collect()
    }

    pub fn cancel_pending(&self) -> &BTreeSet<JobId> {
        &self.cancel_pending
    }

    pub fn orphans(&self) -> &[ClusterJobHandle] {
        &self.orphans
    }

    pub fn is_reconciled(&self) -> bool {
        self.reconciled
    }

    /// Rebuild the registry from the cluster.
    ///
    /// Every managed job found is adopted rather than recreated. Running
    /// ones take admission capacity; finished ones are queued for GC.
    ///
    /// A CI job can own only one cluster job. When the cluster holds more,
    /// the one with the derived name is kept and the others are deleted.
    /// Safe to call again: jobs already tracked under the same name are
    /// skipped.
    pub async fn reconcile(&mut self, cancel: &CancellationToken) -> Result<usize> {
        let selector = self.executor.label_selector();
        let selector = selector.as_str();
        let executor = &self.executor;
        let mut handles = with_retry(&self.retry, cancel, "list_jobs", move || {
            executor.list_jobs(selector)
        })
        .await?;

        handles.sort_by(|a, b| {
            let a_key = (a.name != a.job_id.cluster_name(), &a.name);
            let b_key = (b.name != b.job_id.cluster_name(), &b.name);
            a_key.cmp(&b_key)
        });

        let now = Utc::now();
        let mut adopted = 0;
        for mut handle in handles {
            let already_tracked = self
                .registry
                .get(&handle.job_id)
                .is_some_and(|entry| entry.handle.name == handle.name)
                || self.orphans.iter().any(|orphan| orphan.name == handle.name);
            if already_tracked {
                continue;
            }

            let (state, counted) = match handle.status {
                ClusterStatus::Succeeded | ClusterStatus::Failed => {
                    handle.completed_at.get_or_insert(now);
                    (JobState::Completed, false)
                }
                status => {
                    let counted = self.admission.try_acquire();
                    if !counted {
                        warn!(
                            job_id = %handle.job_id,
                            max_in_flight = self.admission.max_in_flight(),
                            "Adopted job exceeds max-in-flight"
                        );
                    }
                    let state = if status == ClusterStatus::Running {
                        JobState::Running
                    } else {
                        JobState::Admitted
                    };
                    (state, counted)
                }
            };

            match self.registry.insert(handle.clone(), state, counted) {
                Ok(()) => {
                    debug!(job_id = %handle.job_id, ?state, "Adopted cluster job");
                    adopted += 1;
                }
                Err(e) => {
                    error!(
                        job_id = %handle.job_id,
                        name = %handle.name,
                        error = %e,
                        "Duplicate cluster job during reconciliation, deleting it"
                    );
                    if counted {
                        self.admission.rollback();
                    }
                    self.orphans.push(handle);
                }
            }
        }

        self.reconciled = true;
        info!(
            adopted,
            orphans = self.orphans.len(),
            in_flight = self.admission.count(),
            "Reconciled cluster state"
        );
        self.delete_orphans(cancel).await;
        Ok(adopted)
    }

    /// Delete surplus cluster jobs. Failures stay queued for the next sweep.
    async fn delete_orphans(&mut self, cancel: &CancellationToken) {
        let mut remaining = Vec::new();
        for handle in std::mem::take(&mut self.orphans) {
            if cancel.is_cancelled() {
                remaining.push(handle);
                continue;
            }

            let executor = &self.executor;
            let target = &handle;
            let result = with_retry(&self.retry, cancel, "delete_job", move || {
                executor.delete_job(target)
            })
            .await;

            match result {
                Ok(()) => {
                    info!(
                        job_id = %handle.job_id,
                        name = %handle.name,
                        "Deleted surplus cluster job"
                    );
                }
                Err(e) => {
                    warn!(name = %handle.name, error = %e, "Failed to delete surplus cluster job");
                    remaining.push(handle);
                }
            }
        }
        self.orphans = remaining;
    }

    /// Apply one monitor event.
    pub async fn handle_event(&mut self, event: Event, cancel: &CancellationToken) {
        match event {
            Event::Added(job) => self.on_added(job, cancel).await,
            Event::Removed(id) => self.on_removed(id, cancel).await,
            Event::Capacity(occupied) => {
                if occupied != self.admission.baseline() {
                    debug!(occupied, "Backend capacity baseline updated");
                }
                self.admission.set_baseline(occupied);
                self.admit_pending(cancel).await;
            }
        }
    }

    pub async fn handle_tick(&mut self, tick: Tick, cancel: &CancellationToken) {
        match tick {
            Tick::ObserveCompletions => self.observe_completions(cancel).await,
            Tick::CollectGarbage => {
                if !self.reconciled {
                    if let Err(e) = self.reconcile(cancel).await {
                        warn!(error = %e, "Reconciliation failed, will retry on next sweep");
                    }
                }
                self.collect_garbage(cancel).await;
            }
        }
    }

    async fn on_added(&mut self, mut job: JobDescriptor, cancel: &CancellationToken) {
        if self.registry.contains(&job.id) {
            debug!(job_id = %job.id, "Job already has a cluster job, ignoring");
            return;
        }
        if self.pending.iter().any(|p| p.id == job.id) {
            debug!(job_id = %job.id, "Job already pending, ignoring");
            return;
        }

        job.state = JobState::Runnable;
        self.pending.push_back(job);
        self.admit_pending(cancel).await;

        if !self.pending.is_empty() {
            debug!(
                pending = self.pending.len(),
                in_flight = self.admission.in_flight(),
                "Waiting for capacity"
            );
        }
    }

    async fn on_removed(&mut self, id: JobId, cancel: &CancellationToken) {
        let Some(entry) = self.registry.get_mut(&id) else {
            if let Some(pos) = self.pending.iter().position(|job| job.id == id) {
                self.pending.remove(pos);
                info!(job_id = %id, "Dropped pending job removed upstream");
            }
            return;
        };

        match entry.state {
            JobState::Completed => {
                debug!(job_id = %id, "Completed job left the backlog, keeping until TTL");
            }
            JobState::Cancelled => {
                debug!(job_id = %id, "Cancellation already in progress");
            }
            _ => {
                entry.advance(JobState::Cancelled);
                info!(job_id = %id, "Job removed upstream, cancelling cluster job");
                self.cancel_job(&id, cancel).await;
            }
        }
    }

    /// Delete the cluster job of a cancelled entry. On failure the id stays
    /// on the cancel-pending list and the entry keeps its capacity.
    async fn cancel_job(&mut self, id: &JobId, cancel: &CancellationToken) {
        let Some(handle) = self.registry.get(id).map(|e| e.handle.clone()) else {
            self.cancel_pending.remove(id);
            return;
        };

        let executor = &self.executor;
        let target = &handle;
        let result = with_retry(&self.retry, cancel, "delete_job", move || {
            executor.delete_job(target)
        })
        .await;

        match result {
            Ok(()) => {
                self.cancel_pending.remove(id);
                if let Some(entry) = self.registry.remove(id) {
                    self.admission.release(entry.counted);
                }
                info!(job_id = %id, name = %handle.name, "Cancelled cluster job");
                self.admit_pending(cancel).await;
            }
            Err(e) => {
                self.cancel_pending.insert(id.clone());
                warn!(job_id = %id, error = %e, "Cancellation failed, will retry");
            }
        }
    }

    /// Admit pending jobs, oldest first, while capacity lasts.
    async fn admit_pending(&mut self, cancel: &CancellationToken) {
        let mut budget = self.pending.len();
        while budget > 0 && self.admission.has_capacity() && !cancel.is_cancelled() {
            budget -= 1;
            let Some(job) = self.pending.pop_front() else {
                break;
            };

            match self.admit(job, cancel).await {
                Admission::Admitted => {}
                Admission::Deferred(job) => {
                    self.pending.push_front(job);
                    break;
                }
                Admission::Rejected(job) => {
                    self.pending.push_back(job);
                }
            }
        }
    }

    async fn admit(&mut self, job: JobDescriptor, cancel: &CancellationToken) -> Admission {
        if self.registry.contains(&job.id) {
            return Admission::Admitted;
        }
        if !self.admission.try_acquire() {
            return Admission::Deferred(job);
        }

        let name = job.id.cluster_name();
        let executor = &self.executor;
        let (target, descriptor) = (name.as_str(), &job);
        let result = with_retry(&self.retry, cancel, "create_job", move || {
            executor.create_job(target, descriptor)
        })
        .await;

        match result {
            Ok(handle) => match self.registry.insert(handle, JobState::Admitted, true) {
                Ok(()) => {
                    info!(
                        job_id = %job.id,
                        name = %name,
                        in_flight = self.admission.in_flight(),
                        "Admitted job"
                    );
                    Admission::Admitted
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Registry rejected admitted job");
                    self.admission.rollback();
                    Admission::Rejected(job)
                }
            },
            Err(e) => {
                self.admission.rollback();
                if matches!(e, Error::Cancelled) || e.is_transient() {
                    warn!(job_id = %job.id, error = %e, "Job creation deferred");
                    Admission::Deferred(job)
                } else {
                    error!(job_id = %job.id, error = %e, "Job creation failed");
                    Admission::Rejected(job)
                }
            }
        }
    }

    /// Check every in-flight job with the cluster and release the capacity
    /// of those that finished.
    pub async fn observe_completions(&mut self, cancel: &CancellationToken) {
        let tracked = self.registry.in_flight();
        if tracked.is_empty() {
            return;
        }

        let executor = &self.executor;
        let statuses = tokio::select! {
            _ = cancel.cancelled() => return,
            statuses = join_all(tracked.iter().map(|h| executor.get_status(h))) => statuses,
        };

        let now = Utc::now();
        let mut freed = false;
        for (handle, status) in tracked.into_iter().zip(statuses) {
            match status {
                Ok(status) => freed |= self.apply_status(&handle.job_id, status, now),
                Err(Error::NotFound(_)) => {
                    warn!(job_id = %handle.job_id, name = %handle.name, "Cluster job vanished");
                    if let Some(entry) = self.registry.remove(&handle.job_id) {
                        self.admission.release(entry.counted);
                        freed = true;
                    }
                }
                Err(e) => {
                    warn!(job_id = %handle.job_id, error = %e, "Failed to get cluster job status");
                }
            }
        }

        if freed {
            self.admit_pending(cancel).await;
        }
    }

    /// Record a status observation. Returns whether capacity was freed.
    fn apply_status(&mut self, id: &JobId, status: ClusterStatus, now: DateTime<Utc>) -> bool {
        let Some(entry) = self.registry.get_mut(id) else {
            return false;
        };
        entry.handle.status = status;

        match status {
            ClusterStatus::Pending => false,
            ClusterStatus::Running => {
                if entry.state == JobState::Admitted {
                    entry.advance(JobState::Running);
                    debug!(job_id = %id, "Job running");
                }
                false
            }
            ClusterStatus::Succeeded | ClusterStatus::Failed => {
                if !entry.state.is_in_flight() || !entry.advance(JobState::Completed) {
                    return false;
                }
                let completed_at = *entry.handle.completed_at.get_or_insert(now);
                let counted = std::mem::replace(&mut entry.counted, false);
                self.admission.release(counted);
                info!(
                    job_id = %id,
                    ?status,
                    completed_at = %completed_at,
                    in_flight = self.admission.in_flight(),
                    "Job completed"
                );
                true
            }
        }
    }

    pub async fn collect_garbage(&mut self, cancel: &CancellationToken) {
        self.collect_garbage_at(Utc::now(), cancel).await;
    }

    /// Retry outstanding cancellations, then delete every cluster job whose
    /// completion is at least the TTL old at `now`.
    pub async fn collect_garbage_at(&mut self, now: DateTime<Utc>, cancel: &CancellationToken) {
        self.delete_orphans(cancel).await;

        for id in self.cancel_pending.clone() {
            if cancel.is_cancelled() {
                return;
            }
            self.cancel_job(&id, cancel).await;
        }

        let ttl = chrono::Duration::from_std(self.job_ttl).unwrap_or(chrono::Duration::MAX);
        for id in self.registry.expired(now, ttl) {
            if cancel.is_cancelled() {
                return;
            }
            let Some(handle) = self.registry.get(&id).map(|e| e.handle.clone()) else {
                continue;
            };

            let executor = &self.executor;
            let target = &handle;
            let result = with_retry(&self.retry, cancel, "delete_job", move || {
                executor.delete_job(target)
            })
            .await;

            match result {
                Ok(()) => {
                    self.registry.remove(&id);
                    info!(job_id = %id, name = %handle.name, "Reclaimed finished cluster job");
                }
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Failed to reclaim cluster job, will retry");
                }
            }
        }

        self.admit_pending(cancel).await;
    }

    /// Consume events and ticks until cancelled or both channels close.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<Event>,
        mut ticks: mpsc::Receiver<Tick>,
        cancel: CancellationToken,
    ) {
        let span = self.span.clone();
        async move {
            info!(
                executor = self.executor.name(),
                max_in_flight = self.admission.max_in_flight(),
                job_ttl = ?self.job_ttl,
                "Starting scheduler"
            );

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    Some(event) = events.recv() => self.handle_event(event, &cancel).await,
                    Some(tick) = ticks.recv() => self.handle_tick(tick, &cancel).await,
                    else => break,
                }
            }

            info!(
                tracked = self.registry.len(),
                pending = self.pending.len(),
                "Scheduler stopped"
            );
        }
        .instrument(span)
        .await
    }
}
