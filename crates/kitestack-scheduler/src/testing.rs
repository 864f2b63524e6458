//! In-memory backend and cluster used by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kitestack_config::{Config, RetryPolicy};
use kitestack_core::{
    CiBackend, ClusterExecutor, ClusterJobHandle, ClusterStatus, Error, JobDescriptor, JobId,
    JobPayload, Result,
};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

pub fn config(max_in_flight: usize) -> Config {
    let mut config = Config::new("acme", "deploy", "token");
    config.max_in_flight = max_in_flight;
    config.poll_interval = Duration::from_millis(10);
    config.poll_jitter = Duration::ZERO;
    config.completion_interval = Duration::from_millis(10);
    config.gc_interval = Duration::from_millis(10);
    config.shutdown_grace = Duration::from_secs(1);
    config.retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    };
    config
}

pub fn job(id: &str) -> JobDescriptor {
    JobDescriptor::new(
        id,
        JobPayload {
            command: format!("echo {id}"),
            ..Default::default()
        },
    )
}

#[derive(Default)]
pub struct FakeBackend {
    runnable: Mutex<Vec<JobDescriptor>>,
    occupied: AtomicUsize,
    failing: AtomicBool,
    pub polls: AtomicU32,
}

impl FakeBackend {
    pub fn set_runnable(&self, ids: &[&str]) {
        *self.runnable.lock().unwrap() = ids.iter().map(|id| job(id)).collect();
    }

    pub fn set_occupied(&self, occupied: usize) {
        self.occupied.store(occupied, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl CiBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn list_runnable(&self, _org: &str, _pipeline: &str) -> Result<Vec<JobDescriptor>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Network("connection reset".to_string()));
        }
        Ok(self.runnable.lock().unwrap().clone())
    }

    async fn count_occupied_capacity(&self, _org: &str, _pipeline: &str) -> Result<usize> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Network("connection reset".to_string()));
        }
        Ok(self.occupied.load(Ordering::SeqCst))
    }
}

/// Cluster keyed by resource name. Creation is idempotent on the name.
#[derive(Default)]
pub struct FakeCluster {
    jobs: Mutex<BTreeMap<String, ClusterJobHandle>>,
    pub create_calls: AtomicU32,
    pub delete_calls: AtomicU32,
    /// Number of upcoming create calls that fail with `Unavailable`.
    fail_creates: AtomicU32,
    fail_deletes: AtomicBool,
    /// Number of upcoming list calls that fail with `Unavailable`.
    fail_lists: AtomicU32,
    create_delay_ms: AtomicU64,
}

impl FakeCluster {
    pub fn names(&self) -> Vec<String> {
        self.jobs.lock().unwrap().keys().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.jobs
            .lock()
            .unwrap()
            .contains_key(&JobId::new(id).cluster_name())
    }

    /// Put a job in the cluster as if an earlier process had created it.
    pub fn seed(&self, id: &str, status: ClusterStatus) {
        self.seed_named(&JobId::new(id).cluster_name(), id, status);
    }

    /// Like `seed`, under a name other than the derived one.
    pub fn seed_named(&self, name: &str, id: &str, status: ClusterStatus) {
        let mut handle = ClusterJobHandle::new(JobId::new(id), Utc::now());
        handle.name = name.to_string();
        handle.status = status;
        if status.is_terminal() {
            handle.completed_at = Some(Utc::now());
        }
        self.jobs.lock().unwrap().insert(handle.name.clone(), handle);
    }

    pub fn set_status(&self, id: &str, status: ClusterStatus) {
        self.set_status_at(id, status, None);
    }

    pub fn set_status_at(&self, id: &str, status: ClusterStatus, at: Option<DateTime<Utc>>) {
        if let Some(handle) = self
            .jobs
            .lock()
            .unwrap()
            .get_mut(&JobId::new(id).cluster_name())
        {
            handle.status = status;
            handle.completed_at = at;
        }
    }

    pub fn remove(&self, id: &str) {
        self.jobs
            .lock()
            .unwrap()
            .remove(&JobId::new(id).cluster_name());
    }

    pub fn fail_creates(&self, times: u32) {
        self.fail_creates.store(times, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, failing: bool) {
        self.fail_deletes.store(failing, Ordering::SeqCst);
    }

    pub fn fail_lists(&self, times: u32) {
        self.fail_lists.store(times, Ordering::SeqCst);
    }

    /// Make every create call take `delay` before it answers.
    pub fn delay_creates(&self, delay: Duration) {
        self.create_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterExecutor for FakeCluster {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn label_selector(&self) -> String {
        "app.kubernetes.io/managed-by=kitestack".to_string()
    }

    async fn create_job(&self, name: &str, job: &JobDescriptor) -> Result<ClusterJobHandle> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let remaining = self.fail_creates.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_creates.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Unavailable("apiserver overloaded".to_string()));
        }

        let mut jobs = self.jobs.lock().unwrap();
        let handle = jobs.entry(name.to_string()).or_insert_with(|| {
            let mut handle = ClusterJobHandle::new(job.id.clone(), Utc::now());
            handle.name = name.to_string();
            handle
        });
        Ok(handle.clone())
    }

    async fn delete_job(&self, handle: &ClusterJobHandle) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("apiserver overloaded".to_string()));
        }
        self.jobs.lock().unwrap().remove(&handle.name);
        Ok(())
    }

    async fn list_jobs(&self, _label_selector: &str) -> Result<Vec<ClusterJobHandle>> {
        let remaining = self.fail_lists.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_lists.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Unavailable("apiserver overloaded".to_string()));
        }
        Ok(self.jobs.lock().unwrap().values().cloned().collect())
    }

    async fn get_status(&self, handle: &ClusterJobHandle) -> Result<ClusterStatus> {
        self.jobs
            .lock()
            .unwrap()
            .get(&handle.name)
            .map(|h| h.status)
            .ok_or_else(|| Error::NotFound(handle.name.clone()))
    }
}
