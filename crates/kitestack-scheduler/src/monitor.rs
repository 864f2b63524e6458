//! Backlog monitor
//!
//! Polls the CI backend for the pipeline's runnable jobs and publishes what
//! changed since the previous poll. The monitor never talks to the cluster.

use kitestack_config::{Config, RetryPolicy};
use kitestack_core::{CiBackend, JobId, Result};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, warn};

use crate::event::Event;
use crate::retry::sleep_or_cancel;

/// Polls one pipeline and diffs successive observations.
pub struct Monitor {
    backend: Arc<dyn CiBackend>,
    org: String,
    pipeline: String,
    poll_interval: Duration,
    poll_jitter: Duration,
    backoff: RetryPolicy,
    /// Ids seen in the last successful poll.
    known: HashSet<JobId>,
    span: Span,
}

impl Monitor {
    pub fn new(backend: Arc<dyn CiBackend>, config: &Config, span: Span) -> Self {
        Self {
            backend,
            org: config.org.clone(),
            pipeline: config.pipeline.clone(),
            poll_interval: config.poll_interval,
            poll_jitter: config.poll_jitter,
            backoff: config.retry,
            known: HashSet::new(),
            span,
        }
    }

    /// Ids seen in the last successful poll.
    pub fn known(&self) -> &HashSet<JobId> {
        &self.known
    }

    /// Perform a single poll cycle.
    ///
    /// On success returns the capacity report followed by `Removed` events
    /// (in id order) and `Added` events (in backend order), and remembers
    /// the new observation. On failure nothing is remembered.
    pub async fn poll_once(&mut self) -> Result<Vec<Event>> {
        let jobs = self.backend.list_runnable(&self.org, &self.pipeline).await?;
        let occupied = self
            .backend
            .count_occupied_capacity(&self.org, &self.pipeline)
            .await?;

        let mut observed = HashSet::with_capacity(jobs.len());
        let mut added = Vec::new();
        for job in jobs {
            if !observed.insert(job.id.clone()) {
                continue;
            }
            if !self.known.contains(&job.id) {
                added.push(Event::Added(job));
            }
        }

        let mut removed: Vec<JobId> = self.known.difference(&observed).cloned().collect();
        removed.sort();

        if !added.is_empty() || !removed.is_empty() {
            info!(
                added = added.len(),
                removed = removed.len(),
                runnable = observed.len(),
                occupied,
                "Backlog changed"
            );
        }

        let mut events = Vec::with_capacity(1 + removed.len() + added.len());
        events.push(Event::Capacity(occupied));
        events.extend(removed.into_iter().map(Event::Removed));
        events.extend(added);

        self.known = observed;
        Ok(events)
    }

    /// Poll until cancelled, sending events on `events`.
    ///
    /// A full queue blocks the monitor rather than dropping events.
    pub async fn run(mut self, events: mpsc::Sender<Event>, cancel: CancellationToken) {
        let span = self.span.clone();
        async move {
            info!(
                org = %self.org,
                pipeline = %self.pipeline,
                backend = self.backend.name(),
                "Starting monitor (interval: {:?})",
                self.poll_interval
            );

            let mut failures: u32 = 0;
            loop {
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = self.poll_once() => result,
                };

                let delay = match result {
                    Ok(batch) => {
                        failures = 0;
                        for event in batch {
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                sent = events.send(event) => {
                                    if sent.is_err() {
                                        info!("Event queue closed, stopping monitor");
                                        return;
                                    }
                                }
                            }
                        }
                        self.next_interval()
                    }
                    Err(e) => {
                        let delay = self.backoff.backoff(failures).max(self.poll_interval);
                        failures = failures.saturating_add(1);
                        warn!(
                            error = %e,
                            failures,
                            delay_ms = delay.as_millis() as u64,
                            "Backend poll failed, backing off"
                        );
                        delay
                    }
                };

                if !sleep_or_cancel(delay, &cancel).await {
                    break;
                }
            }

            debug!("Monitor stopped");
        }
        .instrument(span)
        .await
    }

    fn next_interval(&self) -> Duration {
        let jitter_ms = self.poll_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.poll_interval;
        }
        self.poll_interval + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}
