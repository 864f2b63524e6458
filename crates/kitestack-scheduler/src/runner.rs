//! Wiring of the monitor, the scheduler and the periodic ticks.

use kitestack_config::Config;
use kitestack_core::{CiBackend, ClusterExecutor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};

use crate::event::Tick;
use crate::monitor::Monitor;
use crate::scheduler::Scheduler;

const TICK_QUEUE_CAPACITY: usize = 4;

/// Run the bridge until `cancel` fires.
///
/// The cluster is reconciled before the first poll so that jobs created by
/// an earlier process are adopted instead of duplicated. A failed
/// reconciliation is retried on every GC sweep.
///
/// On cancellation no new cluster jobs are created. The scheduler gets
/// `shutdown_grace` to finish the cluster call in progress before it is
/// abandoned; an abandoned creation is adopted on the next start. The
/// background tasks then get `shutdown_grace` to stop before they are
/// aborted.
pub async fn run(
    config: Config,
    backend: Arc<dyn CiBackend>,
    executor: Arc<dyn ClusterExecutor>,
    cancel: CancellationToken,
) {
    let cancel = cancel.child_token();
    let (event_tx, event_rx) = mpsc::channel(config.event_queue_capacity.max(1));
    let (tick_tx, tick_rx) = mpsc::channel(TICK_QUEUE_CAPACITY);

    let pipeline = config.pipeline_slug();
    let mut scheduler = Scheduler::new(
        executor,
        &config,
        info_span!("scheduler", pipeline = %pipeline),
    );
    if let Err(e) = scheduler.reconcile(&cancel).await {
        error!(error = %e, "Failed to reconcile cluster state, will retry on next sweep");
    }

    let monitor = Monitor::new(backend, &config, info_span!("monitor", pipeline = %pipeline));

    let mut tasks = JoinSet::new();
    tasks.spawn(monitor.run(event_tx, cancel.clone()));
    tasks.spawn(ticker(
        Tick::ObserveCompletions,
        config.completion_interval,
        tick_tx.clone(),
        cancel.clone(),
    ));
    tasks.spawn(ticker(
        Tick::CollectGarbage,
        config.gc_interval,
        tick_tx,
        cancel.clone(),
    ));

    let grace = config.shutdown_grace;
    let overdue = async {
        cancel.cancelled().await;
        tokio::time::sleep(grace).await;
    };
    tokio::select! {
        _ = scheduler.run(event_rx, tick_rx, cancel.clone()) => {}
        _ = overdue => {
            warn!(?grace, "Scheduler did not stop in time, abandoning cluster call in progress");
        }
    }
    cancel.cancel();

    let drain = async {
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Background task failed");
            }
        }
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        warn!(?grace, "Background tasks did not stop in time, aborting");
        tasks.abort_all();
    }

    info!("Shutdown complete");
}

/// Send `tick` every `period`. A tick is dropped when the scheduler is
/// still busy with earlier ones.
async fn ticker(
    tick: Tick,
    period: Duration,
    ticks: mpsc::Sender<Tick>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        match ticks.try_send(tick) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!(?tick, "Scheduler busy, skipping tick"),
            Err(TrySendError::Closed(_)) => return,
        }
    }
}
