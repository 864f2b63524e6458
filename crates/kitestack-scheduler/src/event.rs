//! Messages flowing into the scheduler.

use kitestack_core::{JobDescriptor, JobId};

/// A backlog change observed by the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A job appeared in the runnable list.
    Added(JobDescriptor),
    /// A job left the runnable list (finished or cancelled upstream).
    Removed(JobId),
    /// Jobs the backend reports as holding agent capacity.
    Capacity(usize),
}

/// Periodic work requested by the ticker tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    ObserveCompletions,
    CollectGarbage,
}
