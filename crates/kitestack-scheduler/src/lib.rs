//! Job scheduling for kitestack.
//!
//! Two control loops share one registry:
//! - the monitor polls the CI backend and publishes backlog changes
//! - the scheduler admits jobs under the concurrency cap, observes
//!   completion and reclaims finished cluster jobs after their TTL
//!
//! Only the scheduler task mutates the registry and admission state.
//! Completion checks and GC sweeps reach it as ticks on a channel.

pub mod event;
pub mod monitor;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use event::{Event, Tick};
pub use monitor::Monitor;
pub use registry::{AdmissionState, Registry, RegistryEntry};
pub use runner::run;
pub use scheduler::Scheduler;
