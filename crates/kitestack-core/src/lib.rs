//! Core domain types and traits for kitestack.
//!
//! This crate contains:
//! - Job identifiers and deterministic cluster naming
//! - CI-side job descriptors and their lifecycle states
//! - The `CiBackend` capability (where runnable work comes from)
//! - The `ClusterExecutor` capability (where cluster jobs are created)
//! - The shared error taxonomy

pub mod backend;
pub mod error;
pub mod executor;
pub mod id;
pub mod job;

pub use backend::CiBackend;
pub use error::{Error, Result};
pub use executor::{ClusterExecutor, ClusterJobHandle, ClusterStatus};
pub use id::JobId;
pub use job::{JobDescriptor, JobPayload, JobState};
