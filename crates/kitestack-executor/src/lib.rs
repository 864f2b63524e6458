//! Cluster execution backends for kitestack.
//!
//! Provides executor implementations for running CI jobs:
//! - Kubernetes `batch/v1` Jobs

pub mod kubernetes;

pub use kitestack_core::executor::{ClusterExecutor, ClusterJobHandle, ClusterStatus};
pub use kubernetes::{JobTemplate, KubernetesExecutor};
