//! Buildkite backend for kitestack.
//!
//! Talks to Buildkite's GraphQL API to find the jobs of one pipeline that
//! are waiting for, or holding, agent capacity.

pub mod client;
pub mod graphql;

pub use client::BuildkiteClient;
