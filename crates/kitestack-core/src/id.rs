//! Job identifiers.

use derive_more::Display;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

/// Prefix for every cluster resource created for a CI job.
pub const CLUSTER_NAME_PREFIX: &str = "buildkite-";

/// Kubernetes object names must be DNS-1123 labels.
const MAX_NAME_LEN: usize = 63;

static DNS_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid DNS-1123 regex")
});

/// Identifier of a CI job as reported by the backend.
///
/// Opaque to everything except naming: Buildkite hands out UUIDs, but any
/// string is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the cluster resource for this job.
    ///
    /// The mapping is a pure function of the id, which is what makes
    /// creation idempotent across retries and restarts. Ids that do not
    /// form a valid DNS-1123 label are hashed.
    pub fn cluster_name(&self) -> String {
        let candidate = format!("{}{}", CLUSTER_NAME_PREFIX, self.0.to_lowercase());
        if candidate.len() <= MAX_NAME_LEN && DNS_LABEL.is_match(&candidate) {
            return candidate;
        }

        let digest = Sha256::digest(self.0.as_bytes());
        format!("{}{}", CLUSTER_NAME_PREFIX, &hex::encode(digest)[..16])
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_maps_to_prefixed_name() {
        let id = JobId::new("0190B7E2-5C1A-4B7E-9F3D-2E6A1C0D4F5B");
        assert_eq!(
            id.cluster_name(),
            "buildkite-0190b7e2-5c1a-4b7e-9f3d-2e6a1c0d4f5b"
        );
    }

    #[test]
    fn test_name_is_deterministic() {
        let id = JobId::new("some job/with spaces");
        assert_eq!(id.cluster_name(), id.cluster_name());
        assert_eq!(id.cluster_name(), JobId::new("some job/with spaces").cluster_name());
    }

    #[test]
    fn test_invalid_ids_are_hashed() {
        let name = JobId::new("job_with_underscores").cluster_name();
        assert!(name.starts_with(CLUSTER_NAME_PREFIX));
        assert_eq!(name.len(), CLUSTER_NAME_PREFIX.len() + 16);
        assert!(DNS_LABEL.is_match(&name));

        let long = JobId::new("a".repeat(80)).cluster_name();
        assert!(long.len() <= MAX_NAME_LEN);
        assert_ne!(long, name);
    }

    #[test]
    fn test_display_is_raw_id() {
        assert_eq!(JobId::from("abc").to_string(), "abc");
    }
}
