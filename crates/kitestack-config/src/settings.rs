//! Runtime settings.

use crate::{ConfigError, ConfigResult};
use std::time::Duration;
use url::Url;

pub const DEFAULT_GRAPHQL_ENDPOINT: &str = "https://graphql.buildkite.com/v1";

/// Bounded exponential backoff applied to every external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Everything a running instance needs, validated once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Buildkite organization slug.
    pub org: String,
    /// Pipeline slug within the organization.
    pub pipeline: String,
    /// Buildkite API token.
    pub token: String,
    /// Maximum number of concurrently admitted jobs.
    pub max_in_flight: usize,
    /// How long finished cluster jobs are kept.
    pub job_ttl: Duration,
    /// Base interval between backend polls.
    pub poll_interval: Duration,
    /// Upper bound of the random delay added to each poll.
    pub poll_jitter: Duration,
    /// Interval between cluster status checks.
    pub completion_interval: Duration,
    /// Interval between garbage collection sweeps.
    pub gc_interval: Duration,
    /// Namespace cluster jobs are created in.
    pub namespace: String,
    /// Agent image used when a job has no `image=` tag.
    pub default_image: String,
    /// Secret holding `BUILDKITE_AGENT_TOKEN` for the agents.
    pub agent_token_secret: String,
    pub graphql_endpoint: Url,
    pub retry: RetryPolicy,
    /// Capacity of the monitor to scheduler queue.
    pub event_queue_capacity: usize,
    /// How long loops get to stop after cancellation.
    pub shutdown_grace: Duration,
}

impl Config {
    /// Creates a configuration with defaults for every tunable.
    pub fn new(
        org: impl Into<String>,
        pipeline: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            org: org.into(),
            pipeline: pipeline.into(),
            token: token.into(),
            max_in_flight: 1,
            job_ttl: Duration::from_secs(10 * 60),
            poll_interval: Duration::from_secs(5),
            poll_jitter: Duration::from_secs(1),
            completion_interval: Duration::from_secs(5),
            gc_interval: Duration::from_secs(30),
            namespace: "default".to_string(),
            default_image: "buildkite/agent:3".to_string(),
            agent_token_secret: "buildkite-agent-token".to_string(),
            graphql_endpoint: Url::parse(DEFAULT_GRAPHQL_ENDPOINT)
                .expect("default endpoint is a valid URL"),
            retry: RetryPolicy::default(),
            event_queue_capacity: 256,
            shutdown_grace: Duration::from_secs(10),
        }
    }

    /// Slug the Buildkite API knows the pipeline by.
    pub fn pipeline_slug(&self) -> String {
        format!("{}/{}", self.org, self.pipeline)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.org.trim().is_empty() {
            return Err(ConfigError::MissingField("org".to_string()));
        }

        if self.pipeline.trim().is_empty() {
            return Err(ConfigError::MissingField("pipeline".to_string()));
        }

        if self.token.trim().is_empty() {
            return Err(ConfigError::MissingField("token".to_string()));
        }

        if self.namespace.trim().is_empty() {
            return Err(ConfigError::MissingField("namespace".to_string()));
        }

        if self.default_image.trim().is_empty() {
            return Err(ConfigError::MissingField("default-image".to_string()));
        }

        if self.max_in_flight == 0 {
            return Err(invalid("max-in-flight", "must be greater than 0"));
        }

        if self.poll_interval.is_zero() {
            return Err(invalid("poll-interval", "must be greater than 0"));
        }

        if self.completion_interval.is_zero() {
            return Err(invalid("completion-interval", "must be greater than 0"));
        }

        if self.gc_interval.is_zero() {
            return Err(invalid("gc-interval", "must be greater than 0"));
        }

        if self.event_queue_capacity == 0 {
            return Err(invalid("event-queue-capacity", "must be greater than 0"));
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max-attempts", "must be greater than 0"));
        }

        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(invalid(
                "retry.initial-backoff",
                "must not exceed retry.max-backoff",
            ));
        }

        if !matches!(self.graphql_endpoint.scheme(), "http" | "https") {
            return Err(invalid("graphql-endpoint", "must be an http(s) URL"));
        }

        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}
