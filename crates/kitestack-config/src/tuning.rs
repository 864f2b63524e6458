//! KDL tuning files.
//!
//! A tuning file overrides the non-secret parts of `Config`:
//!
//! ```kdl
//! max-in-flight 4
//! job-ttl "15m"
//! namespace "ci"
//! retry max-attempts=3 initial-backoff="500ms" max-backoff="30s"
//! ```
//!
//! Credentials never come from this file.

use crate::{Config, ConfigError, ConfigResult, parse_duration};
use kdl::{KdlDocument, KdlNode, KdlValue};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Apply the settings in `kdl` on top of `config`.
pub fn apply_tuning(config: &mut Config, kdl: &str) -> ConfigResult<()> {
    let doc: KdlDocument = kdl.parse()?;

    for node in doc.nodes() {
        match node.name().value() {
            "org" => config.org = required_string(node, "org")?,
            "pipeline" => config.pipeline = required_string(node, "pipeline")?,
            "max-in-flight" => config.max_in_flight = required_count(node, "max-in-flight")?,
            "job-ttl" => config.job_ttl = required_duration(node, "job-ttl")?,
            "poll-interval" => config.poll_interval = required_duration(node, "poll-interval")?,
            "poll-jitter" => config.poll_jitter = required_duration(node, "poll-jitter")?,
            "completion-interval" => {
                config.completion_interval = required_duration(node, "completion-interval")?;
            }
            "gc-interval" => config.gc_interval = required_duration(node, "gc-interval")?,
            "namespace" => config.namespace = required_string(node, "namespace")?,
            "default-image" => config.default_image = required_string(node, "default-image")?,
            "agent-token-secret" => {
                config.agent_token_secret = required_string(node, "agent-token-secret")?;
            }
            "graphql-endpoint" => {
                let raw = required_string(node, "graphql-endpoint")?;
                config.graphql_endpoint =
                    Url::parse(&raw).map_err(|e| ConfigError::InvalidValue {
                        field: "graphql-endpoint".to_string(),
                        message: e.to_string(),
                    })?;
            }
            "event-queue-capacity" => {
                config.event_queue_capacity = required_count(node, "event-queue-capacity")?;
            }
            "shutdown-grace" => config.shutdown_grace = required_duration(node, "shutdown-grace")?,
            "retry" => {
                if let Some(value) = node.get("max-attempts") {
                    config.retry.max_attempts =
                        u32::try_from(count_value(value, "retry.max-attempts")?).map_err(|_| {
                            ConfigError::InvalidValue {
                                field: "retry.max-attempts".to_string(),
                                message: "out of range".to_string(),
                            }
                        })?;
                }
                if let Some(value) = node.get("initial-backoff") {
                    config.retry.initial_backoff =
                        duration_value(value, "retry.initial-backoff")?;
                }
                if let Some(value) = node.get("max-backoff") {
                    config.retry.max_backoff = duration_value(value, "retry.max-backoff")?;
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(())
}

/// Read a tuning file from disk and apply it.
pub fn apply_tuning_file(config: &mut Config, path: &Path) -> ConfigResult<()> {
    let text = std::fs::read_to_string(path)?;
    apply_tuning(config, &text)
}

// Helper functions for extracting values from KDL nodes

fn first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn required_arg<'a>(node: &'a KdlNode, field: &str) -> ConfigResult<&'a KdlValue> {
    first_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

fn required_string(node: &KdlNode, field: &str) -> ConfigResult<String> {
    required_arg(node, field)?
        .as_string()
        .map(|s| s.to_string())
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            message: "expected a string".to_string(),
        })
}

fn required_count(node: &KdlNode, field: &str) -> ConfigResult<usize> {
    count_value(required_arg(node, field)?, field)
}

fn required_duration(node: &KdlNode, field: &str) -> ConfigResult<Duration> {
    duration_value(required_arg(node, field)?, field)
}

fn count_value(value: &KdlValue, field: &str) -> ConfigResult<usize> {
    value
        .as_integer()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            message: "expected a non-negative integer".to_string(),
        })
}

/// Durations are strings (`"10m"`) or bare integers meaning seconds.
fn duration_value(value: &KdlValue, field: &str) -> ConfigResult<Duration> {
    if let Some(secs) = value.as_integer() {
        return u64::try_from(secs)
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidValue {
                field: field.to_string(),
                message: "must not be negative".to_string(),
            });
    }

    let text = value.as_string().ok_or_else(|| ConfigError::InvalidValue {
        field: field.to_string(),
        message: "expected a duration".to_string(),
    })?;
    parse_duration(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::new("acme", "deploy", "bk-token")
    }

    #[test]
    fn test_overrides_tunables() {
        let kdl = r#"
            max-in-flight 4
            job-ttl "15m"
            poll-interval 3
            namespace "ci"
            default-image "buildkite/agent:3-ubuntu"
            retry max-attempts=3 initial-backoff="500ms" max-backoff="30s"
        "#;

        let mut config = config();
        apply_tuning(&mut config, kdl).unwrap();

        assert_eq!(config.max_in_flight, 4);
        assert_eq!(config.job_ttl, Duration::from_secs(900));
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.namespace, "ci");
        assert_eq!(config.default_image, "buildkite/agent:3-ubuntu");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(500));
        assert_eq!(config.retry.max_backoff, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_untouched_fields_keep_defaults() {
        let mut config = config();
        apply_tuning(&mut config, "gc-interval \"1m\"").unwrap();

        assert_eq!(config.gc_interval, Duration::from_secs(60));
        assert_eq!(config.max_in_flight, 1);
        assert_eq!(config.token, "bk-token");
    }

    #[test]
    fn test_unknown_nodes_are_ignored() {
        let mut config = config();
        apply_tuning(&mut config, "something-else \"value\"").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_values() {
        let mut config = config();
        let result = apply_tuning(&mut config, "max-in-flight \"four\"");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));

        let result = apply_tuning(&mut config, "job-ttl \"forever\"");
        assert!(matches!(result, Err(ConfigError::InvalidDuration(_))));

        let result = apply_tuning(&mut config, "namespace");
        assert!(matches!(result, Err(ConfigError::MissingField(_))));

        let result = apply_tuning(&mut config, "graphql-endpoint \"not a url\"");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_parse_error() {
        let mut config = config();
        let result = apply_tuning(&mut config, "max-in-flight {");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
