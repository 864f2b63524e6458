//! Duration parsing.

use crate::{ConfigError, ConfigResult};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

static COMPONENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)(ms|h|m|s)").expect("valid duration regex"));

/// Parse a duration such as `10m`, `1m30s`, `500ms` or `2h`.
///
/// A bare number is taken as seconds.
pub fn parse_duration(input: &str) -> ConfigResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ConfigError::InvalidDuration("empty duration".to_string()));
    }

    if let Ok(secs) = input.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut consumed = 0;
    for caps in COMPONENT.captures_iter(input) {
        let whole = caps.get(0).expect("group 0 always matches");
        if whole.start() != consumed {
            return Err(ConfigError::InvalidDuration(input.to_string()));
        }
        consumed = whole.end();

        let invalid = || ConfigError::InvalidDuration(input.to_string());
        let value: u64 = caps[1].parse().map_err(|_| invalid())?;
        let component = match &caps[2] {
            "ms" => Some(Duration::from_millis(value)),
            "s" => Some(Duration::from_secs(value)),
            "m" => value.checked_mul(60).map(Duration::from_secs),
            "h" => value.checked_mul(3600).map(Duration::from_secs),
            _ => unreachable!("regex only matches known units"),
        };
        total = component
            .and_then(|component| total.checked_add(component))
            .ok_or_else(invalid)?;
    }

    if consumed != input.len() {
        return Err(ConfigError::InvalidDuration(input.to_string()));
    }

    Ok(total)
}
