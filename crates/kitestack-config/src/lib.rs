//! Configuration for kitestack.
//!
//! This crate handles:
//! - The validated runtime `Config`
//! - KDL tuning files layered over the defaults
//! - Human-readable durations (`10m`, `1m30s`, `500ms`)

pub mod duration;
pub mod error;
pub mod settings;
pub mod tuning;

pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use settings::{Config, RetryPolicy};
pub use tuning::{apply_tuning, apply_tuning_file};
