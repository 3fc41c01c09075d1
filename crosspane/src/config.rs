//! Engine configuration. One explicit struct handed to the engine at
//! construction; nothing global, nothing mutable after startup.

use std::num::NonZeroUsize;
use std::time::Duration;

use anyhow::bail;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_PART_CONCURRENCY: usize = 4;
pub const DEFAULT_SCRATCH_QUOTA: u64 = 10 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Where the job journal lives.
    pub journal_path: Utf8PathBuf,
    /// Scratch directory for cross-provider stream-through transfers.
    pub scratch_dir: Utf8PathBuf,
    /// Worker pool size: how many jobs run at once.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Cap on concurrent part transfers within a single job.
    #[serde(default = "default_part_concurrency")]
    pub part_concurrency: NonZeroUsize,
    /// Stream-through jobs fail with `outOfScratch` once this much scratch
    /// space is reserved.
    #[serde(default = "default_scratch_quota")]
    pub scratch_quota_bytes: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Progress events per job are throttled to one per this interval
    /// (plus one on completion).
    #[serde(with = "humantime_serde", default = "default_progress_interval")]
    pub progress_event_interval: Duration,
    /// Journal writes during progress are throttled to one per this
    /// interval; status changes are always written immediately.
    #[serde(with = "humantime_serde", default = "default_journal_interval")]
    pub journal_progress_interval: Duration,
    /// Capacity of the job event channel handed to subscribers.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_base_millis")]
    pub base_millis: u64,
    #[serde(default = "default_retry_max_millis")]
    pub max_millis: u64,
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_warn_threshold")]
    pub warn_threshold: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            base_millis: default_retry_base_millis(),
            max_millis: default_retry_max_millis(),
            max_attempts: default_retry_attempts(),
            warn_threshold: default_retry_warn_threshold(),
        }
    }
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_part_concurrency() -> NonZeroUsize {
    NonZeroUsize::new(DEFAULT_PART_CONCURRENCY).unwrap()
}

fn default_scratch_quota() -> u64 {
    DEFAULT_SCRATCH_QUOTA
}

fn default_progress_interval() -> Duration {
    Duration::from_millis(200)
}

fn default_journal_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_event_capacity() -> usize {
    1024
}

fn default_retry_base_millis() -> u64 {
    500
}

fn default_retry_max_millis() -> u64 {
    30_000
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_warn_threshold() -> u32 {
    3
}

impl EngineConfig {
    /// A config rooted under one directory, good defaults everywhere else.
    pub fn rooted_at(root: impl Into<Utf8PathBuf>) -> Self {
        let root = root.into();
        EngineConfig {
            journal_path: root.join("jobs.json"),
            scratch_dir: root.join("scratch"),
            workers: default_workers(),
            part_concurrency: default_part_concurrency(),
            scratch_quota_bytes: default_scratch_quota(),
            retry: RetryConfig::default(),
            progress_event_interval: default_progress_interval(),
            journal_progress_interval: default_journal_interval(),
            event_capacity: default_event_capacity(),
        }
    }

    pub fn from_toml(toml: &toml_edit::Item) -> anyhow::Result<EngineConfig> {
        let document: toml_edit::DocumentMut = match toml {
            toml_edit::Item::Table(toml) => toml.clone().into(),
            toml_edit::Item::Value(toml_edit::Value::InlineTable(toml)) => {
                toml.clone().into_table().into()
            }
            _ => bail!("toml not a table or inline table"),
        };
        Ok(toml_edit::de::from_document(document)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_with_defaults() {
        let input = "\
        journal_path = '/var/lib/crosspane/jobs.json'
        scratch_dir = '/var/lib/crosspane/scratch'
        workers = 8
        progress_event_interval = '200ms'
        ";
        let toml = input.parse::<toml_edit::DocumentMut>().unwrap();
        let config = EngineConfig::from_toml(toml.as_item()).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.part_concurrency.get(), DEFAULT_PART_CONCURRENCY);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_millis, 500);
        assert_eq!(config.progress_event_interval, Duration::from_millis(200));
    }
}
