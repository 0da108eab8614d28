use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_BUFFER_SIZE: usize = 100;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_PURGE_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Label distinguishing this process group from others writing to the same store,
    /// e.g. `"api:us-west-2a"`. Blank means the host name.
    pub instance_id: String,
    /// How many application frames to capture per execution. Zero disables caller capture.
    pub caller_depth: usize,
    /// Capacity of the ingestion channel. Producers wait once it is full.
    pub buffer_size: usize,
    /// Age after which persisted history rows of this instance are purged. Zero disables purging.
    pub retention: Duration,
    /// Attach host CPU and memory usage to every rollup.
    pub system_resources: bool,
    /// How long [`Insights::shutdown`](crate::Insights::shutdown) lets the collector take to hand over.
    pub stop_timeout: Duration,
    pub flush_interval: Duration,
    /// Skip creating the store's tables at start.
    pub skip_migration: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_id: String::new(),
            caller_depth: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
            retention: Duration::ZERO,
            system_resources: false,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            skip_migration: false,
        }
    }
}

impl Config {
    /// Defaults overlaid with any `SQL_INSIGHTS_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("SQL_INSIGHTS_INSTANCE_ID") {
            config.instance_id = value;
        }
        if let Some(value) = env_parse("SQL_INSIGHTS_CALLER_DEPTH") {
            config.caller_depth = value;
        }
        if let Some(value) = env_parse("SQL_INSIGHTS_BUFFER_SIZE") {
            config.buffer_size = value;
        }
        if let Some(value) = env_parse("SQL_INSIGHTS_RETENTION_SECS") {
            config.retention = Duration::from_secs(value);
        }
        if let Some(value) = env_flag("SQL_INSIGHTS_SYSTEM_RESOURCES") {
            config.system_resources = value;
        }
        if let Some(value) = env_parse("SQL_INSIGHTS_STOP_TIMEOUT_MS") {
            config.stop_timeout = Duration::from_millis(value);
        }
        if let Some(value) = env_parse("SQL_INSIGHTS_FLUSH_INTERVAL_SECS") {
            config.flush_interval = Duration::from_secs(value);
        }
        if let Some(value) = env_flag("SQL_INSIGHTS_SKIP_MIGRATION") {
            config.skip_migration = value;
        }
        config.apply_defaults();
        config
    }

    pub fn apply_defaults(&mut self) {
        if self.buffer_size == 0 {
            self.buffer_size = DEFAULT_BUFFER_SIZE;
        }
        if self.flush_interval.is_zero() {
            self.flush_interval = DEFAULT_FLUSH_INTERVAL;
        }
        self.instance_id = self.instance_id.trim().to_string();
        if self.instance_id.is_empty() {
            self.instance_id = sysinfo::System::host_name().unwrap_or_else(|| "local".to_string());
        }
    }

    pub fn track_callers(&self) -> bool {
        self.caller_depth > 0
    }

    /// How often the collector checks whether a purge is due: a 24th of the retention, never more than hourly.
    pub fn purge_interval(&self) -> Duration {
        (self.retention / 24).max(MIN_PURGE_INTERVAL)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn env_flag(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?.trim().to_lowercase();
    Some(matches!(value.as_str(), "1" | "true" | "yes" | "on"))
}
