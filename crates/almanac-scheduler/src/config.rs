//! Engine configuration.
//!
//! Configuration is a serde-deserializable document with environment
//! variable overrides (`ALMANAC_*`), so deployments can ship a config file
//! and still tweak individual knobs per environment.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rate_limit::DEFAULT_SUBMISSION_RATE_PER_SEC;
use crate::scheduler::TimeoutConfig;
use crate::state_manager::DEFAULT_SHARD_COUNT;

/// How often the scheduler tick runs, in seconds.
pub const SCHEDULER_TICK_INTERVAL_SECS: u64 = 2;
/// How often the trigger-manager and backfill ticks run, in seconds.
pub const TRIGGER_MANAGER_TICK_INTERVAL_SECS: u64 = 1;
/// How often the runtime configuration is re-read from storage, in seconds.
pub const RUNTIME_CONFIG_UPDATE_INTERVAL_SECS: u64 = 5;

/// Deployment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Real storage and container runtime.
    Production,
    /// In-memory storage and a simulated container runner.
    #[default]
    Development,
}

/// Coordinates of the GKE cluster executions are submitted to in production
/// mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GkeClusterConfig {
    /// GCP project id.
    pub project_id: String,
    /// Cluster zone.
    pub zone: String,
    /// Cluster id.
    pub cluster_id: String,
    /// Namespace executions run in.
    pub namespace: String,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SchedulerConfig {
    /// Deployment mode.
    pub mode: Mode,
    /// HTTP listen port.
    pub http_port: u16,
    /// Per-state TTLs as `state label → ISO-8601 duration`, with a
    /// `default` key.
    pub stale_state_ttls: HashMap<String, String>,
    /// Initial global submission rate, permits per second.
    pub submission_rate_per_sec: f64,
    /// Number of state-manager shard workers.
    pub shard_count: usize,
    /// Scheduler tick interval in seconds.
    pub scheduler_tick_interval_secs: u64,
    /// Trigger-manager and backfill tick interval in seconds.
    pub trigger_tick_interval_secs: u64,
    /// Runtime-config refresh interval in seconds.
    pub runtime_config_interval_secs: u64,
    /// GKE cluster coordinates (production mode).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gke: Option<GkeClusterConfig>,
    /// Event-store coordinates (production mode).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_store_uri: Option<String>,
    /// Document-store coordinates (production mode).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_store_uri: Option<String>,
    /// User-Agent values refused by the HTTP surface.
    pub client_blacklist: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Development,
            http_port: 8080,
            stale_state_ttls: HashMap::from([("default".to_string(), "PT24H".to_string())]),
            submission_rate_per_sec: DEFAULT_SUBMISSION_RATE_PER_SEC,
            shard_count: DEFAULT_SHARD_COUNT,
            scheduler_tick_interval_secs: SCHEDULER_TICK_INTERVAL_SECS,
            trigger_tick_interval_secs: TRIGGER_MANAGER_TICK_INTERVAL_SECS,
            runtime_config_interval_secs: RUNTIME_CONFIG_UPDATE_INTERVAL_SECS,
            gke: None,
            event_store_uri: None,
            document_store_uri: None,
            client_blacklist: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    /// Loads the default configuration with `ALMANAC_*` environment
    /// overrides applied.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unparseable override values.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(mode) = optional_env("ALMANAC_MODE") {
            config.mode = match mode.to_ascii_lowercase().as_str() {
                "production" => Mode::Production,
                "development" => Mode::Development,
                other => {
                    return Err(Error::configuration(format!("invalid ALMANAC_MODE: {other}")));
                }
            };
        }
        if let Some(port) = optional_env("ALMANAC_HTTP_PORT") {
            config.http_port = port
                .parse()
                .map_err(|_| Error::configuration("invalid ALMANAC_HTTP_PORT"))?;
        }
        if let Some(rate) = optional_env("ALMANAC_SUBMISSION_RATE") {
            config.submission_rate_per_sec = rate
                .parse()
                .map_err(|_| Error::configuration("invalid ALMANAC_SUBMISSION_RATE"))?;
        }
        if let Some(shards) = optional_env("ALMANAC_SHARD_COUNT") {
            config.shard_count = shards
                .parse()
                .map_err(|_| Error::configuration("invalid ALMANAC_SHARD_COUNT"))?;
        }
        if let Some(ttls) = optional_env("ALMANAC_STALE_STATE_TTLS") {
            config.stale_state_ttls = parse_ttl_list(&ttls)?;
        }
        if let Some(blacklist) = optional_env("ALMANAC_CLIENT_BLACKLIST") {
            config.client_blacklist = blacklist
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        Ok(config)
    }

    /// Builds the per-state timeout configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown states or malformed
    /// durations.
    pub fn timeout_config(&self) -> Result<TimeoutConfig> {
        TimeoutConfig::from_map(&self.stale_state_ttls)
    }

    /// Returns true in development mode.
    #[must_use]
    pub fn is_dev_mode(&self) -> bool {
        self.mode == Mode::Development
    }

    /// Scheduler tick interval.
    #[must_use]
    pub fn scheduler_tick_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_interval_secs.max(1))
    }

    /// Trigger-manager and backfill tick interval.
    #[must_use]
    pub fn trigger_tick_interval(&self) -> Duration {
        Duration::from_secs(self.trigger_tick_interval_secs.max(1))
    }

    /// Runtime-config refresh interval.
    #[must_use]
    pub fn runtime_config_interval(&self) -> Duration {
        Duration::from_secs(self.runtime_config_interval_secs.max(1))
    }
}

/// Parses `state=PT5M,default=PT24H` into the TTL map.
fn parse_ttl_list(raw: &str) -> Result<HashMap<String, String>> {
    let mut ttls = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (state, duration) = entry.split_once('=').ok_or_else(|| {
            Error::configuration(format!("invalid ALMANAC_STALE_STATE_TTLS entry: {entry}"))
        })?;
        ttls.insert(state.trim().to_string(), duration.trim().to_string());
    }
    Ok(ttls)
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = SchedulerConfig::default();
        assert!(config.is_dev_mode());
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.scheduler_tick_interval(), Duration::from_secs(2));
        assert_eq!(config.trigger_tick_interval(), Duration::from_secs(1));
        assert_eq!(config.runtime_config_interval(), Duration::from_secs(5));
        config.timeout_config().unwrap();
    }

    #[test]
    fn ttl_list_parses_pairs() {
        let ttls = parse_ttl_list("submitted=PT10M, default=PT24H").unwrap();
        assert_eq!(ttls["submitted"], "PT10M");
        assert_eq!(ttls["default"], "PT24H");
        assert!(parse_ttl_list("submitted").is_err());
    }

    #[test]
    fn config_deserializes_from_json() {
        let config: SchedulerConfig = serde_json::from_str(
            r#"{
                "mode": "production",
                "http-port": 9090,
                "stale-state-ttls": {"submitted": "PT10M", "default": "PT1H"},
                "gke": {
                    "project-id": "acme",
                    "zone": "europe-west1-d",
                    "cluster-id": "scheduler",
                    "namespace": "workflows"
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.mode, Mode::Production);
        assert_eq!(config.http_port, 9090);
        assert_eq!(config.gke.as_ref().unwrap().project_id, "acme");
        assert_eq!(
            config.timeout_config().unwrap().ttl(almanac_core::State::Submitted),
            chrono::Duration::minutes(10)
        );
    }
}
