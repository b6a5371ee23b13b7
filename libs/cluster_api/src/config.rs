use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SLEEP_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_STANDBYS_PER_SENDER: u32 = 3;

/// Cluster configuration as stored inside the cluster view. Every field is
/// optional so the sentinel can publish a partial document; [`to_config`]
/// materializes the defaults.
///
/// [`to_config`]: NilConfig::to_config
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NilConfig {
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub sleep_interval: Option<Duration>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_standbys_per_sender: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronous_replication: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_pg_rewind: Option<bool>,
    /// Free-form postgresql.conf settings applied to every keeper.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub pg_parameters: HashMap<String, String>,
}

/// Materialized cluster configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub sleep_interval: Duration,
    pub request_timeout: Duration,
    pub max_standbys_per_sender: u32,
    pub synchronous_replication: bool,
    pub use_pg_rewind: bool,
    pub pg_parameters: HashMap<String, String>,
}

impl NilConfig {
    pub fn to_config(&self) -> Config {
        Config {
            sleep_interval: self.sleep_interval.unwrap_or(DEFAULT_SLEEP_INTERVAL),
            request_timeout: self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            max_standbys_per_sender: self
                .max_standbys_per_sender
                .unwrap_or(DEFAULT_MAX_STANDBYS_PER_SENDER),
            synchronous_replication: self.synchronous_replication.unwrap_or(false),
            use_pg_rewind: self.use_pg_rewind.unwrap_or(false),
            pg_parameters: self.pg_parameters.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        NilConfig::default().to_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = NilConfig::default().to_config();
        assert_eq!(config.sleep_interval, DEFAULT_SLEEP_INTERVAL);
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(config.max_standbys_per_sender, 3);
        assert!(!config.synchronous_replication);
        assert!(!config.use_pg_rewind);
    }

    #[test]
    fn partial_document() {
        let nil: NilConfig =
            serde_json::from_str(r#"{"sleep_interval": "2s", "use_pg_rewind": true}"#).unwrap();
        let config = nil.to_config();
        assert_eq!(config.sleep_interval, Duration::from_secs(2));
        assert!(config.use_pg_rewind);
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
    }
}
