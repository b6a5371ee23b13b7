use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::NilConfig;

/// Keeper identifiers double as PostgreSQL replication slot names, so they
/// are restricted to lower-case letters, digits and the underscore.
pub fn is_valid_keeper_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Standby,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Role::Master => f.write_str("master"),
            Role::Standby => f.write_str("standby"),
        }
    }
}

/// One switch point in a PostgreSQL timeline history.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineHistory {
    #[serde(rename = "TimelineID")]
    pub timeline_id: u32,
    #[serde(rename = "SwitchPoint")]
    pub switch_point: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelinesHistory(pub Vec<TimelineHistory>);

impl TimelinesHistory {
    /// The entry describing the switch away from `timeline_id`, if any.
    pub fn get(&self, timeline_id: u32) -> Option<&TimelineHistory> {
        self.0.iter().find(|tlh| tlh.timeline_id == timeline_id)
    }
}

/// Snapshot of a local PostgreSQL instance, as published by its keeper.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PostgresState {
    #[serde(rename = "Initialized")]
    pub initialized: bool,
    #[serde(rename = "Role", skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(rename = "SystemID")]
    pub system_id: u64,
    #[serde(rename = "TimelineID")]
    pub timeline_id: u32,
    #[serde(rename = "XLogPos")]
    pub xlog_pos: u64,
    #[serde(rename = "TimelinesHistory", default)]
    pub timelines_history: TimelinesHistory,
    #[serde(rename = "ReplicationLag", default)]
    pub replication_lag: i64,
}

/// Role assignment for one keeper inside the cluster view. An empty `Follow`
/// marks the root of the follower tree, i.e. the master.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeeperRole {
    #[serde(rename = "Follow", default)]
    pub follow: String,
}

/// The sentinel-authored declaration of desired roles. Keepers only read it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterView {
    #[serde(rename = "Version")]
    pub version: i64,
    #[serde(rename = "Master", default)]
    pub master: String,
    #[serde(rename = "KeepersRole", default)]
    pub keepers_role: BTreeMap<String, KeeperRole>,
    #[serde(rename = "Config", default)]
    pub config: NilConfig,
}

impl ClusterView {
    /// IDs of the keepers assigned to follow `id`, in stable order.
    pub fn followers_of(&self, id: &str) -> Vec<String> {
        self.keepers_role
            .iter()
            .filter(|(_, role)| role.follow == id)
            .map(|(follower, _)| follower.clone())
            .collect()
    }
}

/// State document each keeper writes for itself under `keepers/<id>/state`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KeeperState {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "ListenAddress")]
    pub listen_address: String,
    #[serde(rename = "Port")]
    pub port: String,
    #[serde(rename = "PGListenAddress")]
    pub pg_listen_address: String,
    #[serde(rename = "PGPort")]
    pub pg_port: String,
    #[serde(rename = "ClusterViewVersion", default)]
    pub cluster_view_version: i64,
    #[serde(rename = "Healthy", default)]
    pub healthy: bool,
    #[serde(rename = "PGState", skip_serializing_if = "Option::is_none")]
    pub pg_state: Option<PostgresState>,
}

pub type KeepersState = BTreeMap<String, KeeperState>;

/// The `clusterdata` document: the cluster view plus the sentinel's merged
/// copy of all keeper states.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterData {
    #[serde(rename = "ClusterView")]
    pub cluster_view: ClusterView,
    #[serde(rename = "KeepersState", default)]
    pub keepers_state: KeepersState,
}

/// Discovery document published with a TTL so the sentinel can find live
/// keepers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeeperDiscoveryInfo {
    #[serde(rename = "ListenAddress")]
    pub listen_address: String,
    #[serde(rename = "Port")]
    pub port: String,
}

/// Response body of the keeper's `GET /info` endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeeperInfo {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "ClusterViewVersion")]
    pub cluster_view_version: i64,
    #[serde(rename = "ListenAddress")]
    pub listen_address: String,
    #[serde(rename = "Port")]
    pub port: String,
    #[serde(rename = "PGListenAddress")]
    pub pg_listen_address: String,
    #[serde(rename = "PGPort")]
    pub pg_port: String,
}
