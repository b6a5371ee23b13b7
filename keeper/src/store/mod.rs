//! Typed access to the cluster state kept in etcd or consul. The sentinel
//! owns `clusterdata`; each keeper owns its `keepers/<id>/...` subtree.

use std::sync::Arc;
use std::time::Duration;

use cluster_api::{ClusterData, ClusterView, KeeperDiscoveryInfo, KeeperState, KeepersState};
use serde::Serialize;
use tracing::warn;

mod consul;
mod etcd;
pub mod mem;

pub use consul::{ConsulStore, DEFAULT_CONSUL_ENDPOINTS};
pub use etcd::{EtcdStore, DEFAULT_ETCD_ENDPOINTS};

/// Client TLS material, as read from the
/// `--store-cert/--store-key/--store-cacert` files.
#[derive(Default)]
pub struct StoreTls {
    pub cert_pem: Option<Vec<u8>>,
    pub key_pem: Option<Vec<u8>>,
    pub ca_pem: Option<Vec<u8>>,
}

/// All cluster state lives under `<DEFAULT_STORE_BASE_PATH>/<cluster-name>/`.
pub const DEFAULT_STORE_BASE_PATH: &str = "pgkeeper/cluster";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("consul request error: {0}")]
    Consul(#[from] reqwest::Error),
    #[error("malformed value at {key}: {source}")]
    BadValue {
        key: String,
        source: serde_json::Error,
    },
    #[error("{0}")]
    Other(String),
}

/// A key-value entry together with the store's modification index, used for
/// compare-and-swap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_index: u64,
}

/// The backing key-value store. Both backends provide per-key sequential
/// consistency, which is all the keeper relies on.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KvPair>, StoreError>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Write a key that disappears unless refreshed within `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration)
        -> Result<(), StoreError>;

    /// Atomically replace the value iff the key's modification index still
    /// equals `mod_index`; `mod_index == 0` means "create only if absent".
    /// Returns whether the swap took place.
    async fn compare_and_swap(
        &self,
        key: &str,
        value: &[u8],
        mod_index: u64,
    ) -> Result<bool, StoreError>;

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Typed layer over a [`Store`], scoped to one cluster.
#[derive(Clone)]
pub struct StoreManager {
    store: Arc<dyn Store>,
    base_path: String,
}

impl StoreManager {
    pub fn new(store: Arc<dyn Store>, cluster_name: &str) -> StoreManager {
        StoreManager {
            store,
            base_path: format!("{DEFAULT_STORE_BASE_PATH}/{cluster_name}"),
        }
    }

    fn cluster_data_path(&self) -> String {
        format!("{}/clusterdata", self.base_path)
    }

    fn keepers_prefix(&self) -> String {
        format!("{}/keepers/", self.base_path)
    }

    fn keeper_state_path(&self, id: &str) -> String {
        format!("{}/keepers/{}/state", self.base_path, id)
    }

    fn keeper_discovery_path(&self, id: &str) -> String {
        format!("{}/keepers/{}/discovery", self.base_path, id)
    }

    /// The sentinel-authored cluster document. `None` means the sentinel has
    /// not populated the cluster yet; the caller should wait and retry.
    pub async fn get_cluster_data(&self) -> Result<(Option<ClusterData>, u64), StoreError> {
        let key = self.cluster_data_path();
        match self.store.get(&key).await? {
            None => Ok((None, 0)),
            Some(pair) => {
                let data = serde_json::from_slice(&pair.value)
                    .map_err(|source| StoreError::BadValue { key, source })?;
                Ok((Some(data), pair.mod_index))
            }
        }
    }

    pub async fn get_cluster_view(&self) -> Result<(Option<ClusterView>, u64), StoreError> {
        let (data, mod_index) = self.get_cluster_data().await?;
        Ok((data.map(|d| d.cluster_view), mod_index))
    }

    /// The per-keeper state entries. A malformed entry is skipped with a
    /// warning so one corrupt keeper cannot blind the others.
    pub async fn get_keepers_state(&self) -> Result<KeepersState, StoreError> {
        let mut keepers_state = KeepersState::new();
        for pair in self.store.list(&self.keepers_prefix()).await? {
            if !pair.key.ends_with("/state") {
                continue;
            }
            match serde_json::from_slice::<KeeperState>(&pair.value) {
                Ok(state) => {
                    keepers_state.insert(state.id.clone(), state);
                }
                Err(e) => warn!("skipping malformed keeper state at {:?}: {e}", pair.key),
            }
        }
        Ok(keepers_state)
    }

    pub async fn set_keeper_state(&self, id: &str, state: &KeeperState) -> Result<(), StoreError> {
        self.store
            .set(&self.keeper_state_path(id), &to_json(state)?)
            .await
    }

    pub async fn set_keeper_discovery_info(
        &self,
        id: &str,
        info: &KeeperDiscoveryInfo,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.store
            .set_with_ttl(&self.keeper_discovery_path(id), &to_json(info)?, ttl)
            .await
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Other(format!("serialization failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::mem::MemStore;
    use super::*;
    use cluster_api::PostgresState;

    fn manager() -> (Arc<MemStore>, StoreManager) {
        let store = Arc::new(MemStore::default());
        let manager = StoreManager::new(store.clone(), "mycluster");
        (store, manager)
    }

    #[tokio::test]
    async fn cluster_data_not_populated() {
        let (_, manager) = manager();
        let (data, mod_index) = manager.get_cluster_data().await.unwrap();
        assert!(data.is_none());
        assert_eq!(mod_index, 0);
    }

    #[tokio::test]
    async fn keeper_state_round_trip() {
        let (store, manager) = manager();

        let state = KeeperState {
            id: "a".into(),
            listen_address: "localhost".into(),
            port: "5431".into(),
            pg_listen_address: "localhost".into(),
            pg_port: "5432".into(),
            cluster_view_version: 4,
            healthy: true,
            pg_state: Some(PostgresState::default()),
        };
        manager.set_keeper_state("a", &state).await.unwrap();

        // The entry lands under the documented path.
        assert!(store
            .get("pgkeeper/cluster/mycluster/keepers/a/state")
            .await
            .unwrap()
            .is_some());

        let keepers_state = manager.get_keepers_state().await.unwrap();
        assert_eq!(keepers_state.get("a"), Some(&state));
    }

    #[tokio::test]
    async fn malformed_keeper_state_is_skipped() {
        let (store, manager) = manager();

        store
            .set("pgkeeper/cluster/mycluster/keepers/bad/state", b"not json")
            .await
            .unwrap();
        manager
            .set_keeper_state("good", &KeeperState {
                id: "good".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let keepers_state = manager.get_keepers_state().await.unwrap();
        assert_eq!(keepers_state.len(), 1);
        assert!(keepers_state.contains_key("good"));
    }

    #[tokio::test]
    async fn discovery_info_carries_ttl() {
        let (store, manager) = manager();

        let info = KeeperDiscoveryInfo {
            listen_address: "localhost".into(),
            port: "5431".into(),
        };
        manager
            .set_keeper_discovery_info("a", &info, Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(
            store.ttl_of("pgkeeper/cluster/mycluster/keepers/a/discovery"),
            Some(Duration::from_secs(10))
        );
    }
}
