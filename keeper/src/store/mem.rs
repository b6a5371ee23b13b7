//! In-memory [`Store`] used by tests.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use super::{KvPair, Store, StoreError};

#[derive(Default)]
struct MemInner {
    data: BTreeMap<String, (Vec<u8>, u64)>,
    ttls: BTreeMap<String, Duration>,
    next_index: u64,
}

/// A process-local key-value store. TTLs are recorded but never expire; tests
/// assert on them directly.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.inner.lock().unwrap().ttls.get(key).copied()
    }
}

#[async_trait::async_trait]
impl Store for MemStore {
    async fn get(&self, key: &str) -> Result<Option<KvPair>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.data.get(key).map(|(value, mod_index)| KvPair {
            key: key.to_string(),
            value: value.clone(),
            mod_index: *mod_index,
        }))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_index += 1;
        let mod_index = inner.next_index;
        inner.data.insert(key.to_string(), (value.to_vec(), mod_index));
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.set(key, value).await?;
        self.inner.lock().unwrap().ttls.insert(key.to_string(), ttl);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &[u8],
        mod_index: u64,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.data.get(key).map(|(_, idx)| *idx).unwrap_or(0);
        if current != mod_index {
            return Ok(false);
        }
        inner.next_index += 1;
        let next = inner.next_index;
        inner.data.insert(key.to_string(), (value.to_vec(), next));
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, (value, mod_index))| KvPair {
                key: key.clone(),
                value: value.clone(),
                mod_index: *mod_index,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.data.remove(key);
        inner.ttls.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn compare_and_swap_semantics() {
        let store = MemStore::default();

        // mod_index 0 creates only if absent.
        assert!(store.compare_and_swap("k", b"v1", 0).await.unwrap());
        assert!(!store.compare_and_swap("k", b"v2", 0).await.unwrap());

        let pair = store.get("k").await.unwrap().unwrap();
        assert_eq!(pair.value, b"v1");

        assert!(!store.compare_and_swap("k", b"v2", 999).await.unwrap());
        assert!(store
            .compare_and_swap("k", b"v2", pair.mod_index)
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap().unwrap().value, b"v2");
    }

    #[tokio::test]
    async fn list_is_prefix_scoped() {
        let store = MemStore::default();
        store.set("a/1", b"x").await.unwrap();
        store.set("a/2", b"y").await.unwrap();
        store.set("b/1", b"z").await.unwrap();

        let pairs = store.list("a/").await.unwrap();
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().all(|p| p.key.starts_with("a/")));

        store.delete("a/1").await.unwrap();
        assert_eq!(store.list("a/").await.unwrap().len(), 1);
    }
}
