//! Consul backend for the [`Store`] trait, talking to the HTTP KV API.
//! TTL'd keys are implemented with consul sessions (`Behavior=delete`): the
//! key is acquired under a session whose TTL matches the requested one, and
//! every refresh renews the session.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::{KvPair, Store, StoreError, StoreTls};

pub const DEFAULT_CONSUL_ENDPOINTS: &str = "127.0.0.1:8500";

// Consul rejects session TTLs below 10 seconds.
const MIN_SESSION_TTL: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct KvEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
    #[serde(rename = "ModifyIndex")]
    modify_index: u64,
}

#[derive(Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

pub struct ConsulStore {
    http: reqwest::Client,
    base_url: String,
    session: tokio::sync::Mutex<Option<String>>,
}

impl ConsulStore {
    pub fn new(endpoint: &str, tls: StoreTls) -> Result<ConsulStore, StoreError> {
        let mut builder = reqwest::Client::builder();
        let secure = tls.ca_pem.is_some() || tls.cert_pem.is_some();
        if let Some(ca) = &tls.ca_pem {
            let cert = reqwest::Certificate::from_pem(ca).map_err(StoreError::Consul)?;
            builder = builder.add_root_certificate(cert);
        }
        if let (Some(cert), Some(key)) = (&tls.cert_pem, &tls.key_pem) {
            // rustls wants the key and the certificate chain in one PEM blob.
            let mut pem = key.clone();
            pem.extend_from_slice(cert);
            let identity = reqwest::Identity::from_pem(&pem).map_err(StoreError::Consul)?;
            builder = builder.identity(identity);
        }

        let scheme = if secure { "https" } else { "http" };
        Ok(ConsulStore {
            http: builder.build().map_err(StoreError::Consul)?,
            base_url: format!("{scheme}://{endpoint}"),
            session: tokio::sync::Mutex::new(None),
        })
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.base_url, key)
    }

    async fn get_entries(&self, url: &str) -> Result<Vec<KvEntry>, StoreError> {
        let resp = self.http.get(url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        Ok(resp.error_for_status()?.json().await?)
    }

    async fn create_session(&self, ttl: Duration) -> Result<String, StoreError> {
        let ttl = ttl.max(MIN_SESSION_TTL);
        let body = serde_json::json!({
            "Behavior": "delete",
            "TTL": format!("{}s", ttl.as_secs()),
            "LockDelay": "0s",
        });
        let created: SessionCreated = self
            .http
            .put(format!("{}/v1/session/create", self.base_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(created.id)
    }

    /// Renew the cached session or create a fresh one.
    async fn session_for_ttl(&self, ttl: Duration) -> Result<String, StoreError> {
        let mut session = self.session.lock().await;
        if let Some(id) = session.as_ref() {
            let renewed = self
                .http
                .put(format!("{}/v1/session/renew/{}", self.base_url, id))
                .send()
                .await
                .map(|resp| resp.status().is_success())
                .unwrap_or(false);
            if renewed {
                return Ok(id.clone());
            }
            debug!("consul session {id} expired, creating a new one");
        }
        let id = self.create_session(ttl).await?;
        *session = Some(id.clone());
        Ok(id)
    }

    async fn put_bool(&self, url: &str, value: &[u8]) -> Result<bool, StoreError> {
        let body = self
            .http
            .put(url)
            .body(value.to_vec())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body.trim() == "true")
    }
}

fn decode_value(key: &str, entry: &KvEntry) -> Result<Vec<u8>, StoreError> {
    match &entry.value {
        None => Ok(Vec::new()),
        Some(encoded) => base64::decode(encoded)
            .map_err(|e| StoreError::Other(format!("invalid base64 value at {key:?}: {e}"))),
    }
}

#[async_trait::async_trait]
impl Store for ConsulStore {
    async fn get(&self, key: &str) -> Result<Option<KvPair>, StoreError> {
        let entries = self.get_entries(&self.kv_url(key)).await?;
        match entries.first() {
            None => Ok(None),
            Some(entry) => Ok(Some(KvPair {
                key: entry.key.clone(),
                value: decode_value(key, entry)?,
                mod_index: entry.modify_index,
            })),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.put_bool(&self.kv_url(key), value).await?;
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let session = self.session_for_ttl(ttl).await?;
        let url = format!("{}?acquire={}", self.kv_url(key), session);
        if !self.put_bool(&url, value).await? {
            // The session was invalidated between renew and acquire; recreate
            // once and retry.
            *self.session.lock().await = None;
            let session = self.session_for_ttl(ttl).await?;
            let url = format!("{}?acquire={}", self.kv_url(key), session);
            if !self.put_bool(&url, value).await? {
                return Err(StoreError::Other(format!(
                    "failed to acquire {key:?} with consul session {session:?}"
                )));
            }
        }
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &[u8],
        mod_index: u64,
    ) -> Result<bool, StoreError> {
        let url = format!("{}?cas={}", self.kv_url(key), mod_index);
        self.put_bool(&url, value).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>, StoreError> {
        let url = format!("{}?recurse", self.kv_url(prefix));
        let entries = self.get_entries(&url).await?;
        entries
            .iter()
            .map(|entry| {
                Ok(KvPair {
                    key: entry.key.clone(),
                    value: decode_value(&entry.key, entry)?,
                    mod_index: entry.modify_index,
                })
            })
            .collect()
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.http
            .delete(self.kv_url(key))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
