//! etcd backend for the [`Store`] trait.

use std::time::Duration;

use etcd_client::{
    Certificate, Client, Compare, CompareOp, ConnectOptions, GetOptions, Identity, PutOptions,
    TlsOptions, Txn, TxnOp,
};

use super::{KvPair, Store, StoreError, StoreTls};

pub const DEFAULT_ETCD_ENDPOINTS: &str = "127.0.0.1:2379";

pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(endpoints: &[String], tls: StoreTls) -> Result<EtcdStore, StoreError> {
        let mut tls_options = None;
        if tls.ca_pem.is_some() || tls.cert_pem.is_some() {
            let mut options = TlsOptions::new();
            if let Some(ca) = &tls.ca_pem {
                options = options.ca_certificate(Certificate::from_pem(ca.clone()));
            }
            if let (Some(cert), Some(key)) = (&tls.cert_pem, &tls.key_pem) {
                options = options.identity(Identity::from_pem(cert.clone(), key.clone()));
            }
            tls_options = Some(options);
        }

        let connect_options = tls_options.map(|tls| ConnectOptions::new().with_tls(tls));
        let client = Client::connect(endpoints, connect_options).await?;
        Ok(EtcdStore { client })
    }

    // etcd_client methods need &mut; the client is a cheap handle around a
    // shared channel.
    fn client(&self) -> Client {
        self.client.clone()
    }
}

#[async_trait::async_trait]
impl Store for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<KvPair>, StoreError> {
        let resp = self.client().get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| KvPair {
            key: String::from_utf8_lossy(kv.key()).into_owned(),
            value: kv.value().to_vec(),
            mod_index: kv.mod_revision() as u64,
        }))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.client().put(key, value, None).await?;
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut client = self.client();
        // etcd rounds sub-second TTLs down to zero; always grant at least 1s.
        let lease = client.lease_grant(ttl.as_secs().max(1) as i64, None).await?;
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease.id())))
            .await?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &[u8],
        mod_index: u64,
    ) -> Result<bool, StoreError> {
        let compare = if mod_index == 0 {
            Compare::create_revision(key, CompareOp::Equal, 0)
        } else {
            Compare::mod_revision(key, CompareOp::Equal, mod_index as i64)
        };
        let txn = Txn::new()
            .when(vec![compare])
            .and_then(vec![TxnOp::put(key, value, None)]);
        let resp = self.client().txn(txn).await?;
        Ok(resp.succeeded())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>, StoreError> {
        let resp = self
            .client()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| KvPair {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
                mod_index: kv.mod_revision() as u64,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.client().delete(key, None).await?;
        Ok(())
    }
}
