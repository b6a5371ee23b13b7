//! The keeper process: shared state, the self-clocked periodic tasks
//! (reconciliation, PostgreSQL state probing, publication) and shutdown.

use std::net::ToSocketAddrs;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use camino::Utf8PathBuf;
use cluster_api::{
    Config, KeeperDiscoveryInfo, KeeperInfo, KeeperState, PostgresState, DEFAULT_SLEEP_INTERVAL,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use utils::crashsafe;

use crate::http;
use crate::pg::{ConnParams, Manager, Parameters, PgConfig, PgInstance, DEFAULT_PG_PARAMETERS};
use crate::store::StoreManager;

/// Static keeper configuration, as assembled from the command line.
#[derive(Clone, Debug)]
pub struct KeeperConf {
    pub id: String,
    pub data_dir: Utf8PathBuf,
    pub listen_address: String,
    pub port: String,
    pub pg_listen_address: String,
    pub pg_port: String,
    pub pg_bin_path: Utf8PathBuf,
    pub pg_conf_dir: Option<Utf8PathBuf>,
    pub pg_repl_username: String,
    pub pg_repl_password: String,
    pub pg_su_username: String,
    pub pg_su_password: String,
    pub pg_ssl_replication: bool,
    pub pg_ssl_cert_file: String,
    pub pg_ssl_key_file: String,
    pub pg_ssl_ca_file: String,
    pub pg_ssl_ciphers: String,
}

impl KeeperConf {
    fn sslmode(&self) -> &'static str {
        if self.pg_ssl_replication {
            "require"
        } else {
            "disable"
        }
    }

    /// Conninfo for administrative SQL against the local instance. pg_hba
    /// grants trust on localhost, so no password and no TLS.
    pub fn local_conn_params(&self) -> ConnParams {
        let mut params = ConnParams::new();
        params.set("user", &self.pg_su_username);
        params.set("host", "localhost");
        params.set("port", &self.pg_port);
        params.set("dbname", "postgres");
        params.set("sslmode", "disable");
        params
    }

    /// Replication conninfo pointing at the followed keeper's instance; goes
    /// into recovery.conf and drives pg_basebackup.
    pub fn repl_conn_params(&self, followed: &KeeperState) -> ConnParams {
        let mut params = ConnParams::new();
        params.set("user", &self.pg_repl_username);
        params.set("password", &self.pg_repl_password);
        params.set("host", &followed.pg_listen_address);
        params.set("port", &followed.pg_port);
        params.set("application_name", &self.id);
        params.set("sslmode", self.sslmode());
        params
    }

    /// Superuser conninfo pointing at the followed keeper's instance, needed
    /// by pg_rewind.
    pub fn su_conn_params(&self, followed: &KeeperState) -> ConnParams {
        let mut params = ConnParams::new();
        params.set("user", &self.pg_su_username);
        params.set("password", &self.pg_su_password);
        params.set("host", &followed.pg_listen_address);
        params.set("port", &followed.pg_port);
        params.set("application_name", &self.id);
        params.set("dbname", "postgres");
        params.set("sslmode", self.sslmode());
        params
    }

    /// Compute the postgresql.conf parameter set for the current cluster
    /// view: cluster-provided settings, the baseline, then the derived ones.
    pub fn create_pg_parameters(&self, followers_ids: &[String], config: &Config) -> Parameters {
        let mut parameters: Parameters = config.pg_parameters.clone().into_iter().collect();

        // Cluster-provided settings never override the baseline.
        for (key, value) in DEFAULT_PG_PARAMETERS {
            parameters.insert(key.to_string(), value.to_string());
        }

        parameters.insert(
            "listen_addresses".to_string(),
            format!("127.0.0.1,{}", self.pg_listen_address),
        );
        parameters.insert("port".to_string(), self.pg_port.clone());
        parameters.insert(
            "max_replication_slots".to_string(),
            config.max_standbys_per_sender.to_string(),
        );
        // Some extra wal senders, since the keeper itself will use them.
        parameters.insert(
            "max_wal_senders".to_string(),
            (config.max_standbys_per_sender + 2).to_string(),
        );

        if config.use_pg_rewind {
            // Required by pg_rewind; ignored when data checksums are enabled.
            parameters.insert("wal_log_hints".to_string(), "on".to_string());
        }

        parameters.insert(
            "synchronous_standby_names".to_string(),
            if config.synchronous_replication {
                followers_ids.join(",")
            } else {
                String::new()
            },
        );

        parameters.insert(
            "ssl".to_string(),
            if self.pg_ssl_replication { "on" } else { "off" }.to_string(),
        );
        if !self.pg_ssl_cert_file.is_empty() {
            parameters.insert("ssl_cert_file".to_string(), self.pg_ssl_cert_file.clone());
            if !self.pg_ssl_ca_file.is_empty() {
                parameters.insert("ssl_ca_file".to_string(), self.pg_ssl_ca_file.clone());
            }
        }
        if !self.pg_ssl_key_file.is_empty() {
            parameters.insert("ssl_key_file".to_string(), self.pg_ssl_key_file.clone());
        }
        if !self.pg_ssl_ciphers.is_empty() {
            parameters.insert("ssl_ciphers".to_string(), self.pg_ssl_ciphers.clone());
        }

        parameters
    }
}

pub struct PostgresKeeper {
    pub(crate) conf: KeeperConf,
    pub(crate) store: StoreManager,
    pub(crate) pgm: Arc<dyn PgInstance>,
    pub(crate) cluster_config: RwLock<Config>,
    pub(crate) cancel: CancellationToken,

    cv_version: Mutex<i64>,
    last_pg_state: Mutex<Option<PostgresState>>,
    // Serializes every SQL-issuing probe so we never hold more than one
    // connection's worth of probes at a time.
    get_pg_state_mutex: tokio::sync::Mutex<()>,
}

impl PostgresKeeper {
    pub fn new(
        conf: KeeperConf,
        store: StoreManager,
        pgm: Arc<dyn PgInstance>,
        cluster_config: Config,
        cancel: CancellationToken,
    ) -> PostgresKeeper {
        PostgresKeeper {
            conf,
            store,
            pgm,
            cluster_config: RwLock::new(cluster_config),
            cancel,
            cv_version: Mutex::new(0),
            last_pg_state: Mutex::new(None),
            get_pg_state_mutex: tokio::sync::Mutex::new(()),
        }
    }

    /// Wait for the store to answer, then assemble the keeper around the
    /// initial cluster configuration. A store that answers with no cluster
    /// data yet is fine; an unreachable store is retried forever.
    pub async fn bootstrap(
        conf: KeeperConf,
        store: StoreManager,
        cancel: CancellationToken,
    ) -> Result<Arc<PostgresKeeper>> {
        let cluster_data = loop {
            match store.get_cluster_data().await {
                Ok((cluster_data, _)) => break cluster_data,
                Err(e) => error!("error retrieving cluster data: {e:#}"),
            }
            tokio::select! {
                _ = tokio::time::sleep(DEFAULT_SLEEP_INTERVAL) => {}
                _ = cancel.cancelled() => bail!("canceled while waiting for the store"),
            }
        };

        let cv = cluster_data.map(|d| d.cluster_view).unwrap_or_default();
        debug!("cluster view: {cv:?}");
        let cluster_config = cv.config.to_config();
        debug!("cluster config: {cluster_config:?}");

        let followers_ids = cv.followers_of(&conf.id);
        let pg_parameters = conf.create_pg_parameters(&followers_ids, &cluster_config);
        let pgm = Manager::new(
            PgConfig {
                name: conf.id.clone(),
                pg_bin_path: conf.pg_bin_path.clone(),
                data_dir: conf.data_dir.clone(),
                conf_dir: conf.pg_conf_dir.clone(),
                parameters: pg_parameters,
                su_username: conf.pg_su_username.clone(),
                su_password: conf.pg_su_password.clone(),
                repl_username: conf.pg_repl_username.clone(),
                repl_password: conf.pg_repl_password.clone(),
                local_conn_params: conf.local_conn_params(),
                request_timeout: cluster_config.request_timeout,
            },
            cancel.clone(),
        );

        let keeper = Arc::new(PostgresKeeper::new(
            conf,
            store,
            Arc::new(pgm),
            cluster_config,
            cancel,
        ));
        keeper
            .load_cv_version()
            .context("failed to load cluster view version file")?;
        Ok(keeper)
    }

    pub fn conf(&self) -> &KeeperConf {
        &self.conf
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn use_pg_rewind(&self, config: &Config) -> bool {
        !self.conf.pg_su_username.is_empty()
            && !self.conf.pg_su_password.is_empty()
            && config.use_pg_rewind
    }

    pub fn sleep_interval(&self) -> Duration {
        self.cluster_config.read().unwrap().sleep_interval
    }

    /// Probe the local instance. Only one probe sequence runs at a time, to
    /// avoid exhausting the available connections.
    pub async fn get_pg_state(&self) -> Result<PostgresState> {
        let _guard = self.get_pg_state_mutex.lock().await;
        self.pgm.pg_state().await
    }

    pub async fn update_pg_state(&self) {
        match self.get_pg_state().await {
            Ok(pg_state) => {
                debug!("keeper pg state: {pg_state:?}");
                *self.last_pg_state.lock().unwrap() = Some(pg_state);
            }
            Err(e) => error!("error getting pgstate: {e:#}"),
        }
    }

    pub fn last_pg_state(&self) -> Option<PostgresState> {
        self.last_pg_state.lock().unwrap().clone()
    }

    pub fn cv_version(&self) -> i64 {
        *self.cv_version.lock().unwrap()
    }

    fn cv_version_path(&self) -> Utf8PathBuf {
        self.conf.data_dir.join("cvversion")
    }

    /// Persist the version of the view this keeper has acted on. The
    /// persisted value never goes backwards.
    pub(crate) fn save_cv_version(&self, version: i64) -> Result<()> {
        let mut cv_version = self.cv_version.lock().unwrap();
        if version <= *cv_version {
            return Ok(());
        }
        crashsafe::overwrite(
            &self.cv_version_path(),
            version.to_string().as_bytes(),
            0o600,
        )?;
        *cv_version = version;
        Ok(())
    }

    fn load_cv_version(&self) -> Result<()> {
        let contents = match std::fs::read_to_string(self.cv_version_path()) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context("error reading the cvversion file"),
        };
        let version = contents
            .trim()
            .parse::<i64>()
            .with_context(|| format!("malformed cvversion file contents {contents:?}"))?;
        *self.cv_version.lock().unwrap() = version;
        Ok(())
    }

    pub fn keeper_info(&self) -> KeeperInfo {
        KeeperInfo {
            id: self.conf.id.clone(),
            cluster_view_version: self.cv_version(),
            listen_address: self.conf.listen_address.clone(),
            port: self.conf.port.clone(),
            pg_listen_address: self.conf.pg_listen_address.clone(),
            pg_port: self.conf.pg_port.clone(),
        }
    }

    /// Publish discovery info (with a TTL, so a dead keeper disappears) and
    /// our current keeper state.
    pub async fn publish(&self) -> Result<()> {
        let discovery_info = KeeperDiscoveryInfo {
            listen_address: self.conf.listen_address.clone(),
            port: self.conf.port.clone(),
        };
        debug!("discovery info: {discovery_info:?}");
        self.store
            .set_keeper_discovery_info(&self.conf.id, &discovery_info, 2 * self.sleep_interval())
            .await
            .context("error publishing discovery info")?;

        let keeper_state = KeeperState {
            id: self.conf.id.clone(),
            listen_address: self.conf.listen_address.clone(),
            port: self.conf.port.clone(),
            pg_listen_address: self.conf.pg_listen_address.clone(),
            pg_port: self.conf.pg_port.clone(),
            cluster_view_version: self.cv_version(),
            healthy: true,
            pg_state: self.last_pg_state(),
        };
        self.store
            .set_keeper_state(&self.conf.id, &keeper_state)
            .await
            .context("error publishing keeper state")?;
        Ok(())
    }

    /// Run the keeper until shutdown: the HTTP API plus three self-clocked
    /// periodic tasks, each re-arming its own timer after a completed tick so
    /// a slow tick can never overlap itself.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        // A postmaster left over from a previous keeper death must not keep
        // running behind our back while we reconcile.
        if let Err(e) = self.pgm.stop(false).await {
            debug!("initial stop: {e:#}");
        }

        let http_addr = format!("{}:{}", self.conf.listen_address, self.conf.port)
            .to_socket_addrs()
            .context("cannot resolve the keeper listen address")?
            .next()
            .ok_or_else(|| anyhow!("the keeper listen address resolves to nothing"))?;
        let mut http_task = http::launch_http_server(http_addr, self, self.cancel.clone())?;

        let mut tasks = Vec::new();

        let keeper = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            loop {
                keeper.reconcile().await;
                tokio::select! {
                    _ = tokio::time::sleep(keeper.sleep_interval()) => {}
                    _ = keeper.cancel.cancelled() => break,
                }
            }
        }));

        let keeper = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            loop {
                keeper.update_pg_state().await;
                tokio::select! {
                    _ = tokio::time::sleep(keeper.sleep_interval()) => {}
                    _ = keeper.cancel.cancelled() => break,
                }
            }
        }));

        let keeper = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            loop {
                if let Err(e) = keeper.publish().await {
                    error!("failed to publish keeper info: {e:#}");
                }
                tokio::select! {
                    _ = tokio::time::sleep(keeper.sleep_interval()) => {}
                    _ = keeper.cancel.cancelled() => break,
                }
            }
        }));

        let res = tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            join = &mut http_task => {
                self.cancel.cancel();
                match join {
                    Ok(Ok(())) => Err(anyhow!("http server exited unexpectedly")),
                    Ok(Err(e)) => Err(e.context("http server failed")),
                    Err(e) => Err(anyhow!(e).context("http server panicked")),
                }
            }
        };

        info!("Stopping keeper.");
        for task in tasks {
            let _ = task.await;
        }
        if let Err(e) = self.pgm.stop(false).await {
            error!("failed to stop postgres: {e:#}");
        }
        res
    }
}
