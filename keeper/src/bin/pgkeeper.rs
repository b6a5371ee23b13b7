//! Main entry point for the keeper executable.
//!
//! One keeper supervises one local PostgreSQL instance: it takes an
//! exclusive lock on the data directory, connects to the cluster store and
//! then runs the reconciliation loop until it is told to stop.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cluster_api::is_valid_keeper_id;
use keeper::keeper::{KeeperConf, PostgresKeeper};
use keeper::store::{
    ConsulStore, EtcdStore, Store, StoreManager, StoreTls, DEFAULT_CONSUL_ENDPOINTS,
    DEFAULT_ETCD_ENDPOINTS,
};
use utils::crashsafe;
use utils::lock::DirLock;
use utils::logging::{self, LogFormat};

const ID_FILE_NAME: &str = "pgid";

const ABOUT: &str = r#"
The keeper supervises a single PostgreSQL instance as part of a replicated
cluster: it converges the instance to the role published by the cluster
sentinel (master, or standby of another keeper) and reports its state back
into the store.
"#;

#[derive(Parser)]
#[command(name = "pgkeeper", about = ABOUT, long_about = None)]
struct Args {
    /// Keeper id (must be unique in the cluster; only lower-case letters,
    /// numbers and the underscore). A random id is generated on first run if
    /// not provided.
    #[arg(long, env = "STKEEPER_ID")]
    id: Option<String>,
    /// Store backend type (etcd or consul).
    #[arg(long, env = "STKEEPER_STORE_BACKEND")]
    store_backend: Option<String>,
    /// Comma-delimited list of store endpoints.
    #[arg(long, env = "STKEEPER_STORE_ENDPOINTS")]
    store_endpoints: Option<String>,
    /// Path to the client TLS certificate file for the store.
    #[arg(long, env = "STKEEPER_STORE_CERT")]
    store_cert: Option<Utf8PathBuf>,
    /// Path to the client TLS key file for the store.
    #[arg(long, env = "STKEEPER_STORE_KEY")]
    store_key: Option<Utf8PathBuf>,
    /// Path to the trusted CA certificate file for the store.
    #[arg(long, env = "STKEEPER_STORE_CACERT")]
    store_cacert: Option<Utf8PathBuf>,
    /// Keeper data directory.
    #[arg(long, env = "STKEEPER_DATA_DIR")]
    data_dir: Option<Utf8PathBuf>,
    /// Cluster name.
    #[arg(long, env = "STKEEPER_CLUSTER_NAME")]
    cluster_name: Option<String>,
    /// Keeper listening address.
    #[arg(long, env = "STKEEPER_LISTEN_ADDRESS", default_value = "localhost")]
    listen_address: String,
    /// Keeper listening port.
    #[arg(long, env = "STKEEPER_PORT", default_value = "5431")]
    port: String,
    /// PostgreSQL instance listening address.
    #[arg(long, env = "STKEEPER_PG_LISTEN_ADDRESS", default_value = "localhost")]
    pg_listen_address: String,
    /// PostgreSQL instance listening port.
    #[arg(long, env = "STKEEPER_PG_PORT", default_value = "5432")]
    pg_port: String,
    /// Absolute path to the PostgreSQL binaries. If empty they are searched
    /// in the current PATH.
    #[arg(long, env = "STKEEPER_PG_BIN_PATH")]
    pg_bin_path: Option<Utf8PathBuf>,
    /// Absolute path to user provided postgres configuration. If empty a
    /// default dir under $dataDir/postgres/conf.d will be used.
    #[arg(long, env = "STKEEPER_PG_CONF_DIR")]
    pg_conf_dir: Option<Utf8PathBuf>,
    /// Postgres replication user name. Required; must be the same for all
    /// keepers.
    #[arg(long, env = "STKEEPER_PG_REPL_USERNAME")]
    pg_repl_username: Option<String>,
    /// Postgres replication user password.
    #[arg(long, env = "STKEEPER_PG_REPL_PASSWORD")]
    pg_repl_password: Option<String>,
    /// Postgres replication user password file.
    #[arg(long, env = "STKEEPER_PG_REPL_PASSWORDFILE")]
    pg_repl_passwordfile: Option<Utf8PathBuf>,
    /// Postgres superuser name. Used for keeper managed instance access and
    /// pg_rewind based synchronization. Defaults to the user running the
    /// keeper; must be the same for all keepers.
    #[arg(long, env = "STKEEPER_PG_SU_USERNAME")]
    pg_su_username: Option<String>,
    /// Postgres superuser password. Needed for pg_rewind based
    /// synchronization.
    #[arg(long, env = "STKEEPER_PG_SU_PASSWORD")]
    pg_su_password: Option<String>,
    /// Postgres superuser password file.
    #[arg(long, env = "STKEEPER_PG_SU_PASSWORDFILE")]
    pg_su_passwordfile: Option<Utf8PathBuf>,
    /// Enable SSL replication.
    #[arg(long, env = "STKEEPER_PG_SSL_REPLICATION")]
    pg_ssl_replication: bool,
    /// Postgres SSL certificate file.
    #[arg(long, env = "STKEEPER_PG_SSL_CERT_FILE")]
    pg_ssl_cert_file: Option<String>,
    /// Postgres SSL private key file.
    #[arg(long, env = "STKEEPER_PG_SSL_KEY_FILE")]
    pg_ssl_key_file: Option<String>,
    /// Postgres SSL certificate authority file.
    #[arg(long, env = "STKEEPER_PG_SSL_CA_FILE")]
    pg_ssl_ca_file: Option<String>,
    /// Postgres SSL allowed ciphers list.
    #[arg(long, env = "STKEEPER_PG_SSL_CIPHERS")]
    pg_ssl_ciphers: Option<String>,
    /// Enable debug logging.
    #[arg(long, env = "STKEEPER_DEBUG")]
    debug: bool,
    /// Format for logging, either 'plain' or 'json'.
    #[arg(long, env = "STKEEPER_LOG_FORMAT", default_value = "plain")]
    log_format: String,
}

fn read_password_from_file(path: &Utf8Path) -> Result<String> {
    let metadata = std::fs::symlink_metadata(path)
        .with_context(|| format!("unable to read password from file {path:?}"))?;
    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o177 != 0 {
        if cfg!(feature = "strict_perms") {
            bail!(
                "password file {path:?} permissions {mode:#o} are too open. \
                 This file must only be readable to the user executing the keeper"
            );
        }
        warn!(
            "password file {path:?} permissions {mode:#o} are too open. \
             This file should only be readable to the user executing the keeper! Continuing..."
        );
    }

    let password = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read password from file {path:?}"))?;
    Ok(password.trim().to_string())
}

fn current_username() -> Result<String> {
    let uid = nix::unistd::getuid();
    let user = nix::unistd::User::from_uid(uid)
        .context("failed to look up the current user")?
        .ok_or_else(|| anyhow!("no passwd entry for uid {uid}"))?;
    Ok(user.name)
}

/// Load the persisted keeper id, reconcile it with the one given on the
/// command line, or generate a fresh one.
fn set_id(data_dir: &Utf8Path, flag_id: Option<&str>) -> Result<String> {
    if let Some(id) = flag_id {
        if !is_valid_keeper_id(id) {
            bail!(
                "keeper id {id:?} not valid. It can contain only lower-case letters, \
                 numbers and the underscore character"
            );
        }
    }

    let id_file = data_dir.join(ID_FILE_NAME);
    let saved_id = match std::fs::read_to_string(&id_file) {
        Ok(contents) => Some(contents.trim().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e).context("error reading the keeper id file"),
    };

    match (saved_id, flag_id) {
        (Some(saved), Some(flag)) if saved != flag => {
            bail!("saved id {saved:?} differs from configuration id {flag:?}")
        }
        (Some(saved), _) => Ok(saved),
        (None, flag) => {
            let id = match flag {
                Some(flag) => flag.to_string(),
                None => {
                    let random: [u8; 4] = rand::random();
                    let id = random.iter().map(|b| format!("{b:02x}")).collect::<String>();
                    info!("generated id: {id}");
                    id
                }
            };
            crashsafe::overwrite(&id_file, id.as_bytes(), 0o600)?;
            Ok(id)
        }
    }
}

fn read_pem(path: &Option<Utf8PathBuf>) -> Result<Option<Vec<u8>>> {
    match path {
        None => Ok(None),
        Some(path) => Ok(Some(std::fs::read(path).with_context(|| {
            format!("cannot read store TLS file {path:?}")
        })?)),
    }
}

async fn build_store(args: &Args) -> Result<Arc<dyn Store>> {
    let backend = args
        .store_backend
        .as_deref()
        .ok_or_else(|| anyhow!("store backend type required"))?;
    let tls = StoreTls {
        cert_pem: read_pem(&args.store_cert)?,
        key_pem: read_pem(&args.store_key)?,
        ca_pem: read_pem(&args.store_cacert)?,
    };

    match backend {
        "etcd" => {
            let endpoints: Vec<String> = args
                .store_endpoints
                .as_deref()
                .unwrap_or(DEFAULT_ETCD_ENDPOINTS)
                .split(',')
                .map(|s| s.trim().to_string())
                .collect();
            let store = EtcdStore::connect(&endpoints, tls)
                .await
                .context("cannot create etcd store client")?;
            Ok(Arc::new(store))
        }
        "consul" => {
            let endpoints = args
                .store_endpoints
                .as_deref()
                .unwrap_or(DEFAULT_CONSUL_ENDPOINTS);
            let endpoint = endpoints.split(',').next().unwrap().trim();
            let store =
                ConsulStore::new(endpoint, tls).context("cannot create consul store client")?;
            Ok(Arc::new(store))
        }
        other => bail!("unknown store backend {other:?} (expected etcd or consul)"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init(
        LogFormat::from_config(&args.log_format)?,
        if args.debug { "debug" } else { "info" },
    )?;

    let data_dir = args
        .data_dir
        .clone()
        .ok_or_else(|| anyhow!("data dir required"))?;
    let cluster_name = args
        .cluster_name
        .clone()
        .ok_or_else(|| anyhow!("cluster name required"))?;

    if let Some(conf_dir) = &args.pg_conf_dir {
        if !conf_dir.is_absolute() {
            bail!("pg-conf-dir must be an absolute path");
        }
        let metadata = std::fs::metadata(conf_dir).context("cannot stat pg-conf-dir")?;
        if !metadata.is_dir() {
            bail!("pg-conf-dir is not a directory");
        }
    }

    let pg_repl_username = args
        .pg_repl_username
        .clone()
        .ok_or_else(|| anyhow!("--pg-repl-username is required"))?;

    if args.pg_repl_password.is_none() && args.pg_repl_passwordfile.is_none() {
        bail!("one of --pg-repl-password or --pg-repl-passwordfile is required");
    }
    if args.pg_repl_password.is_some() && args.pg_repl_passwordfile.is_some() {
        bail!("only one of --pg-repl-password or --pg-repl-passwordfile must be provided");
    }
    if args.pg_su_password.is_none() && args.pg_su_passwordfile.is_none() {
        bail!("one of --pg-su-password or --pg-su-passwordfile is required");
    }
    if args.pg_su_password.is_some() && args.pg_su_passwordfile.is_some() {
        bail!("only one of --pg-su-password or --pg-su-passwordfile must be provided");
    }

    let pg_repl_password = match &args.pg_repl_passwordfile {
        Some(path) => {
            read_password_from_file(path).context("cannot read pg replication user password")?
        }
        None => args.pg_repl_password.clone().unwrap(),
    };
    let pg_su_password = match &args.pg_su_passwordfile {
        Some(path) => read_password_from_file(path).context("cannot read pg superuser password")?,
        None => args.pg_su_password.clone().unwrap_or_default(),
    };

    let pg_su_username = match &args.pg_su_username {
        Some(name) => name.clone(),
        None => current_username()?,
    };

    if pg_su_username == pg_repl_username {
        warn!("superuser name and replication user name are the same. Different users are suggested.");
        if pg_su_password != pg_repl_password {
            bail!("provided superuser name and replication user name are the same but provided passwords are different");
        }
    }

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("cannot create data dir {data_dir:?}"))?;
    std::fs::set_permissions(&data_dir, std::fs::Permissions::from_mode(0o700))?;

    // Only one keeper per data directory, ever.
    let lock = DirLock::acquire(&data_dir)
        .with_context(|| format!("cannot take exclusive lock on data dir {data_dir:?}"))?;
    // Hold the lock for the whole process lifetime.
    std::mem::forget(lock);

    let id = set_id(&data_dir, args.id.as_deref())?;
    info!("id: {id}");

    let store = build_store(&args).await?;
    let store = StoreManager::new(store, &cluster_name);

    let conf = KeeperConf {
        id,
        data_dir,
        listen_address: args.listen_address.clone(),
        port: args.port.clone(),
        pg_listen_address: args.pg_listen_address.clone(),
        pg_port: args.pg_port.clone(),
        pg_bin_path: args.pg_bin_path.clone().unwrap_or_default(),
        pg_conf_dir: args.pg_conf_dir.clone(),
        pg_repl_username,
        pg_repl_password,
        pg_su_username,
        pg_su_password,
        pg_ssl_replication: args.pg_ssl_replication,
        pg_ssl_cert_file: args.pg_ssl_cert_file.clone().unwrap_or_default(),
        pg_ssl_key_file: args.pg_ssl_key_file.clone().unwrap_or_default(),
        pg_ssl_ca_file: args.pg_ssl_ca_file.clone().unwrap_or_default(),
        pg_ssl_ciphers: args.pg_ssl_ciphers.clone().unwrap_or_default(),
    };

    let cancel = CancellationToken::new();
    tokio::spawn(utils::signals::signal_handler(cancel.clone()));

    let keeper = PostgresKeeper::bootstrap(conf, store, cancel).await?;
    keeper.run().await
}
