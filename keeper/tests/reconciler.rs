//! Scenario tests for the reconciliation state machine, driven through a
//! scripted PostgreSQL fake and the in-memory store.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use camino::Utf8PathBuf;
use tokio_util::sync::CancellationToken;

use cluster_api::{
    ClusterData, ClusterView, Config, KeeperRole, KeeperState, NilConfig, PostgresState, Role,
};
use keeper::keeper::{KeeperConf, PostgresKeeper};
use keeper::pg::{ConnParams, Parameters, PgInstance};
use keeper::store::mem::MemStore;
use keeper::store::{Store, StoreManager};

/// A PostgreSQL instance fake: keeps the minimal state the reconciler
/// observes and records every operation in order.
#[derive(Default)]
struct PgFake {
    calls: Mutex<Vec<&'static str>>,
    parameters: Mutex<Parameters>,
    initialized: Mutex<bool>,
    started: Mutex<bool>,
    primary_conninfo: Mutex<Option<ConnParams>>,
    slots: Mutex<Vec<String>>,
    state: Mutex<PostgresState>,
    fail_pg_rewind: bool,
}

impl PgFake {
    fn record(&self, op: &'static str) {
        self.calls.lock().unwrap().push(op);
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn set_state(&self, state: PostgresState) {
        *self.state.lock().unwrap() = state;
    }

    fn role(&self) -> Role {
        match *self.primary_conninfo.lock().unwrap() {
            None => Role::Master,
            Some(_) => Role::Standby,
        }
    }
}

#[async_trait::async_trait]
impl PgInstance for PgFake {
    fn set_parameters(&self, parameters: Parameters) {
        *self.parameters.lock().unwrap() = parameters;
    }

    fn get_parameters(&self) -> Parameters {
        self.parameters.lock().unwrap().clone()
    }

    async fn init(&self) -> Result<()> {
        self.record("init");
        *self.initialized.lock().unwrap() = true;
        *self.primary_conninfo.lock().unwrap() = None;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.record("start");
        *self.started.lock().unwrap() = true;
        Ok(())
    }

    async fn stop(&self, _fast: bool) -> Result<()> {
        self.record("stop");
        *self.started.lock().unwrap() = false;
        Ok(())
    }

    async fn restart(&self, _fast: bool) -> Result<()> {
        self.record("restart");
        *self.started.lock().unwrap() = true;
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.record("reload");
        Ok(())
    }

    async fn promote(&self) -> Result<()> {
        self.record("promote");
        *self.primary_conninfo.lock().unwrap() = None;
        Ok(())
    }

    fn is_initialized(&self) -> Result<bool> {
        Ok(*self.initialized.lock().unwrap())
    }

    async fn is_started(&self) -> Result<bool> {
        Ok(*self.started.lock().unwrap())
    }

    async fn is_ready(&self) -> Result<bool> {
        self.record("is_ready");
        Ok(true)
    }

    async fn is_streaming(&self) -> Result<()> {
        self.record("is_streaming");
        Ok(())
    }

    fn get_role(&self) -> Result<Role> {
        Ok(self.role())
    }

    fn get_primary_conninfo(&self) -> Result<Option<ConnParams>> {
        Ok(self.primary_conninfo.lock().unwrap().clone())
    }

    fn write_recovery_conf(&self, primary_conninfo: Option<&ConnParams>) -> Result<()> {
        self.record("write_recovery_conf");
        *self.primary_conninfo.lock().unwrap() = primary_conninfo.cloned();
        Ok(())
    }

    async fn sync_from_followed(&self, conn_params: &ConnParams) -> Result<()> {
        self.record("pg_basebackup");
        *self.initialized.lock().unwrap() = true;
        *self.primary_conninfo.lock().unwrap() = Some(conn_params.clone());
        Ok(())
    }

    async fn sync_from_followed_pg_rewind(
        &self,
        _conn_params: &ConnParams,
        _password: &str,
    ) -> Result<()> {
        self.record("pg_rewind");
        if self.fail_pg_rewind {
            bail!("pg_rewind exited with status 1");
        }
        Ok(())
    }

    async fn get_replication_slots(&self) -> Result<Vec<String>> {
        Ok(self.slots.lock().unwrap().clone())
    }

    async fn create_replication_slot(&self, name: &str) -> Result<()> {
        self.record("create_replication_slot");
        self.slots.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn drop_replication_slot(&self, name: &str) -> Result<()> {
        self.record("drop_replication_slot");
        self.slots.lock().unwrap().retain(|slot| slot != name);
        Ok(())
    }

    async fn remove_all(&self) -> Result<()> {
        if *self.started.lock().unwrap() {
            bail!("cannot remove the data dir of an active instance");
        }
        self.record("remove_all");
        *self.initialized.lock().unwrap() = false;
        *self.primary_conninfo.lock().unwrap() = None;
        Ok(())
    }

    async fn create_replication_lag_function(&self) -> Result<()> {
        self.record("create_replication_lag_function");
        Ok(())
    }

    async fn pg_state(&self) -> Result<PostgresState> {
        let mut state = self.state.lock().unwrap().clone();
        state.initialized = *self.initialized.lock().unwrap();
        state.role = Some(self.role());
        Ok(state)
    }
}

struct Harness {
    keeper: Arc<PostgresKeeper>,
    pg: Arc<PgFake>,
    store: Arc<MemStore>,
    manager: StoreManager,
    _data_dir: camino_tempfile::Utf8TempDir,
}

fn harness(id: &str, pg: PgFake) -> Harness {
    let data_dir = camino_tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::default());
    let manager = StoreManager::new(store.clone(), "test");
    let pg = Arc::new(pg);

    let conf = KeeperConf {
        id: id.to_string(),
        data_dir: data_dir.path().to_owned(),
        listen_address: "127.0.0.1".to_string(),
        // An ephemeral port, so the run() test can bind its HTTP listener.
        port: "0".to_string(),
        pg_listen_address: "127.0.0.1".to_string(),
        pg_port: "5432".to_string(),
        pg_bin_path: Utf8PathBuf::new(),
        pg_conf_dir: None,
        pg_repl_username: "repl".to_string(),
        pg_repl_password: "replpass".to_string(),
        pg_su_username: "admin".to_string(),
        pg_su_password: "supass".to_string(),
        pg_ssl_replication: false,
        pg_ssl_cert_file: String::new(),
        pg_ssl_key_file: String::new(),
        pg_ssl_ca_file: String::new(),
        pg_ssl_ciphers: String::new(),
    };

    let keeper = Arc::new(PostgresKeeper::new(
        conf,
        manager.clone(),
        pg.clone(),
        Config::default(),
        CancellationToken::new(),
    ));

    Harness {
        keeper,
        pg,
        store,
        manager,
        _data_dir: data_dir,
    }
}

async fn seed_cluster_view(harness: &Harness, cv: ClusterView) {
    let data = ClusterData {
        cluster_view: cv,
        keepers_state: BTreeMap::new(),
    };
    harness
        .store
        .set(
            "pgkeeper/cluster/test/clusterdata",
            &serde_json::to_vec(&data).unwrap(),
        )
        .await
        .unwrap();
}

fn view(version: i64, master: &str, roles: &[(&str, &str)], config: NilConfig) -> ClusterView {
    ClusterView {
        version,
        master: master.to_string(),
        keepers_role: roles
            .iter()
            .map(|(id, follow)| {
                (
                    id.to_string(),
                    KeeperRole {
                        follow: follow.to_string(),
                    },
                )
            })
            .collect(),
        config,
    }
}

fn followed_state(id: &str, pg_state: PostgresState) -> KeeperState {
    KeeperState {
        id: id.to_string(),
        listen_address: "127.0.0.1".to_string(),
        port: "5431".to_string(),
        pg_listen_address: "10.0.0.7".to_string(),
        pg_port: "5432".to_string(),
        cluster_view_version: 0,
        healthy: true,
        pg_state: Some(pg_state),
    }
}

fn pg_state(system_id: u64, timeline_id: u32, xlog_pos: u64) -> PostgresState {
    PostgresState {
        initialized: true,
        system_id,
        timeline_id,
        xlog_pos,
        ..Default::default()
    }
}

fn cvversion_file(harness: &Harness) -> String {
    std::fs::read_to_string(harness._data_dir.path().join("cvversion")).unwrap()
}

const MUTATING: &[&str] = &[
    "init",
    "start",
    "stop",
    "restart",
    "reload",
    "promote",
    "write_recovery_conf",
    "pg_basebackup",
    "pg_rewind",
    "create_replication_slot",
    "drop_replication_slot",
    "remove_all",
];

/// Cold start of a single-keeper cluster: the first view carries no role
/// assignments and triggers initdb; the next view assigns us master and is
/// the one whose version gets committed.
#[tokio::test]
async fn cold_start_alone() {
    let h = harness("a", PgFake::default());

    seed_cluster_view(&h, view(1, "a", &[], NilConfig::default())).await;
    h.keeper.reconcile().await;
    assert!(h.pg.calls().contains(&"init"));
    // The init-only tick commits nothing.
    assert!(!h._data_dir.path().join("cvversion").exists());
    assert_eq!(h.keeper.cv_version(), 0);

    seed_cluster_view(&h, view(1, "a", &[("a", "")], NilConfig::default())).await;
    h.keeper.reconcile().await;

    assert_eq!(h.pg.role(), Role::Master);
    assert!(*h.pg.started.lock().unwrap());
    assert_eq!(h.keeper.cv_version(), 1);
    assert_eq!(cvversion_file(&h), "1");

    // The published keeper state carries the acted-on view version.
    h.keeper.publish().await.unwrap();
    let keepers_state = h.manager.get_keepers_state().await.unwrap();
    assert_eq!(keepers_state["a"].cluster_view_version, 1);
    assert!(keepers_state["a"].healthy);
}

/// A standby promoted by a new cluster view: promote is issued and a
/// replication slot for the remaining follower appears.
#[tokio::test]
async fn promotion() {
    let pg = PgFake::default();
    *pg.initialized.lock().unwrap() = true;
    *pg.started.lock().unwrap() = true;
    let mut conninfo = ConnParams::new();
    conninfo.set("host", "10.0.0.8");
    *pg.primary_conninfo.lock().unwrap() = Some(conninfo);

    let h = harness("a", pg);
    seed_cluster_view(
        &h,
        view(5, "a", &[("a", ""), ("b", "a")], NilConfig::default()),
    )
    .await;
    h.keeper.reconcile().await;

    assert!(h.pg.calls().contains(&"promote"));
    assert_eq!(h.pg.role(), Role::Master);
    assert_eq!(*h.pg.slots.lock().unwrap(), vec!["b".to_string()]);
    assert_eq!(cvversion_file(&h), "5");
}

/// A standby whose local timeline matches the upstream: no resync, no
/// restart when the conninfo is unchanged, but readiness and streaming are
/// verified.
#[tokio::test]
async fn follow_with_matching_timeline() {
    let pg = PgFake::default();
    *pg.initialized.lock().unwrap() = true;
    *pg.started.lock().unwrap() = true;
    pg.set_state(pg_state(42, 3, 900));

    let h = harness("b", pg);
    let followed = followed_state("a", pg_state(42, 3, 1000));
    // Point the local conninfo at exactly what the reconciler will compute.
    *h.pg.primary_conninfo.lock().unwrap() = Some(h.keeper.conf().repl_conn_params(&followed));

    seed_cluster_view(
        &h,
        view(2, "a", &[("a", ""), ("b", "a")], NilConfig::default()),
    )
    .await;
    h.manager.set_keeper_state("a", &followed).await.unwrap();
    h.keeper.reconcile().await;

    let calls = h.pg.calls();
    assert!(!calls.contains(&"pg_basebackup"));
    assert!(!calls.contains(&"pg_rewind"));
    assert!(!calls.contains(&"restart"));
    assert!(calls.contains(&"is_ready"));
    assert!(calls.contains(&"is_streaming"));
    assert_eq!(cvversion_file(&h), "2");
}

/// Same scenario, but the upstream connection parameters changed:
/// recovery.conf is rewritten and the instance restarted.
#[tokio::test]
async fn follow_rewrites_conninfo_when_changed() {
    let pg = PgFake::default();
    *pg.initialized.lock().unwrap() = true;
    *pg.started.lock().unwrap() = true;
    pg.set_state(pg_state(42, 3, 900));
    let mut stale = ConnParams::new();
    stale.set("host", "10.9.9.9");
    *pg.primary_conninfo.lock().unwrap() = Some(stale);

    let h = harness("b", pg);
    let followed = followed_state("a", pg_state(42, 3, 1000));

    seed_cluster_view(
        &h,
        view(3, "a", &[("a", ""), ("b", "a")], NilConfig::default()),
    )
    .await;
    h.manager.set_keeper_state("a", &followed).await.unwrap();
    h.keeper.reconcile().await;

    let calls = h.pg.calls();
    assert!(calls.contains(&"write_recovery_conf"));
    assert!(calls.contains(&"restart"));
    assert_eq!(
        h.pg.primary_conninfo.lock().unwrap().as_ref(),
        Some(&h.keeper.conf().repl_conn_params(&followed))
    );
}

/// A different SystemID means another lineage entirely: full resync (wipe +
/// basebackup), then start.
#[tokio::test]
async fn divergent_system_id_forces_resync() {
    let pg = PgFake::default();
    *pg.initialized.lock().unwrap() = true;
    *pg.started.lock().unwrap() = true;
    pg.set_state(pg_state(43, 3, 900));

    let h = harness("b", pg);
    let followed = followed_state("a", pg_state(42, 3, 1000));
    *h.pg.primary_conninfo.lock().unwrap() = Some(h.keeper.conf().repl_conn_params(&followed));

    seed_cluster_view(
        &h,
        view(4, "a", &[("a", ""), ("b", "a")], NilConfig::default()),
    )
    .await;
    h.manager.set_keeper_state("a", &followed).await.unwrap();
    h.keeper.reconcile().await;

    let calls = h.pg.calls();
    let remove = calls.iter().position(|c| *c == "remove_all").unwrap();
    let basebackup = calls.iter().position(|c| *c == "pg_basebackup").unwrap();
    let start = calls.iter().rposition(|c| *c == "start").unwrap();
    assert!(remove < basebackup && basebackup < start);
    assert_eq!(h.pg.role(), Role::Standby);
}

/// pg_rewind is preferred when enabled and usable, but a pg_rewind failure
/// falls back to wiping the data dir and running pg_basebackup.
#[tokio::test]
async fn pg_rewind_failure_falls_back_to_basebackup() {
    let pg = PgFake {
        fail_pg_rewind: true,
        ..Default::default()
    };
    *pg.initialized.lock().unwrap() = true;
    *pg.started.lock().unwrap() = true;
    pg.set_state(pg_state(43, 3, 900));

    let h = harness("b", pg);
    let followed = followed_state("a", pg_state(42, 3, 1000));
    *h.pg.primary_conninfo.lock().unwrap() = Some(h.keeper.conf().repl_conn_params(&followed));

    let config = NilConfig {
        use_pg_rewind: Some(true),
        ..Default::default()
    };
    seed_cluster_view(&h, view(6, "a", &[("a", ""), ("b", "a")], config)).await;
    h.manager.set_keeper_state("a", &followed).await.unwrap();
    h.keeper.reconcile().await;

    let calls = h.pg.calls();
    let rewind = calls.iter().position(|c| *c == "pg_rewind").unwrap();
    let remove = calls.iter().position(|c| *c == "remove_all").unwrap();
    let basebackup = calls.iter().position(|c| *c == "pg_basebackup").unwrap();
    assert!(rewind < remove && remove < basebackup);
}

/// An uninitialized keeper assigned to follow bootstraps with a full
/// basebackup; pg_rewind is never attempted without an initialized data dir,
/// even when enabled.
#[tokio::test]
async fn uninitialized_standby_bootstraps_with_basebackup() {
    let h = harness("b", PgFake::default());
    let followed = followed_state("a", pg_state(42, 3, 1000));

    let config = NilConfig {
        use_pg_rewind: Some(true),
        ..Default::default()
    };
    seed_cluster_view(&h, view(8, "a", &[("a", ""), ("b", "a")], config)).await;
    h.manager.set_keeper_state("a", &followed).await.unwrap();
    h.keeper.reconcile().await;

    let calls = h.pg.calls();
    assert!(!calls.contains(&"pg_rewind"));
    let basebackup = calls.iter().position(|c| *c == "pg_basebackup").unwrap();
    let start = calls.iter().rposition(|c| *c == "start").unwrap();
    assert!(basebackup < start);
    assert!(*h.pg.initialized.lock().unwrap());
    assert_eq!(h.pg.role(), Role::Standby);
}

/// A standby must not expose any replication slot; leftovers from a former
/// master role are dropped.
#[tokio::test]
async fn standby_drops_leftover_replication_slots() {
    let pg = PgFake::default();
    *pg.initialized.lock().unwrap() = true;
    *pg.started.lock().unwrap() = true;
    pg.set_state(pg_state(42, 3, 900));
    pg.slots.lock().unwrap().push("c".to_string());

    let h = harness("b", pg);
    let followed = followed_state("a", pg_state(42, 3, 1000));
    *h.pg.primary_conninfo.lock().unwrap() = Some(h.keeper.conf().repl_conn_params(&followed));

    seed_cluster_view(
        &h,
        view(10, "a", &[("a", ""), ("b", "a")], NilConfig::default()),
    )
    .await;
    h.manager.set_keeper_state("a", &followed).await.unwrap();
    h.keeper.reconcile().await;

    assert!(h.pg.calls().contains(&"drop_replication_slot"));
    assert!(h.pg.slots.lock().unwrap().is_empty());
}

/// A second tick on an unchanged cluster view is a no-op apart from probes.
#[tokio::test]
async fn steady_state_is_idempotent() {
    let pg = PgFake::default();
    *pg.initialized.lock().unwrap() = true;
    *pg.started.lock().unwrap() = true;

    let h = harness("a", pg);
    seed_cluster_view(
        &h,
        view(7, "a", &[("a", ""), ("b", "a")], NilConfig::default()),
    )
    .await;

    h.keeper.reconcile().await;
    // First tick converges: slot creation and a reload for the new
    // parameters are expected.
    assert!(h.pg.calls().contains(&"create_replication_slot"));

    h.pg.reset_calls();
    h.keeper.reconcile().await;
    let calls = h.pg.calls();
    assert!(
        calls.iter().all(|call| !MUTATING.contains(call)),
        "second tick performed mutations: {calls:?}"
    );
}

/// The persisted cluster view version never decreases, even if the store
/// serves a stale view.
#[tokio::test]
async fn cv_version_never_decreases() {
    let pg = PgFake::default();
    *pg.initialized.lock().unwrap() = true;
    *pg.started.lock().unwrap() = true;

    let h = harness("a", pg);

    seed_cluster_view(&h, view(5, "a", &[("a", "")], NilConfig::default())).await;
    h.keeper.reconcile().await;
    assert_eq!(cvversion_file(&h), "5");

    seed_cluster_view(&h, view(3, "a", &[("a", "")], NilConfig::default())).await;
    h.keeper.reconcile().await;
    assert_eq!(cvversion_file(&h), "5");
    assert_eq!(h.keeper.cv_version(), 5);
}

/// A missing upstream entry aborts the tick without committing the view.
#[tokio::test]
async fn missing_followed_state_aborts_tick() {
    let pg = PgFake::default();
    *pg.initialized.lock().unwrap() = true;
    *pg.started.lock().unwrap() = true;
    pg.set_state(pg_state(42, 3, 900));

    let h = harness("b", pg);
    seed_cluster_view(
        &h,
        view(9, "a", &[("a", ""), ("b", "a")], NilConfig::default()),
    )
    .await;
    // No keeper state for "a" published.
    h.keeper.reconcile().await;

    assert_eq!(h.keeper.cv_version(), 0);
    assert!(!h.pg.calls().contains(&"pg_basebackup"));
}

/// Shutdown: cancellation stops the periodic tasks and the keeper stops
/// PostgreSQL on the way out.
#[tokio::test]
async fn run_stops_postgres_on_shutdown() {
    let pg = PgFake::default();
    *pg.initialized.lock().unwrap() = true;
    *pg.started.lock().unwrap() = true;

    let h = harness("a", pg);
    let keeper = h.keeper.clone();
    let cancel = keeper.cancel_token();
    let run = tokio::spawn(async move { keeper.run().await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();
    let res = run.await.unwrap();
    assert!(res.is_ok(), "run failed: {res:?}");

    assert!(h.pg.calls().contains(&"stop"));
    assert!(!*h.pg.started.lock().unwrap());
}
