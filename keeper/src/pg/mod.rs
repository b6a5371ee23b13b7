//! Management of the local PostgreSQL instance: wrapping `initdb`, `pg_ctl`,
//! `pg_basebackup` and `pg_rewind`, writing the configuration files, and
//! running SQL probes on behalf of the reconciler.

use std::io::Write;
use std::process::Output;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cluster_api::{PostgresState, Role, TimelineHistory, TimelinesHistory};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use utils::crashsafe;
use utils::lsn::Lsn;

pub mod params;
pub mod queries;

pub use params::{ConnParams, Parameters};

const START_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const SLEEP_BETWEEN_CHECKS: Duration = Duration::from_millis(200);

/// Baseline postgresql.conf settings every keeper-managed instance gets.
pub const DEFAULT_PG_PARAMETERS: &[(&str, &str)] = &[
    ("unix_socket_directories", "/tmp"),
    ("wal_level", "hot_standby"),
    ("wal_keep_segments", "128"),
    ("hot_standby", "on"),
    ("max_connections", "500"),
];

/// Everything the reconciler needs from the local instance. [`Manager`] is
/// the real implementation; tests drive the state machine through a scripted
/// fake.
#[async_trait::async_trait]
pub trait PgInstance: Send + Sync {
    fn set_parameters(&self, parameters: Parameters);
    fn get_parameters(&self) -> Parameters;

    async fn init(&self) -> Result<()>;
    async fn start(&self) -> Result<()>;
    async fn stop(&self, fast: bool) -> Result<()>;
    async fn restart(&self, fast: bool) -> Result<()>;
    async fn reload(&self) -> Result<()>;
    async fn promote(&self) -> Result<()>;

    fn is_initialized(&self) -> Result<bool>;
    async fn is_started(&self) -> Result<bool>;
    /// Polls until the instance accepts connections; `Ok(false)` on timeout.
    async fn is_ready(&self) -> Result<bool>;
    /// Ok iff WAL is being streamed from the upstream.
    async fn is_streaming(&self) -> Result<()>;

    fn get_role(&self) -> Result<Role>;
    fn get_primary_conninfo(&self) -> Result<Option<ConnParams>>;
    fn write_recovery_conf(&self, primary_conninfo: Option<&ConnParams>) -> Result<()>;

    async fn sync_from_followed(&self, conn_params: &ConnParams) -> Result<()>;
    async fn sync_from_followed_pg_rewind(
        &self,
        conn_params: &ConnParams,
        password: &str,
    ) -> Result<()>;

    async fn get_replication_slots(&self) -> Result<Vec<String>>;
    async fn create_replication_slot(&self, name: &str) -> Result<()>;
    async fn drop_replication_slot(&self, name: &str) -> Result<()>;

    async fn remove_all(&self) -> Result<()>;
    async fn create_replication_lag_function(&self) -> Result<()>;

    async fn pg_state(&self) -> Result<PostgresState>;
}

pub struct PgConfig {
    /// Keeper id; doubles as replication slot name and application_name.
    pub name: String,
    /// Directory holding the postgres binaries; empty means `$PATH`.
    pub pg_bin_path: Utf8PathBuf,
    /// The keeper data directory; the instance lives in `postgres/` below it.
    pub data_dir: Utf8PathBuf,
    /// User-provided configuration directory included from postgresql.conf.
    pub conf_dir: Option<Utf8PathBuf>,
    pub parameters: Parameters,
    pub su_username: String,
    pub su_password: String,
    pub repl_username: String,
    pub repl_password: String,
    /// Conninfo for local administrative SQL.
    pub local_conn_params: ConnParams,
    pub request_timeout: Duration,
}

pub struct Manager {
    name: String,
    pg_bin_path: Utf8PathBuf,
    data_dir: Utf8PathBuf,
    conf_dir: Option<Utf8PathBuf>,
    parameters: std::sync::Mutex<Parameters>,
    su_username: String,
    su_password: String,
    repl_username: String,
    repl_password: String,
    local_conn_string: String,
    request_timeout: Duration,
    cancel: CancellationToken,
}

impl Manager {
    pub fn new(config: PgConfig, cancel: CancellationToken) -> Manager {
        Manager {
            name: config.name,
            pg_bin_path: config.pg_bin_path,
            data_dir: config.data_dir.join("postgres"),
            conf_dir: config.conf_dir,
            parameters: std::sync::Mutex::new(config.parameters),
            su_username: config.su_username,
            su_password: config.su_password,
            repl_username: config.repl_username,
            repl_password: config.repl_password,
            local_conn_string: config.local_conn_params.conn_string(),
            request_timeout: config.request_timeout,
            cancel,
        }
    }

    pub fn data_dir(&self) -> &Utf8Path {
        &self.data_dir
    }

    fn pg_bin(&self, name: &str) -> Utf8PathBuf {
        if self.pg_bin_path.as_str().is_empty() {
            Utf8PathBuf::from(name)
        } else {
            self.pg_bin_path.join(name)
        }
    }

    /// Run a postgres binary to completion, killing it if the keeper shuts
    /// down first. Non-zero exit is an error carrying the combined output.
    async fn run_command(&self, mut cmd: Command, bin: &str) -> Result<Output> {
        cmd.kill_on_drop(true);
        debug!("executing command: {cmd:?}");
        let output = tokio::select! {
            output = cmd.output() => output.with_context(|| format!("failed to execute {bin}"))?,
            _ = self.cancel.cancelled() => bail!("{bin} canceled by shutdown"),
        };
        if !output.status.success() {
            bail!(
                "{bin} failed with {}: {}{}",
                output.status,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr),
            );
        }
        Ok(output)
    }

    fn log_pg_ctl_output(output: &Output) {
        for line in String::from_utf8_lossy(&output.stdout)
            .lines()
            .chain(String::from_utf8_lossy(&output.stderr).lines())
        {
            if !line.trim().is_empty() {
                info!("pg_ctl: {line}");
            }
        }
    }

    /// Write `postgresql.conf` as an include chain: the initdb-generated base
    /// file, the user (or default) conf dir, then our computed parameters.
    fn write_conf(&self) -> Result<()> {
        let mut contents = String::new();
        contents.push_str("include 'postgresql-base.conf'\n");
        match &self.conf_dir {
            Some(dir) => contents.push_str(&format!("include_dir '{dir}'\n")),
            None => contents.push_str("include_dir 'conf.d'\n"),
        }
        for (key, value) in self.parameters.lock().unwrap().iter() {
            // Single quotes need to be doubled inside GUC values.
            let escaped = value.replace('\'', "''");
            contents.push_str(&format!("{key} = '{escaped}'\n"));
        }
        crashsafe::overwrite(
            &self.data_dir.join("postgresql.conf"),
            contents.as_bytes(),
            0o600,
        )
        .context("error writing postgresql.conf")
    }

    fn write_pg_hba(&self) -> Result<()> {
        let contents = format!(
            "local all all  trust\n\
             host all all 127.0.0.1/32 trust\n\
             host all all ::1/128 trust\n\
             hostssl all all 0.0.0.0/0 md5\n\
             hostssl all all ::0/0 md5\n\
             hostssl replication {0} 0.0.0.0/0 md5\n\
             hostssl replication {0} ::0/0 md5\n",
            self.repl_username,
        );
        crashsafe::overwrite(
            &self.data_dir.join("pg_hba.conf"),
            contents.as_bytes(),
            0o600,
        )
        .context("error writing pg_hba.conf")
    }

    async fn setup_roles(&self) -> Result<()> {
        if self.su_username == self.repl_username {
            info!("adding replication role to superuser");
            queries::alter_role_replication(
                &self.local_conn_string,
                &self.su_username,
                &self.su_password,
                self.request_timeout,
            )
            .await
            .context("error adding replication role to superuser")?;
        } else {
            if !self.su_password.is_empty() {
                info!("setting superuser password");
                queries::set_password(
                    &self.local_conn_string,
                    &self.su_username,
                    &self.su_password,
                    self.request_timeout,
                )
                .await
                .context("error setting superuser password")?;
            }
            info!("creating replication role");
            queries::create_role(
                &self.local_conn_string,
                &self.repl_username,
                &self.repl_password,
                self.request_timeout,
            )
            .await
            .context("error creating replication role")?;
        }
        Ok(())
    }

    async fn init_inner(&self) -> Result<()> {
        let initdb = self.pg_bin("initdb");
        let mut cmd = Command::new(initdb.as_str());
        cmd.args(["-D", self.data_dir.as_str(), "-U", &self.su_username]);
        self.run_command(cmd, "initdb").await?;

        // Keep the initdb-generated config around as the base of the include
        // chain.
        std::fs::rename(
            self.data_dir.join("postgresql.conf"),
            self.data_dir.join("postgresql-base.conf"),
        )
        .context("error moving postgresql.conf to postgresql-base.conf")?;

        std::fs::create_dir(self.data_dir.join("conf.d"))
            .context("error creating conf.d inside the data dir")?;

        self.write_conf()?;

        info!("setting required accesses to pg_hba.conf");
        self.write_pg_hba()?;

        self.start().await.context("error starting instance")?;
        info!("setting up roles");
        self.setup_roles().await?;
        info!("creating function for computing replication lag");
        self.create_replication_lag_function()
            .await
            .context("error creating replication lag function")?;
        self.stop(false).await.context("error stopping instance")?;

        Ok(())
    }

    fn recovery_conf_path(&self) -> Utf8PathBuf {
        self.data_dir.join("recovery.conf")
    }

    fn read_timelines_history(&self, timeline_id: u32) -> Result<TimelinesHistory> {
        let path = self
            .data_dir
            .join("pg_wal")
            .join(format!("{timeline_id:08X}.history"));
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("error reading timeline history file {path:?}"))?;
        parse_timeline_history(&contents)
    }

    /// Write the upstream password to a 0600 temp file for PGPASSFILE, so it
    /// never shows up on a command line.
    fn write_pgpass(conn_params: &ConnParams, password: &str) -> Result<tempfile::NamedTempFile> {
        let mut pgpass = tempfile::NamedTempFile::new().context("error creating pgpass file")?;
        writeln!(
            pgpass,
            "{}:{}:*:{}:{}",
            conn_params.get("host").unwrap_or(""),
            conn_params.get("port").unwrap_or(""),
            conn_params.get("user").unwrap_or(""),
            password,
        )?;
        pgpass.flush()?;
        Ok(pgpass)
    }
}

#[async_trait::async_trait]
impl PgInstance for Manager {
    fn set_parameters(&self, parameters: Parameters) {
        *self.parameters.lock().unwrap() = parameters;
    }

    fn get_parameters(&self) -> Parameters {
        self.parameters.lock().unwrap().clone()
    }

    async fn init(&self) -> Result<()> {
        let res = self.init_inner().await;
        if res.is_err() {
            // Don't leave a half-initialized database behind.
            let _ = std::fs::remove_dir_all(&self.data_dir);
        }
        res
    }

    async fn start(&self) -> Result<()> {
        info!("starting database");
        self.write_conf()?;
        let start_timeout_secs = START_TIMEOUT.as_secs().to_string();
        let mut cmd = Command::new(self.pg_bin("pg_ctl").as_str());
        cmd.args([
            "start",
            "-w",
            "-t",
            start_timeout_secs.as_str(),
            "-D",
            self.data_dir.as_str(),
        ]);
        let output = self.run_command(cmd, "pg_ctl start").await?;
        Self::log_pg_ctl_output(&output);
        Ok(())
    }

    async fn stop(&self, fast: bool) -> Result<()> {
        info!("stopping database");
        let mut cmd = Command::new(self.pg_bin("pg_ctl").as_str());
        cmd.args([
            "stop",
            "-w",
            "-D",
            self.data_dir.as_str(),
            "-o",
            "-c unix_socket_directories=/tmp",
        ]);
        if fast {
            cmd.args(["-m", "fast"]);
        }
        self.run_command(cmd, "pg_ctl stop").await?;
        Ok(())
    }

    async fn restart(&self, fast: bool) -> Result<()> {
        info!("restarting database");
        self.stop(fast).await?;
        self.start().await?;
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        info!("reloading database configuration");
        self.write_conf()?;
        let mut cmd = Command::new(self.pg_bin("pg_ctl").as_str());
        cmd.args([
            "reload",
            "-D",
            self.data_dir.as_str(),
            "-o",
            "-c unix_socket_directories=/tmp",
        ]);
        self.run_command(cmd, "pg_ctl reload").await?;
        Ok(())
    }

    async fn promote(&self) -> Result<()> {
        info!("promoting database");
        let mut cmd = Command::new(self.pg_bin("pg_ctl").as_str());
        cmd.args(["promote", "-w", "-D", self.data_dir.as_str()]);
        self.run_command(cmd, "pg_ctl promote").await?;
        Ok(())
    }

    fn is_initialized(&self) -> Result<bool> {
        match std::fs::read_dir(&self.data_dir) {
            Ok(mut entries) => Ok(entries.next().is_some()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).context("failed to inspect the data dir"),
        }
    }

    async fn is_started(&self) -> Result<bool> {
        let mut cmd = Command::new(self.pg_bin("pg_ctl").as_str());
        cmd.args([
            "status",
            "-w",
            "-D",
            self.data_dir.as_str(),
            "-o",
            "-c unix_socket_directories=/tmp",
        ]);
        cmd.kill_on_drop(true);
        let output = tokio::select! {
            output = cmd.output() => output.context("failed to execute pg_ctl status")?,
            _ = self.cancel.cancelled() => bail!("pg_ctl status canceled by shutdown"),
        };
        if output.status.success() {
            return Ok(true);
        }
        // pg_ctl exits with 3 when the server is not running; anything else
        // means we couldn't determine the state.
        match output.status.code() {
            Some(3) => Ok(false),
            _ => bail!(
                "cannot get instance state: pg_ctl status exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr),
            ),
        }
    }

    async fn is_ready(&self) -> Result<bool> {
        let start = Instant::now();
        while start.elapsed() < START_TIMEOUT {
            if queries::ping(&self.local_conn_string, self.request_timeout)
                .await
                .is_ok()
            {
                return Ok(true);
            }
            tokio::select! {
                _ = tokio::time::sleep(SLEEP_BETWEEN_CHECKS) => {}
                _ = self.cancel.cancelled() => bail!("readiness check canceled by shutdown"),
            }
        }
        Ok(false)
    }

    async fn is_streaming(&self) -> Result<()> {
        queries::check_streaming(&self.local_conn_string, self.request_timeout).await
    }

    fn get_role(&self) -> Result<Role> {
        match self.get_primary_conninfo()? {
            None => Ok(Role::Master),
            Some(_) => Ok(Role::Standby),
        }
    }

    fn get_primary_conninfo(&self) -> Result<Option<ConnParams>> {
        static PRIMARY_CONNINFO_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^\s*primary_conninfo\s*=\s*'(.*)'\s*$").unwrap());

        let contents = match std::fs::read_to_string(self.recovery_conf_path()) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("error reading recovery.conf"),
        };
        for line in contents.lines() {
            if let Some(caps) = PRIMARY_CONNINFO_RE.captures(line) {
                return Ok(Some(ConnParams::parse(&caps[1])?));
            }
        }
        Ok(None)
    }

    fn write_recovery_conf(&self, primary_conninfo: Option<&ConnParams>) -> Result<()> {
        let mut contents = String::new();
        contents.push_str("standby_mode = 'on'\n");
        contents.push_str(&format!("primary_slot_name = '{}'\n", self.name));
        contents.push_str("recovery_target_timeline = 'latest'\n");
        if let Some(conn_params) = primary_conninfo {
            contents.push_str(&format!(
                "primary_conninfo = '{}'\n",
                conn_params.conn_string()
            ));
        }
        crashsafe::overwrite(&self.recovery_conf_path(), contents.as_bytes(), 0o600)
            .context("error writing recovery.conf")
    }

    async fn sync_from_followed(&self, conn_params: &ConnParams) -> Result<()> {
        let password = conn_params.get("password").unwrap_or("");
        let pgpass = Self::write_pgpass(conn_params, password)?;

        info!("running pg_basebackup");
        let mut cmd = Command::new(self.pg_bin("pg_basebackup").as_str());
        cmd.args(["-R", "-D", self.data_dir.as_str()])
            .arg(format!("--host={}", conn_params.get("host").unwrap_or("")))
            .arg(format!("--port={}", conn_params.get("port").unwrap_or("")))
            .args(["-U", conn_params.get("user").unwrap_or("")])
            .env("PGPASSFILE", pgpass.path());
        self.run_command(cmd, "pg_basebackup").await?;
        Ok(())
    }

    async fn sync_from_followed_pg_rewind(
        &self,
        conn_params: &ConnParams,
        password: &str,
    ) -> Result<()> {
        let pgpass = Self::write_pgpass(conn_params, password)?;

        // pg_rewind creates a temporary table on the source; with synchronous
        // replication enabled and no active standbys attached that write
        // would hang forever.
        let mut conn_params = conn_params.clone();
        conn_params.set("options", "-c synchronous_commit=off");

        info!("running pg_rewind");
        let mut cmd = Command::new(self.pg_bin("pg_rewind").as_str());
        cmd.args(["--debug", "-D", self.data_dir.as_str()])
            .arg(format!("--source-server={}", conn_params.conn_string()))
            .env("PGPASSFILE", pgpass.path());
        self.run_command(cmd, "pg_rewind").await?;
        Ok(())
    }

    async fn get_replication_slots(&self) -> Result<Vec<String>> {
        queries::get_replication_slots(&self.local_conn_string, self.request_timeout).await
    }

    async fn create_replication_slot(&self, name: &str) -> Result<()> {
        queries::create_replication_slot(&self.local_conn_string, name, self.request_timeout).await
    }

    async fn drop_replication_slot(&self, name: &str) -> Result<()> {
        queries::drop_replication_slot(&self.local_conn_string, name, self.request_timeout).await
    }

    async fn remove_all(&self) -> Result<()> {
        let initialized = self.is_initialized()?;
        let started = if initialized {
            self.is_started()
                .await
                .context("failed to retrieve instance state")?
        } else {
            false
        };
        if started {
            bail!("cannot remove the data dir of an active instance");
        }
        if initialized {
            std::fs::remove_dir_all(&self.data_dir)
                .context("failed to remove the postgres data dir")?;
        }
        Ok(())
    }

    async fn create_replication_lag_function(&self) -> Result<()> {
        queries::create_replication_lag_function(&self.local_conn_string, self.request_timeout)
            .await
    }

    async fn pg_state(&self) -> Result<PostgresState> {
        let mut state = PostgresState::default();
        if !self.is_initialized()? {
            return Ok(state);
        }

        let (system_id, timeline_id, xlog_pos) =
            queries::get_system_identity(&self.local_conn_string, self.request_timeout)
                .await
                .context("error getting system identity")?;
        let in_recovery = queries::is_in_recovery(&self.local_conn_string, self.request_timeout)
            .await
            .context("error getting recovery state")?;
        let replication_lag =
            queries::get_replication_lag(&self.local_conn_string, self.request_timeout)
                .await
                .context("error getting replication lag")?;

        state.initialized = true;
        state.system_id = system_id;
        state.timeline_id = timeline_id;
        state.xlog_pos = xlog_pos;
        state.role = Some(if in_recovery {
            Role::Standby
        } else {
            Role::Master
        });
        state.replication_lag = replication_lag;
        // A timeline <= 1 has no history file.
        if timeline_id > 1 {
            state.timelines_history = self
                .read_timelines_history(timeline_id)
                .context("error getting timeline history")?;
        }
        Ok(state)
    }
}

/// Parse a PostgreSQL timeline `.history` file: one `<parentTLI> <switchpoint>
/// <reason>` line per timeline switch, with `#` comments.
pub fn parse_timeline_history(contents: &str) -> Result<TimelinesHistory> {
    let mut history = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let timeline_id = fields
            .next()
            .ok_or_else(|| anyhow!("missing timeline id in history line {line:?}"))?
            .parse::<u32>()
            .with_context(|| format!("bad timeline id in history line {line:?}"))?;
        let switch_point = fields
            .next()
            .ok_or_else(|| anyhow!("missing switch point in history line {line:?}"))?
            .parse::<Lsn>()
            .map_err(|_| anyhow!("bad switch point in history line {line:?}"))?;
        history.push(TimelineHistory {
            timeline_id,
            switch_point: switch_point.0,
        });
    }
    Ok(TimelinesHistory(history))
}
