//! A single pass of the keeper state machine: converge the local PostgreSQL
//! instance to the role the cluster view assigns us. The tick is idempotent;
//! every failure is absorbed here and retried on the next tick.

use anyhow::{anyhow, bail, Context, Result};
use cluster_api::{KeeperState, PostgresState, Role};
use tracing::{debug, error, info};

use crate::keeper::PostgresKeeper;

/// Whether the local instance sits on a WAL branch that has diverged from the
/// followed instance's lineage. A divergent standby must be fully resynced
/// before it can attach; re-attaching it anyway would corrupt replication.
pub fn is_different_timeline_branch(
    f_pg_state: &PostgresState,
    pg_state: &PostgresState,
) -> bool {
    if f_pg_state.system_id != pg_state.system_id {
        info!(
            "followed instance system ID {} different than our system ID {}",
            f_pg_state.system_id, pg_state.system_id
        );
        return true;
    }

    if f_pg_state.timeline_id < pg_state.timeline_id {
        info!(
            "followed instance timeline {} < than our timeline {}",
            f_pg_state.timeline_id, pg_state.timeline_id
        );
        return true;
    }
    if f_pg_state.timeline_id == pg_state.timeline_id {
        return false;
    }

    // The followed instance is on a later timeline: we diverged iff it forked
    // off our timeline before our current position.
    if let Some(tlh) = f_pg_state.timelines_history.get(pg_state.timeline_id) {
        if tlh.switch_point < pg_state.xlog_pos {
            info!(
                "followed instance timeline {} forked at xlog pos {} before our current state (timeline {} at xlog pos {})",
                f_pg_state.timeline_id, tlh.switch_point, pg_state.timeline_id, pg_state.xlog_pos
            );
            return true;
        }
    }
    false
}

fn followed_pg_state(followed: &KeeperState) -> Result<&PostgresState> {
    followed.pg_state.as_ref().ok_or_else(|| {
        anyhow!(
            "no pg state reported yet for followed keeper {:?}",
            followed.id
        )
    })
}

impl PostgresKeeper {
    pub async fn reconcile(&self) {
        if let Err(e) = self.reconcile_inner().await {
            error!("{e:#}");
        }
    }

    async fn reconcile_inner(&self) -> Result<()> {
        let pgm = &self.pgm;

        let (cv, _) = self
            .store
            .get_cluster_view()
            .await
            .context("error retrieving cluster view")?;
        debug!("cluster view: {cv:?}");
        let Some(cv) = cv else {
            info!("no cluster view available, waiting for it to appear");
            return Ok(());
        };

        let followers_ids = cv.followers_of(&self.conf.id);

        let cluster_config = cv.config.to_config();
        debug!("cluster config: {cluster_config:?}");
        *self.cluster_config.write().unwrap() = cluster_config.clone();

        let prev_pg_parameters = pgm.get_parameters();
        let pg_parameters = self.conf.create_pg_parameters(&followers_ids, &cluster_config);
        pgm.set_parameters(pg_parameters.clone());

        let keepers_state = self
            .store
            .get_keepers_state()
            .await
            .context("error retrieving keepers state")?;
        debug!("keepers state: {keepers_state:?}");

        let initialized = pgm
            .is_initialized()
            .context("failed to detect if the instance is initialized")?;

        // A cluster with no assigned roles yet is being bootstrapped: prepare
        // the local database and wait for the sentinel to hand out roles.
        if cv.keepers_role.is_empty() {
            if initialized {
                pgm.create_replication_lag_function()
                    .await
                    .context("failed to create replication lag function")?;
            } else {
                info!("initializing database");
                pgm.init()
                    .await
                    .context("failed to initialize postgres instance")?;
            }
            return Ok(());
        }

        let mut started = false;
        if initialized {
            match pgm.is_started().await {
                Ok(s) => started = s,
                Err(e) => error!("failed to retrieve instance status: {e:#}"),
            }
        }
        debug!("initialized: {initialized}");
        debug!("started: {started}");

        let role = pgm.get_role().context("error retrieving current pg role")?;
        info!("current pg state: {role}");
        let is_master = role == Role::Master;

        let Some(keeper_role) = cv.keepers_role.get(&self.conf.id) else {
            info!("our keeper requested role is not available");
            if initialized && !started {
                pgm.start().await.context("failed to start postgres")?;
            }
            return Ok(());
        };

        debug!("master id: {:?}", cv.master);
        if self.conf.id == cv.master {
            self.reconcile_master(initialized, started, role, &followers_ids)
                .await?;
        } else if !keeper_role.follow.is_empty() {
            let follow = keeper_role.follow.clone();
            let Some(followed) = keepers_state.get(&follow) else {
                bail!("no keeper state data for {follow:?}");
            };
            self.reconcile_standby(followed, &follow, initialized, started, is_master)
                .await?;
        }

        let prev_sync_standby_names = prev_pg_parameters
            .get("synchronous_standby_names")
            .cloned()
            .unwrap_or_default();
        let sync_standby_names = pg_parameters
            .get("synchronous_standby_names")
            .cloned()
            .unwrap_or_default();
        if cluster_config.synchronous_replication {
            if prev_sync_standby_names != sync_standby_names {
                info!(
                    "needed synchronous_standby_names changed from {prev_sync_standby_names:?} to {sync_standby_names:?}"
                );
            }
        } else if !prev_sync_standby_names.is_empty() {
            info!(
                "sync replication disabled, removing current synchronous_standby_names {prev_sync_standby_names:?}"
            );
        }

        if pg_parameters != prev_pg_parameters {
            info!("postgres parameters changed, reloading postgres instance");
            if let Err(e) = pgm.reload().await {
                error!("failed to reload postgres instance: {e:#}");
            }
        } else {
            debug!("postgres parameters not changed");
        }

        self.save_cv_version(cv.version)
            .context("failed to save the cluster view version")?;
        Ok(())
    }

    async fn reconcile_master(
        &self,
        initialized: bool,
        started: bool,
        role: Role,
        followers_ids: &[String],
    ) -> Result<()> {
        let pgm = &self.pgm;
        info!("our cluster requested state is master");
        if !initialized {
            bail!("database is not initialized. This shouldn't happen!");
        }
        if !started {
            pgm.start().await.context("failed to start postgres")?;
        }

        if role != Role::Master {
            info!("promoting to master");
            pgm.promote().await.context("failed to promote to master")?;
        } else {
            info!("already master");
        }

        // Converge the replication slots to exactly our followers.
        let repl_slots = pgm
            .get_replication_slots()
            .await
            .context("failed to list replication slots")?;
        for slot_name in &repl_slots {
            if !followers_ids.contains(slot_name) {
                info!("dropping replication slot for keeper {slot_name:?} not marked as follower");
                if let Err(e) = pgm.drop_replication_slot(slot_name).await {
                    error!("failed to drop replication slot {slot_name:?}: {e:#}");
                }
            }
        }
        for follower_id in followers_ids {
            if follower_id == &self.conf.id {
                continue;
            }
            if !repl_slots.contains(follower_id) {
                if let Err(e) = pgm.create_replication_slot(follower_id).await {
                    error!("failed to create replication slot {follower_id:?}: {e:#}");
                }
            }
        }
        Ok(())
    }

    async fn reconcile_standby(
        &self,
        followed: &KeeperState,
        follow: &str,
        initialized: bool,
        mut started: bool,
        is_master: bool,
    ) -> Result<()> {
        let pgm = &self.pgm;
        info!("our cluster requested state is standby following {follow:?}");

        if is_master {
            if initialized {
                // This database may still be on the same branch as the
                // followed instance, so try a plain demotion first: point
                // recovery.conf at the new upstream, (re)start, and only then
                // check the timeline history to decide whether a destructive
                // resync is needed.
                let repl_conn_params = self.conf.repl_conn_params(followed);
                pgm.write_recovery_conf(Some(&repl_conn_params))
                    .context("failed to write recovery.conf")?;
                if !started {
                    pgm.start().await.context("failed to start postgres")?;
                    started = true;
                } else {
                    pgm.restart(false)
                        .await
                        .context("failed to restart postgres")?;
                }

                // The pre-demotion snapshot is stale by now; probe again.
                let pg_state = self
                    .get_pg_state()
                    .await
                    .context("cannot get current pgstate")?;
                let f_pg_state = followed_pg_state(followed)?;
                if is_different_timeline_branch(f_pg_state, &pg_state) {
                    self.resync(followed, initialized, started)
                        .await
                        .context("failed to full resync from followed instance")?;
                    pgm.start().await.context("failed to start postgres")?;
                    started = true;
                }

                self.resync_if_not_ready(followed, initialized, started)
                    .await?;
            } else {
                self.resync(followed, initialized, started)
                    .await
                    .context("failed to full resync from followed instance")?;
                pgm.start().await.context("failed to start postgres")?;
            }
        } else {
            info!("already standby");
            if !initialized {
                bail!("database is not initialized. This shouldn't happen!");
            }
            if !started {
                pgm.start().await.context("failed to start postgres")?;
                started = true;
            }

            // Update primary_conninfo if the replication connection changed.
            let cur_conn_params = pgm
                .get_primary_conninfo()
                .context("failed to read primary conninfo")?;
            debug!("current conninfo: {cur_conn_params:?}");
            let new_conn_params = self.conf.repl_conn_params(followed);
            debug!("new conninfo: {new_conn_params:?}");

            if cur_conn_params.as_ref() != Some(&new_conn_params) {
                info!("followed instance connection parameters changed. Reconfiguring...");
                info!("following {follow:?}");
                pgm.write_recovery_conf(Some(&new_conn_params))
                    .context("failed to write recovery.conf")?;
                pgm.restart(false)
                    .await
                    .context("failed to restart postgres")?;
            }

            // A standby must not expose any replication slot.
            let repl_slots = pgm
                .get_replication_slots()
                .await
                .context("failed to list replication slots")?;
            for slot_name in &repl_slots {
                info!("dropping replication slot of standby keeper {slot_name:?}");
                if let Err(e) = pgm.drop_replication_slot(slot_name).await {
                    error!("failed to drop replication slot {slot_name:?}: {e:#}");
                }
            }

            let pg_state = self
                .get_pg_state()
                .await
                .context("cannot get current pgstate")?;
            let f_pg_state = followed_pg_state(followed)?;
            if is_different_timeline_branch(f_pg_state, &pg_state) {
                self.resync(followed, initialized, started)
                    .await
                    .context("failed to full resync from followed instance")?;
                pgm.start().await.context("failed to start postgres")?;
                started = true;
            }

            self.resync_if_not_ready(followed, initialized, started)
                .await?;
        }
        Ok(())
    }

    /// Rebuild the local instance from the followed one. Prefers pg_rewind
    /// when enabled and usable; any pg_rewind failure falls back to wiping
    /// the data dir and taking a full pg_basebackup.
    pub(crate) async fn resync(
        &self,
        followed: &KeeperState,
        initialized: bool,
        started: bool,
    ) -> Result<()> {
        let pgm = &self.pgm;
        if initialized && started {
            pgm.stop(false)
                .await
                .context("failed to stop pg instance")?;
        }

        let repl_conn_params = self.conf.repl_conn_params(followed);
        let config = self.cluster_config.read().unwrap().clone();
        if initialized && self.use_pg_rewind(&config) {
            let su_conn_params = self.conf.su_conn_params(followed);
            info!(
                "syncing using pg_rewind from followed instance {:?}",
                followed.id
            );
            match pgm
                .sync_from_followed_pg_rewind(&su_conn_params, &self.conf.pg_su_password)
                .await
            {
                Ok(()) => {
                    pgm.write_recovery_conf(Some(&repl_conn_params))
                        .context("failed to write recovery.conf")?;
                    return Ok(());
                }
                Err(e) => error!("error syncing with pg_rewind: {e:#}"),
            }
        }

        pgm.remove_all()
            .await
            .context("failed to remove the postgres data dir")?;
        info!("syncing from followed instance {:?}", followed.id);
        pgm.sync_from_followed(&repl_conn_params)
            .await
            .context("error syncing from followed instance")?;
        info!(
            "sync from followed instance {:?} successfully finished",
            followed.id
        );
        pgm.write_recovery_conf(Some(&repl_conn_params))
            .context("failed to write recovery.conf")?;
        Ok(())
    }

    /// A standby that came up but never became ready, or is not streaming,
    /// is typically missing WAL segments it can never get back; only a full
    /// resync recovers it.
    async fn resync_if_not_ready(
        &self,
        followed: &KeeperState,
        initialized: bool,
        started: bool,
    ) -> Result<()> {
        let ready = self
            .pgm
            .is_ready()
            .await
            .context("failed to check postgres readiness")?;
        if !ready || self.pgm.is_streaming().await.is_err() {
            info!("standby is not accepting connections or not streaming. Forcing a full resync.");
            self.resync_and_start(followed, initialized, started)
                .await?;
        }
        Ok(())
    }

    async fn resync_and_start(
        &self,
        followed: &KeeperState,
        initialized: bool,
        started: bool,
    ) -> Result<()> {
        self.resync(followed, initialized, started)
            .await
            .context("failed to full resync from followed instance")?;
        self.pgm
            .start()
            .await
            .context("error starting PostgreSQL instance")?;
        Ok(())
    }
}
