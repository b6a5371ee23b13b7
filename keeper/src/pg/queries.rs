//! SQL probes and administrative statements issued against the local
//! instance. Every function opens its own short-lived connection and runs
//! under an explicit per-call deadline, so a stuck server cannot wedge a
//! reconciliation tick.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio_postgres::{Client, NoTls};
use tracing::debug;

use utils::lsn::Lsn;

async fn connect(conninfo: &str) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(conninfo, NoTls)
        .await
        .context("error connecting to postgres")?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("postgres connection error: {e}");
        }
    });
    Ok(client)
}

async fn with_timeout<F, T>(timeout: Duration, what: &str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| anyhow!("{what} timed out after {timeout:?}"))?
}

/// Availability check, the bare `SELECT 1`.
pub async fn ping(conninfo: &str, timeout: Duration) -> Result<()> {
    with_timeout(timeout, "ping", async {
        let client = connect(conninfo).await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    })
    .await
}

/// Ok iff the WAL receiver reports an active streaming connection.
pub async fn check_streaming(conninfo: &str, timeout: Duration) -> Result<()> {
    with_timeout(timeout, "streaming check", async {
        let client = connect(conninfo).await?;
        let row = client
            .query_opt("SELECT status FROM pg_stat_wal_receiver", &[])
            .await?;
        match row {
            None => bail!("no WAL receiver is running"),
            Some(row) => {
                let status: String = row.get(0);
                if status != "streaming" {
                    bail!("WAL receiver status is {status:?}, not streaming");
                }
                Ok(())
            }
        }
    })
    .await
}

pub async fn get_replication_slots(conninfo: &str, timeout: Duration) -> Result<Vec<String>> {
    with_timeout(timeout, "replication slots query", async {
        let client = connect(conninfo).await?;
        let rows = client
            .query("SELECT slot_name FROM pg_replication_slots", &[])
            .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    })
    .await
}

pub async fn create_replication_slot(conninfo: &str, name: &str, timeout: Duration) -> Result<()> {
    with_timeout(timeout, "replication slot creation", async {
        let client = connect(conninfo).await?;
        client
            .execute("SELECT pg_create_physical_replication_slot($1)", &[&name])
            .await?;
        Ok(())
    })
    .await
}

pub async fn drop_replication_slot(conninfo: &str, name: &str, timeout: Duration) -> Result<()> {
    with_timeout(timeout, "replication slot drop", async {
        let client = connect(conninfo).await?;
        client
            .execute("SELECT pg_drop_replication_slot($1)", &[&name])
            .await?;
        Ok(())
    })
    .await
}

/// Mimics Postgres quote_ident(): always quotes and doubles embedded quotes.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub async fn create_role(
    conninfo: &str,
    username: &str,
    password: &str,
    timeout: Duration,
) -> Result<()> {
    with_timeout(timeout, "role creation", async {
        let client = connect(conninfo).await?;
        let stmt = format!(
            "CREATE ROLE {} WITH LOGIN REPLICATION ENCRYPTED PASSWORD {}",
            quote_ident(username),
            quote_literal(password),
        );
        client.simple_query(&stmt).await?;
        Ok(())
    })
    .await
}

/// Grant the replication privilege (and set the password, when given) on an
/// existing role. Used when superuser and replication user coincide.
pub async fn alter_role_replication(
    conninfo: &str,
    username: &str,
    password: &str,
    timeout: Duration,
) -> Result<()> {
    with_timeout(timeout, "role alteration", async {
        let client = connect(conninfo).await?;
        let mut stmt = format!("ALTER ROLE {} WITH REPLICATION", quote_ident(username));
        if !password.is_empty() {
            stmt.push_str(&format!(" ENCRYPTED PASSWORD {}", quote_literal(password)));
        }
        client.simple_query(&stmt).await?;
        Ok(())
    })
    .await
}

pub async fn set_password(
    conninfo: &str,
    username: &str,
    password: &str,
    timeout: Duration,
) -> Result<()> {
    with_timeout(timeout, "password change", async {
        let client = connect(conninfo).await?;
        let stmt = format!(
            "ALTER ROLE {} WITH ENCRYPTED PASSWORD {}",
            quote_ident(username),
            quote_literal(password),
        );
        client.simple_query(&stmt).await?;
        Ok(())
    })
    .await
}

/// Install the helper function keepers use to report replay lag in seconds.
pub async fn create_replication_lag_function(conninfo: &str, timeout: Duration) -> Result<()> {
    with_timeout(timeout, "replication lag function creation", async {
        let client = connect(conninfo).await?;
        client
            .simple_query(
                "CREATE OR REPLACE FUNCTION replication_lag() RETURNS integer AS $$ \
                 SELECT CASE WHEN pg_is_in_recovery() \
                 THEN COALESCE(EXTRACT(EPOCH FROM (now() - pg_last_xact_replay_timestamp()))::integer, 0) \
                 ELSE 0 END $$ LANGUAGE SQL",
            )
            .await?;
        Ok(())
    })
    .await
}

pub async fn get_replication_lag(conninfo: &str, timeout: Duration) -> Result<i64> {
    with_timeout(timeout, "replication lag query", async {
        let client = connect(conninfo).await?;
        let row = client.query_one("SELECT replication_lag()", &[]).await?;
        let lag: i32 = row.get(0);
        Ok(lag as i64)
    })
    .await
}

pub async fn is_in_recovery(conninfo: &str, timeout: Duration) -> Result<bool> {
    with_timeout(timeout, "recovery state query", async {
        let client = connect(conninfo).await?;
        let row = client.query_one("SELECT pg_is_in_recovery()", &[]).await?;
        Ok(row.get(0))
    })
    .await
}

/// The instance's lineage identity: system identifier, current timeline and
/// WAL position (receive position while in recovery).
pub async fn get_system_identity(
    conninfo: &str,
    timeout: Duration,
) -> Result<(u64, u32, u64)> {
    with_timeout(timeout, "system identity query", async {
        let client = connect(conninfo).await?;
        let row = client
            .query_one(
                "SELECT s.system_identifier::text, c.timeline_id::text, \
                 (CASE WHEN pg_is_in_recovery() \
                  THEN COALESCE(pg_last_wal_receive_lsn(), pg_last_wal_replay_lsn(), '0/0'::pg_lsn) \
                  ELSE pg_current_wal_lsn() END)::text \
                 FROM pg_control_system() s, pg_control_checkpoint() c",
                &[],
            )
            .await?;
        let system_id: String = row.get(0);
        let timeline_id: String = row.get(1);
        let xlog_pos: String = row.get(2);

        let system_id = system_id
            .parse::<u64>()
            .with_context(|| format!("bad system identifier {system_id:?}"))?;
        let timeline_id = timeline_id
            .parse::<u32>()
            .with_context(|| format!("bad timeline id {timeline_id:?}"))?;
        let xlog_pos = xlog_pos
            .parse::<Lsn>()
            .map_err(|_| anyhow!("bad WAL position {xlog_pos:?}"))?;
        Ok((system_id, timeline_id, xlog_pos.0))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting() {
        assert_eq!(quote_ident("repl"), "\"repl\"");
        assert_eq!(quote_ident("re\"pl"), "\"re\"\"pl\"");
        assert_eq!(quote_literal("pa'ss"), "'pa''ss'");
    }
}
