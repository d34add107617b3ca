use std::{env, path::PathBuf, time::Duration};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::warn;
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// A user tablespace on the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tablespace {
    pub oid: u32,
    pub location: PathBuf,
}

/// Result of `pg_backup_stop`: the consistency LSN plus the label and
/// tablespace-map blobs that bind the file copy to it.
#[derive(Debug)]
pub struct BackupStop {
    pub stop_lsn: String,
    pub label: Vec<u8>,
    pub tablespace_map: Vec<u8>,
}

/// Thin control client over a single connection. All queries are issued
/// from the orchestrator task, one at a time.
pub struct Control {
    client: tokio_postgres::Client,
    connection: tokio::task::JoinHandle<()>,
}

impl Control {
    /// Connects to the primary. `PGPASSWORD` is honoured and never logged.
    pub async fn connect(
        cancel: &CancellationToken,
        host: &str,
        port: u16,
        user: &str,
    ) -> Result<Control> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(host)
            .port(port)
            .user(user)
            .dbname("postgres")
            .application_name("pgclone-control");
        if let Ok(password) = env::var("PGPASSWORD") {
            if !password.is_empty() {
                config.password(password);
            }
        }

        let (client, connection) = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            result = config.connect(NoTls) => result?,
        };
        let connection = tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!("postgres connection closed: {err}");
            }
        });
        Ok(Control { client, connection })
    }

    pub async fn close(self) {
        drop(self.client);
        let _ = self.connection.await;
    }

    /// The low-level backup API used here exists in this shape from
    /// PostgreSQL 15 on.
    pub async fn ensure_version_15_plus(&self) -> Result<()> {
        let row = self.client.query_one("SHOW server_version_num", &[]).await?;
        let reported: String = row.get(0);
        match reported.parse::<i64>() {
            Ok(num) if num >= 150_000 => Ok(()),
            _ => Err(Error::UnsupportedServerVersion(reported)),
        }
    }

    pub async fn list_tablespaces(&self) -> Result<Vec<Tablespace>> {
        const QUERY: &str = "SELECT oid, pg_tablespace_location(oid) \
                             FROM pg_tablespace \
                             WHERE spcname NOT IN ('pg_default','pg_global')";
        let rows = self.client.query(QUERY, &[]).await?;
        Ok(rows
            .into_iter()
            .map(|row| Tablespace {
                oid: row.get(0),
                location: PathBuf::from(row.get::<_, String>(1)),
            })
            .collect())
    }

    pub async fn backup_start(
        &self,
        cancel: &CancellationToken,
        label: &str,
        fast: bool,
    ) -> Result<String> {
        let params: [&(dyn tokio_postgres::types::ToSql + Sync); 2] = [&label, &fast];
        let query = self
            .client
            .query_one("SELECT pg_backup_start($1, $2)::text", &params);
        let row = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            result = query => result?,
        };
        Ok(row.get(0))
    }

    /// Label and map travel base64-encoded to survive the text protocol
    /// unmangled; they are decoded locally.
    pub async fn backup_stop(&self, cancel: &CancellationToken, wait: bool) -> Result<BackupStop> {
        const QUERY: &str = "SELECT lsn::text, \
             translate(encode(convert_to(labelfile, 'UTF8'), 'base64'), E'\\n', ''), \
             translate(encode(convert_to(spcmapfile, 'UTF8'), 'base64'), E'\\n', '') \
             FROM pg_backup_stop($1)";
        let params: [&(dyn tokio_postgres::types::ToSql + Sync); 1] = [&wait];
        let query = self.client.query_one(QUERY, &params);
        let row = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            result = query => result?,
        };

        let stop_lsn: String = row.get(0);
        let label_b64: String = row.get(1);
        let map_b64: String = row.get(2);
        let label = BASE64
            .decode(label_b64)
            .map_err(|err| Error::Other(err.into()))?;
        let tablespace_map = BASE64
            .decode(map_b64)
            .map_err(|err| Error::Other(err.into()))?;
        Ok(BackupStop {
            stop_lsn,
            label,
            tablespace_map,
        })
    }

    /// Name of the WAL segment containing `lsn`.
    pub async fn wal_file_name(&self, lsn: &str) -> Result<String> {
        let row = self
            .client
            .query_one("SELECT pg_walfile_name($1::pg_lsn)", &[&lsn])
            .await?;
        Ok(row.get(0))
    }

    /// Polls `pg_stat_replication` at 1 Hz until `app_name` shows up.
    pub async fn wait_replication_started(
        &self,
        cancel: &CancellationToken,
        app_name: &str,
        timeout: Duration,
    ) -> Result<()> {
        const QUERY: &str =
            "SELECT EXISTS (SELECT 1 FROM pg_stat_replication WHERE application_name = $1)";
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let row = self.client.query_one(QUERY, &[&app_name]).await?;
            let exists: bool = row.get(0);
            if exists {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::ReplicationTimeout(timeout));
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }
}
