mod finalize;
mod transfer;

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use log::{info, warn};
use rand::Rng;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    fsutil,
    postgres::{self, Tablespace},
    rsync::{self, ProgressMode},
    runctx::RunCtx,
    ssh, wal,
};

/// Everything the clone pipeline needs, resolved by the CLI layer.
#[derive(Debug, Clone)]
pub struct Config {
    pub pg_host: String,
    pub pg_port: u16,
    pub pg_user: String,
    pub primary_pgdata: PathBuf,
    pub replica_pgdata: PathBuf,
    pub replica_waldir: Option<PathBuf>,

    pub ssh_user: String,
    pub ssh_key: Option<PathBuf>,
    pub insecure_ssh: bool,

    pub temp_waldir: Option<PathBuf>,
    pub use_slot: bool,

    /// Worker count; 0 means one per CPU core.
    pub parallel: usize,
    pub paranoid: bool,
    pub verbose: bool,

    pub drop_existing: bool,
    pub keep_run_tmp: bool,

    pub progress: ProgressMode,
    pub progress_interval: u64,
}

impl Config {
    fn effective_parallel(&self) -> usize {
        if self.parallel == 0 {
            num_cpus::get().max(1)
        } else {
            self.parallel
        }
    }

    fn replica_wal_dir(&self) -> PathBuf {
        self.replica_waldir
            .clone()
            .unwrap_or_else(|| self.replica_pgdata.join("pg_wal"))
    }
}

const REPLICATION_START_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs the full clone pipeline. Teardown is executed exactly once on every
/// path, with a fresh (never-cancelled) token so that cancellation cannot
/// orphan remote state.
pub async fn run(cancel: &CancellationToken, cfg: &Config, runctx: &RunCtx) -> Result<()> {
    let mut orchestrator = Orchestrator::new(cfg, runctx);
    let result = orchestrator.pipeline(cancel).await;
    orchestrator.teardown().await;
    result
}

/// Owns every acquired resource across the clone phases; released in
/// reverse order by [`Orchestrator::teardown`].
pub(crate) struct Orchestrator<'a> {
    cfg: &'a Config,
    runctx: &'a RunCtx,
    nonce: String,

    receiver: Option<wal::Receiver>,
    control: Option<postgres::Control>,
    ssh: Option<ssh::Client>,
    daemon: Option<rsync::Daemon>,

    /// WAL scratch dir owned by this run (when no --temp-waldir given).
    wal_tmp: Option<TempDir>,
    wal_dir: PathBuf,

    tablespaces: Vec<Tablespace>,

    stop_lsn: Option<String>,
    backup_started: bool,
    backup_stopped: bool,
}

impl<'a> Orchestrator<'a> {
    fn new(cfg: &'a Config, runctx: &'a RunCtx) -> Orchestrator<'a> {
        let nonce = format!("{:08x}", rand::thread_rng().gen::<u32>());
        Orchestrator {
            cfg,
            runctx,
            nonce,
            receiver: None,
            control: None,
            ssh: None,
            daemon: None,
            wal_tmp: None,
            wal_dir: PathBuf::new(),
            tablespaces: Vec::new(),
            stop_lsn: None,
            backup_started: false,
            backup_stopped: false,
        }
    }

    async fn pipeline(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.check_config()?;
        self.setup_capture_and_daemon(cancel).await?;
        self.transfer(cancel).await?;
        self.finish_backup(cancel).await?;
        self.finalize_wal(cancel).await?;
        self.validate()?;
        info!("clone pipeline completed, replica ready");
        Ok(())
    }

    /// Fails before any side effect when the target state is unusable.
    fn check_config(&self) -> Result<()> {
        if !self.cfg.primary_pgdata.is_absolute() {
            return Err(Error::config("--primary-pgdata must be an absolute path"));
        }
        if !self.cfg.drop_existing && !fsutil::dir_is_empty(&self.cfg.replica_pgdata)? {
            return Err(Error::config(format!(
                "replica data directory {} is not empty; pass --drop-existing to reuse it",
                self.cfg.replica_pgdata.display()
            )));
        }
        Ok(())
    }

    /// Phase 1: WAL capture first, then the remote rsync daemon. Capture
    /// must be established before any backup state is taken, so the WAL
    /// stream covers the whole [start, stop] interval.
    async fn setup_capture_and_daemon(&mut self, cancel: &CancellationToken) -> Result<()> {
        let wal_dir = match &self.cfg.temp_waldir {
            Some(dir) => {
                fsutil::ensure_dir(dir)?;
                dir.clone()
            }
            None => {
                let tmp = tempfile::Builder::new().prefix("pgclone_wal_").tempdir()?;
                let path = tmp.path().to_path_buf();
                self.wal_tmp = Some(tmp);
                path
            }
        };
        self.wal_dir = wal_dir.clone();

        let app_name = format!("pgclone-{}", self.nonce);
        let slot = self
            .cfg
            .use_slot
            .then(|| format!("pgclone_{}", self.nonce));

        let mut receiver = wal::Receiver::new(wal::ReceiverOptions {
            host: self.cfg.pg_host.clone(),
            port: self.cfg.pg_port,
            user: self.cfg.pg_user.clone(),
            dir: wal_dir,
            slot,
            app_name: Some(app_name.clone()),
            verbose: self.cfg.verbose,
        });
        receiver.start()?;
        self.receiver = Some(receiver);

        let control = postgres::Control::connect(
            cancel,
            &self.cfg.pg_host,
            self.cfg.pg_port,
            &self.cfg.pg_user,
        )
        .await?;
        control.ensure_version_15_plus().await?;
        control
            .wait_replication_started(cancel, &app_name, REPLICATION_START_TIMEOUT)
            .await?;
        info!("replication started as {app_name}");

        self.tablespaces = control.list_tablespaces().await?;
        self.control = Some(control);

        let mut modules = BTreeMap::new();
        modules.insert(
            "pgdata".to_string(),
            self.cfg.primary_pgdata.display().to_string(),
        );
        modules.insert(
            "base".to_string(),
            self.cfg.primary_pgdata.join("base").display().to_string(),
        );
        for tablespace in &self.tablespaces {
            modules.insert(
                format!("spc_{}", tablespace.oid),
                tablespace.location.display().to_string(),
            );
        }

        let ssh_client = ssh::Client::connect(
            cancel,
            ssh::Config {
                user: self.cfg.ssh_user.clone(),
                host: self.cfg.pg_host.clone(),
                key_path: self.cfg.ssh_key.clone(),
                insecure: self.cfg.insecure_ssh,
                timeout: ssh::DEFAULT_TIMEOUT,
            },
        )
        .await?;

        let daemon = rsync::start_remote(
            cancel,
            &ssh_client,
            rsync::BootstrapOptions {
                modules,
                max_connections: self.cfg.effective_parallel() * 4,
                ..rsync::BootstrapOptions::default()
            },
        )
        .await?;

        self.ssh = Some(ssh_client);
        self.daemon = Some(daemon);
        Ok(())
    }

    /// Releases resources in reverse order of acquisition. Failures are
    /// logged, never propagated, so they cannot mask the pipeline error.
    async fn teardown(&mut self) {
        let cancel = CancellationToken::new();

        if let Some(receiver) = self.receiver.as_mut() {
            if let Err(err) = receiver.stop().await {
                warn!("teardown: stop wal receiver: {err}");
            }
        }
        self.receiver = None;

        if let Some(daemon) = self.daemon.take() {
            if let Some(ssh_client) = self.ssh.as_ref() {
                let _ = daemon.stop(&cancel, ssh_client).await;
            }
        }
        self.ssh = None;

        if let Some(control) = self.control.take() {
            // the primary must not be left in backup mode
            if self.backup_started && !self.backup_stopped {
                match control.backup_stop(&cancel, false).await {
                    Ok(_) => info!("backup mode ended during teardown"),
                    Err(err) => warn!("teardown: pg_backup_stop: {err}"),
                }
            }
            control.close().await;
        }

        if let Some(wal_tmp) = self.wal_tmp.take() {
            if self.cfg.keep_run_tmp {
                let _ = wal_tmp.into_path();
            } else if let Err(err) = wal_tmp.close() {
                warn!("teardown: remove wal temp dir: {err}");
            }
        }
    }
}
