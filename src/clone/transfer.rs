use std::{io::Write as _, os::unix::fs::OpenOptionsExt, path::Path, time::Instant};

use log::info;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    fsutil,
    rsync::{self, RunOptions, Stats},
};

use super::Orchestrator;

/// Excluded from the single-process pgdata sweep: WAL and base are covered
/// by their own sweeps, the rest is runtime state the replica must not
/// inherit.
const INITIAL_SWEEP_EXCLUDES: &[&str] = &[
    "pg_wal/",
    "base/",
    "postmaster.pid",
    "postmaster.opts",
    "pg_replslot/",
    "pg_dynshmem/",
    "pg_notify/",
    "pg_serial/",
    "pg_snapshots/",
    "pg_stat_tmp/",
    "pg_subtrans/",
    "pgsql_tmp*",
    "pg_internal.init",
];

/// Excluded directories that PostgreSQL still expects to exist, empty.
const RUNTIME_DIRS: &[&str] = &[
    "pg_replslot",
    "pg_dynshmem",
    "pg_notify",
    "pg_serial",
    "pg_snapshots",
    "pg_stat_tmp",
    "pg_subtrans",
];

impl Orchestrator<'_> {
    /// Phase 2: enter backup mode, then move the data: one sweep of the
    /// pgdata skeleton, a parallel sweep of base, and one per tablespace.
    pub(super) async fn transfer(&mut self, cancel: &CancellationToken) -> Result<()> {
        let control = self
            .control
            .as_ref()
            .ok_or_else(|| Error::config("control connection not established"))?;
        let daemon = self
            .daemon
            .as_ref()
            .ok_or_else(|| Error::config("remote daemon not running"))?;

        let start_lsn = control.backup_start(cancel, "pgclone", true).await?;
        self.backup_started = true;
        info!("backup started, start_lsn {start_lsn}");

        fsutil::ensure_dir(&self.cfg.replica_pgdata)?;

        let secret_file = self.runctx.join("rsync_pass");
        let mut secret = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .mode(0o600)
            .open(&secret_file)?;
        secret.write_all(daemon.secret.as_bytes())?;
        drop(secret);

        let rsync_cfg = rsync::Config {
            host: self.cfg.pg_host.clone(),
            port: daemon.port,
            secret_file,
            checksum: self.cfg.paranoid,
            verbose: self.cfg.verbose,
        };

        info!("running initial pgdata sweep");
        initial_sweep(cancel, &rsync_cfg, &self.cfg.replica_pgdata).await?;
        info!("initial pgdata sweep done");

        for dir in RUNTIME_DIRS {
            fsutil::ensure_dir_mode(&self.cfg.replica_pgdata.join(dir), 0o700)?;
        }

        let opts = RunOptions {
            workers: self.cfg.effective_parallel(),
            progress: self.cfg.progress,
            progress_interval: self.cfg.progress_interval,
        };

        let started = Instant::now();
        let mut total = Stats::default();

        let base_files = rsync::list_module_files(&rsync_cfg, "base").await?;
        info!("base module: {} files", base_files.len());
        let base_dst = self.cfg.replica_pgdata.join("base");
        let stats =
            rsync::run_parallel(cancel, &rsync_cfg, "base", base_files, &base_dst, &opts).await?;
        info!(
            "base sync done, {} files, {} bytes transferred",
            stats.num_files, stats.total_transferred_size
        );
        total = total.add(stats);

        for tablespace in &self.tablespaces {
            let module = format!("spc_{}", tablespace.oid);
            let files = rsync::list_module_files(&rsync_cfg, &module).await?;
            info!("tablespace {}: {} files", tablespace.oid, files.len());
            if files.is_empty() {
                continue;
            }
            fsutil::ensure_dir(&tablespace.location)?;
            let stats = rsync::run_parallel(
                cancel,
                &rsync_cfg,
                &module,
                files,
                &tablespace.location,
                &opts,
            )
            .await?;
            info!(
                "tablespace {} sync done, {} bytes transferred",
                tablespace.oid, stats.total_transferred_size
            );
            total = total.add(stats);
        }

        let elapsed = started.elapsed();
        info!("transfer phase done in {:.1}s", elapsed.as_secs_f64());
        println!("{}", total.summary(elapsed));
        Ok(())
    }
}

/// Single-process `--delete` sweep of the pgdata module, carrying the full
/// exclusion set.
async fn initial_sweep(
    cancel: &CancellationToken,
    cfg: &rsync::Config,
    replica_pgdata: &Path,
) -> Result<()> {
    let mut cmd = Command::new("rsync");
    cmd.arg("-a").arg("--delete").arg("--stats");
    if cfg.checksum {
        cmd.arg("--checksum");
    }
    if cfg.verbose {
        cmd.arg("--human-readable");
    }
    for pattern in INITIAL_SWEEP_EXCLUDES {
        cmd.arg("--exclude").arg(pattern);
    }
    cmd.arg("--password-file").arg(&cfg.secret_file);
    cmd.arg(cfg.module_url("pgdata"));
    cmd.arg(format!("{}/", replica_pgdata.display()));
    cmd.kill_on_drop(true);

    let output = tokio::select! {
        () = cancel.cancelled() => return Err(Error::Cancelled),
        output = cmd.output() => output?,
    };
    if !output.status.success() {
        log::debug!(
            "initial sweep output: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return Err(Error::TransferFailed(output.status));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{INITIAL_SWEEP_EXCLUDES, RUNTIME_DIRS};

    #[test]
    fn sweep_excludes_every_runtime_dir() {
        for dir in RUNTIME_DIRS {
            let pattern = format!("{dir}/");
            assert!(
                INITIAL_SWEEP_EXCLUDES.contains(&pattern.as_str()),
                "{dir} missing from the sweep exclusions"
            );
        }
    }

    #[test]
    fn sweep_excludes_wal_and_base() {
        assert!(INITIAL_SWEEP_EXCLUDES.contains(&"pg_wal/"));
        assert!(INITIAL_SWEEP_EXCLUDES.contains(&"base/"));
        assert!(INITIAL_SWEEP_EXCLUDES.contains(&"postmaster.pid"));
        assert!(INITIAL_SWEEP_EXCLUDES.contains(&"pg_internal.init"));
    }
}
