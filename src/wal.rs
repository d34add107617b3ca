use std::{path::PathBuf, process::Stdio};

use log::{info, warn};
use tokio::process::{Child, Command};

use crate::{
    error::{Error, Result},
    fsutil,
};

#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Directory receiving WAL segments and the receiver log.
    pub dir: PathBuf,
    /// Optional replication slot; dropped best-effort on stop.
    pub slot: Option<String>,
    /// Sets PGAPPNAME so the stream is identifiable in pg_stat_replication.
    pub app_name: Option<String>,
    pub verbose: bool,
}

/// Supervises one `pg_receivewal` subprocess. Startable once; `stop` is
/// idempotent.
pub struct Receiver {
    opts: ReceiverOptions,
    child: Option<Child>,
    stopped: bool,
}

impl Receiver {
    pub fn new(opts: ReceiverOptions) -> Receiver {
        Receiver {
            opts,
            child: None,
            stopped: false,
        }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.opts.dir
    }

    pub fn start(&mut self) -> Result<()> {
        if self.child.is_some() || self.stopped {
            return Err(Error::ReceiverAlreadyStarted);
        }
        fsutil::ensure_dir(&self.opts.dir)?;

        let log_path = self.opts.dir.join("pg_receivewal.log");
        let log_file = std::fs::File::create(&log_path)?;
        let log_stderr = log_file.try_clone()?;

        let mut cmd = Command::new("pg_receivewal");
        cmd.args(receiver_args(&self.opts));
        if let Some(app_name) = &self.opts.app_name {
            cmd.env("PGAPPNAME", app_name);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_stderr));

        let child = cmd.spawn()?;
        info!("pg_receivewal started, dir {}", self.opts.dir.display());
        self.child = Some(child);
        Ok(())
    }

    /// Interrupts the receiver and waits for it to exit, then drops the
    /// replication slot when one was used. Safe to call more than once.
    pub async fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        match child.try_wait() {
            Ok(Some(status)) => warn!("pg_receivewal exited early: {status}"),
            _ => {
                if let Some(pid) = child.id() {
                    send_interrupt(pid);
                    let _ = child.wait().await;
                } else {
                    let _ = child.kill().await;
                }
            }
        }

        if let Some(slot) = &self.opts.slot {
            let result = Command::new("pg_receivewal")
                .arg("--host")
                .arg(&self.opts.host)
                .arg("--port")
                .arg(self.opts.port.to_string())
                .arg("--username")
                .arg(&self.opts.user)
                .arg("--no-password")
                .arg("--drop-slot")
                .arg("--slot")
                .arg(slot)
                .status()
                .await;
            if let Err(err) = result {
                warn!("drop slot {slot}: {err}");
            }
        }
        Ok(())
    }
}

fn receiver_args(opts: &ReceiverOptions) -> Vec<String> {
    let mut args = vec![
        "--host".to_string(),
        opts.host.clone(),
        "--port".to_string(),
        opts.port.to_string(),
        "--username".to_string(),
        opts.user.clone(),
        "--no-password".to_string(),
        "--directory".to_string(),
        opts.dir.display().to_string(),
    ];
    if let Some(slot) = &opts.slot {
        args.push("--slot".to_string());
        args.push(slot.clone());
    }
    if opts.verbose {
        args.push("--verbose".to_string());
    }
    args
}

/// SIGINT makes pg_receivewal flush and close the current segment before
/// exiting, unlike a plain kill.
#[allow(unsafe_code)]
fn send_interrupt(pid: u32) {
    // SAFETY: plain signal delivery to a child this process spawned
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGINT);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{receiver_args, ReceiverOptions};

    #[test]
    fn args_cover_connection_and_slot() {
        let opts = ReceiverOptions {
            host: "primary".to_string(),
            port: 5433,
            user: "postgres".to_string(),
            dir: PathBuf::from("/tmp/wal"),
            slot: Some("pgclone_1".to_string()),
            app_name: Some("pgclone-1".to_string()),
            verbose: true,
        };
        let args = receiver_args(&opts);
        let expect = [
            "--host",
            "primary",
            "--port",
            "5433",
            "--username",
            "postgres",
            "--no-password",
            "--directory",
            "/tmp/wal",
            "--slot",
            "pgclone_1",
            "--verbose",
        ];
        assert_eq!(args, expect);
    }

    #[test]
    fn slot_and_verbose_are_optional() {
        let opts = ReceiverOptions {
            host: "primary".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            dir: PathBuf::from("/tmp/wal"),
            slot: None,
            app_name: None,
            verbose: false,
        };
        let args = receiver_args(&opts);
        assert!(!args.contains(&"--slot".to_string()));
        assert!(!args.contains(&"--verbose".to_string()));
    }
}
