mod bootstrap;
mod distribute;
mod list;
mod parallel;
mod progress;
mod stats;

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use tokio::process::Command;

use crate::error::{Error, Result};

pub use self::{
    bootstrap::{start_remote, BootstrapOptions, Daemon},
    distribute::distribute,
    list::{parse_list, FileEntry},
    parallel::{run_parallel, RunOptions},
    progress::ProgressMode,
    stats::Stats,
};

/// Exclusions applied to every per-module sweep. Transient relation scratch
/// files and relcache init files must never reach the replica.
pub const MODULE_EXCLUDES: &[&str] = &["pgsql_tmp*", "pg_internal.init"];

/// Parameters common to all rsync workers in a session.
#[derive(Debug, Clone)]
pub struct Config {
    /// Remote host running the rsync daemon.
    pub host: String,
    /// Daemon port chosen during bootstrap.
    pub port: u16,
    /// Local path to the password file (mode 0600).
    pub secret_file: PathBuf,
    /// Use `--checksum` (paranoid mode).
    pub checksum: bool,
    /// Add `--human-readable` to worker output.
    pub verbose: bool,
}

impl Config {
    pub fn module_url(&self, module: &str) -> String {
        format!("rsync://replica@{}:{}/{}/", self.host, self.port, module)
    }

    /// Argument list syncing the paths listed in `files_from` into `dst_dir`.
    fn sync_args(&self, module: &str, files_from: &Path, dst_dir: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-a".into(), "--relative".into(), "--inplace".into()];
        if self.checksum {
            args.push("--checksum".into());
        }
        args.push("--stats".into());
        if self.verbose {
            args.push("--human-readable".into());
        }
        for pattern in MODULE_EXCLUDES {
            args.push("--exclude".into());
            args.push((*pattern).into());
        }
        args.push("--files-from".into());
        args.push(files_from.into());
        args.push("--password-file".into());
        args.push(self.secret_file.as_os_str().into());
        args.push(self.module_url(module).into());
        args.push(format!("{}/", dst_dir.display()).into());
        args
    }

    /// Worker command. `--out-format=%l` makes stdout emit one numeric line
    /// per transferred file, which feeds the shared progress counter.
    pub fn sync_command(&self, module: &str, files_from: &Path, dst_dir: &Path) -> Command {
        let mut cmd = Command::new("rsync");
        cmd.arg("--out-format=%l");
        cmd.args(self.sync_args(module, files_from, dst_dir));
        cmd.kill_on_drop(true);
        cmd
    }

    /// Pre-flight command reporting exact per-file byte counts without
    /// transferring anything.
    pub fn dry_run_command(&self, module: &str, files_from: &Path, dst_dir: &Path) -> Command {
        let mut cmd = Command::new("rsync");
        cmd.arg("--dry-run");
        cmd.arg("--out-format=%l");
        cmd.args(self.sync_args(module, files_from, dst_dir));
        cmd.kill_on_drop(true);
        cmd
    }
}

/// Lists a module's contents via `rsync --list-only`.
pub async fn list_module_files(cfg: &Config, module: &str) -> Result<Vec<FileEntry>> {
    let mut cmd = Command::new("rsync");
    cmd.arg("--recursive")
        .arg("--list-only")
        .arg("--password-file")
        .arg(&cfg.secret_file)
        .arg(cfg.module_url(module))
        .kill_on_drop(true);
    let output = cmd.output().await?;
    if !output.status.success() {
        return Err(Error::TransferFailed(output.status));
    }
    parse_list(&output.stdout[..])
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::Config;

    fn config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 45001,
            secret_file: "/tmp/sec".into(),
            checksum: true,
            verbose: false,
        }
    }

    #[test]
    fn sync_args_shape() {
        let cfg = config();
        let args = cfg.sync_args("base", Path::new("/tmp/list"), Path::new("/data/base"));
        let want: Vec<&str> = vec![
            "-a",
            "--relative",
            "--inplace",
            "--checksum",
            "--stats",
            "--exclude",
            "pgsql_tmp*",
            "--exclude",
            "pg_internal.init",
            "--files-from",
            "/tmp/list",
            "--password-file",
            "/tmp/sec",
            "rsync://replica@127.0.0.1:45001/base/",
            "/data/base/",
        ];
        let got: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(got, want);
    }

    #[test]
    fn module_url() {
        let cfg = config();
        assert_eq!(
            cfg.module_url("spc_16384"),
            "rsync://replica@127.0.0.1:45001/spc_16384/"
        );
    }

    #[test]
    fn checksum_flag_is_optional() {
        let mut cfg = config();
        cfg.checksum = false;
        let args = cfg.sync_args("base", Path::new("/tmp/list"), Path::new("/data/base"));
        assert!(!args.iter().any(|a| a == "--checksum"));
    }
}
