use std::{path::PathBuf, process::exit};

use clap::{
    builder::{styling::AnsiColor, Styles},
    Parser, ValueEnum,
};
use concolor_clap::{color_choice, ColorChoice};
use env_logger::WriteStyle;
use log::{debug, error, info, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::{
    clone, debughook,
    error::{Error, Result},
    lock::RunLock,
    logger,
    rsync::ProgressMode,
    runctx::RunCtx,
};

/// Clone a PostgreSQL primary into a bootable standby via rsync + WAL streaming
#[derive(Parser, Debug)]
#[command(
    version,
    about,
    long_about = None,
    styles = cli_styles(),
    color = color_choice(),
)]
pub struct Cli {
    /// Primary host
    #[arg(long, value_name = "HOST", required = true)]
    pub pghost: String,

    /// Primary port
    #[arg(long, value_name = "PORT", default_value_t = 5432)]
    pub pgport: u16,

    /// Primary user
    #[arg(long, value_name = "USER", required = true)]
    pub pguser: String,

    /// Primary PGDATA path
    #[arg(long, value_name = "DIR", required = true)]
    pub primary_pgdata: PathBuf,

    /// Replica PGDATA path
    #[arg(long, value_name = "DIR", required = true)]
    pub replica_pgdata: PathBuf,

    /// Replica pg_wal path (default: <replica-pgdata>/pg_wal)
    #[arg(long, value_name = "DIR")]
    pub replica_waldir: Option<PathBuf>,

    /// SSH user on the primary
    #[arg(long, value_name = "USER", required = true)]
    pub ssh_user: String,

    /// SSH private key file
    #[arg(long, value_name = "FILE")]
    pub ssh_key: Option<PathBuf>,

    /// Disable strict host-key checking (NOT recommended)
    #[arg(long, default_value_t = false)]
    pub insecure_ssh: bool,

    /// Temporary WAL directory (default: a fresh temp dir)
    #[arg(long, value_name = "DIR")]
    pub temp_waldir: Option<PathBuf>,

    /// Use a temporary physical replication slot
    #[arg(long, default_value_t = false)]
    pub slot: bool,

    /// Number of parallel rsync jobs (0 = CPU cores)
    #[arg(long, value_name = "NUM", default_value_t = 0)]
    pub parallel: usize,

    /// Verify transfers with checksums (slow)
    #[arg(long, default_value_t = false)]
    pub paranoid: bool,

    /// Allow cloning into a non-empty replica PGDATA
    #[arg(long, default_value_t = false)]
    pub drop_existing: bool,

    /// Progress display mode
    #[arg(long, value_enum, default_value_t = Progress::Auto)]
    pub progress: Progress,

    /// Seconds between updates in plain mode
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub progress_interval: u64,

    /// Verbose output
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Debug trace output
    #[arg(long, default_value_t = false)]
    pub debug: bool,

    /// Preserve temporary run directories
    #[arg(long, default_value_t = false)]
    pub keep_run_tmp: bool,

    /// When to use color in output
    #[arg(long, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Auto,
    Bar,
    Plain,
    None,
}

/// Exit code for a run interrupted by SIGINT/SIGTERM, distinguishable from
/// ordinary failures.
const EXIT_CANCELLED: i32 = 130;

pub async fn main() {
    let cli = Cli::parse();
    logger::init(cli.debug, cli.verbose, write_style_from_color_choice(cli.color));

    info!("pgclone starting");
    debughook::stop_if("before-main");

    if let Err(err) = run(cli).await {
        error!("{err}");
        exit(if err.is_cancelled() { EXIT_CANCELLED } else { 1 });
    }
    info!("pgclone finished successfully");
}

async fn run(cli: Cli) -> Result<()> {
    let runctx = RunCtx::new("pgclone_run_", cli.keep_run_tmp)?;
    debug!("run temp dir {}", runctx.path().display());

    let Some(lock) = RunLock::try_acquire(&cli.replica_pgdata)? else {
        return Err(Error::ReplicaBusy(cli.replica_pgdata));
    };

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let cfg = clone::Config {
        pg_host: cli.pghost,
        pg_port: cli.pgport,
        pg_user: cli.pguser,
        primary_pgdata: cli.primary_pgdata,
        replica_pgdata: cli.replica_pgdata,
        replica_waldir: cli.replica_waldir,
        ssh_user: cli.ssh_user,
        ssh_key: cli.ssh_key,
        insecure_ssh: cli.insecure_ssh,
        temp_waldir: cli.temp_waldir,
        use_slot: cli.slot,
        parallel: cli.parallel,
        paranoid: cli.paranoid,
        verbose: cli.verbose,
        drop_existing: cli.drop_existing,
        keep_run_tmp: cli.keep_run_tmp,
        progress: resolve_progress(cli.progress, cli.verbose),
        progress_interval: cli.progress_interval,
    };

    let result = clone::run(&cancel, &cfg, &runctx).await;

    lock.release();
    if let Err(err) = runctx.cleanup() {
        warn!("cleanup run temp dir: {err}");
    }
    result
}

fn resolve_progress(choice: Progress, verbose: bool) -> ProgressMode {
    match choice {
        Progress::Bar => ProgressMode::Bar,
        Progress::Plain => ProgressMode::Plain,
        Progress::None => ProgressMode::None,
        Progress::Auto => {
            if verbose {
                ProgressMode::Bar
            } else {
                ProgressMode::None
            }
        }
    }
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        let terminate = async {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    warn!("cannot install SIGTERM handler: {err}");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            () = terminate => info!("received SIGTERM, shutting down"),
        }
        cancel.cancel();
    });
}

fn write_style_from_color_choice(color: ColorChoice) -> WriteStyle {
    match color {
        ColorChoice::Auto => WriteStyle::Auto,
        ColorChoice::Always => WriteStyle::Always,
        ColorChoice::Never => WriteStyle::Never,
    }
}

fn cli_styles() -> Styles {
    Styles::styled()
        .usage(AnsiColor::BrightCyan.on_default().underline())
        .header(AnsiColor::BrightCyan.on_default().underline())
        .literal(AnsiColor::BrightBlue.on_default())
        .placeholder(AnsiColor::BrightMagenta.on_default())
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};

    use super::{resolve_progress, Cli, Progress};
    use crate::rsync::ProgressMode;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn auto_progress_follows_verbosity() {
        assert_eq!(resolve_progress(Progress::Auto, true), ProgressMode::Bar);
        assert_eq!(resolve_progress(Progress::Auto, false), ProgressMode::None);
        assert_eq!(resolve_progress(Progress::Plain, false), ProgressMode::Plain);
        assert_eq!(resolve_progress(Progress::None, true), ProgressMode::None);
    }

    #[test]
    fn required_flags_are_enforced() {
        let result = Cli::try_parse_from(["pgclone", "--pghost", "primary"]);
        assert!(result.is_err());
    }

    #[test]
    fn full_invocation_parses() {
        let cli = Cli::try_parse_from([
            "pgclone",
            "--pghost",
            "primary",
            "--pguser",
            "postgres",
            "--primary-pgdata",
            "/var/lib/postgresql/15/main",
            "--replica-pgdata",
            "/data/replica",
            "--ssh-user",
            "postgres",
            "--parallel",
            "4",
            "--progress",
            "plain",
            "--progress-interval",
            "10",
        ])
        .expect("parse");
        assert_eq!(cli.pgport, 5432);
        assert_eq!(cli.parallel, 4);
        assert_eq!(cli.progress, Progress::Plain);
        assert_eq!(cli.progress_interval, 10);
        assert!(!cli.drop_existing);
    }
}
