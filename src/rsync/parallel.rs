use std::{
    io::Write as _,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_channel::Sender;
use log::{debug, info};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::Command,
    sync::Mutex,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    fsutil,
};

use super::{
    distribute::distribute,
    list::FileEntry,
    progress::{parse_leading_size, ProgressMode, Renderer},
    stats::{parse_stats, Stats},
    Config,
};

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Worker count; 0 means one per CPU core.
    pub workers: usize,
    pub progress: ProgressMode,
    /// Seconds between plain-mode lines.
    pub progress_interval: u64,
}

/// Workers that exited cleanly get this long to hand over their parsed
/// stats before aggregation gives up on them.
const STATS_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Transfers one module with N parallel rsync workers, multiplexing their
/// output into a shared progress counter, and returns the aggregated stats.
/// The first worker failure cancels the rest; cancellation kills every
/// child.
pub async fn run_parallel(
    cancel: &CancellationToken,
    cfg: &Config,
    module: &str,
    files: Vec<FileEntry>,
    dst_dir: &Path,
    opts: &RunOptions,
) -> Result<Stats> {
    let workers = if opts.workers == 0 {
        num_cpus::get().max(1)
    } else {
        opts.workers
    };

    fsutil::ensure_dir(dst_dir)?;

    // Worker list files and logs live here for the duration of the module.
    let scratch = tempfile::Builder::new().prefix("pgclone_files_").tempdir()?;

    let total_bytes = match preflight_total(cancel, cfg, module, &files, dst_dir, scratch.path())
        .await
    {
        Ok(measured) if measured > 0 => measured,
        Err(err @ Error::Cancelled) => return Err(err),
        _ => files.iter().map(|f| f.size).sum(),
    };

    info!("syncing module {module}");

    let buckets = distribute(files, workers);

    let mut prepared = Vec::new();
    for (index, bucket) in buckets.into_iter().enumerate() {
        if bucket.is_empty() {
            continue;
        }
        let list_path = scratch.path().join(format!("files_{index}.txt"));
        write_file_list(&list_path, &bucket)?;
        let log_path = scratch.path().join(format!("worker_{index}.log"));
        prepared.push((cfg.sync_command(module, &list_path, dst_dir), log_path));
    }

    let counter = Arc::new(AtomicU64::new(0));
    let renderer = Renderer::start(
        opts.progress,
        module,
        total_bytes,
        opts.progress_interval,
        counter.clone(),
    );

    let (stats_tx, stats_rx) = async_channel::bounded::<Stats>(workers);
    let local_cancel = cancel.child_token();

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    for (cmd, log_path) in prepared {
        tasks.spawn(run_worker(
            local_cancel.clone(),
            cmd,
            log_path,
            counter.clone(),
            stats_tx.clone(),
        ));
    }
    drop(stats_tx);

    let mut failure: Option<Error> = None;
    while let Some(joined) = tasks.join_next().await {
        let result = match joined {
            Ok(result) => result,
            Err(err) => Err(Error::Other(err.into())),
        };
        if let Err(err) = result {
            if failure.is_none() {
                // first failure wins; kill the remaining workers
                local_cancel.cancel();
                failure = Some(err);
            }
        }
    }

    if let Some(err) = failure {
        renderer.abandon().await;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        return Err(err);
    }

    renderer.finish().await;

    let mut collected = Vec::new();
    let drain = async {
        while let Ok(stats) = stats_rx.recv().await {
            collected.push(stats);
        }
    };
    let _ = tokio::time::timeout(STATS_DRAIN_TIMEOUT, drain).await;

    Ok(aggregate(collected, counter.load(Ordering::Relaxed)))
}

/// Sums worker stats and overrides `bytes_received` with the line-level
/// progress counter. Per-connection receive totals are not additive across
/// workers, so the counter is the source of truth for module throughput.
fn aggregate<I: IntoIterator<Item = Stats>>(worker_stats: I, transferred_bytes: u64) -> Stats {
    let mut total = Stats::default();
    for stats in worker_stats {
        total = total.add(stats);
    }
    if transferred_bytes > 0 {
        total.bytes_received = transferred_bytes;
    }
    total
}

async fn run_worker(
    cancel: CancellationToken,
    mut cmd: Command,
    log_path: PathBuf,
    counter: Arc<AtomicU64>,
    stats_tx: Sender<Stats>,
) -> Result<()> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let log = Arc::new(Mutex::new(tokio::fs::File::create(&log_path).await?));

    let mut consumers = Vec::new();
    if let Some(stdout) = stdout {
        consumers.push(tokio::spawn(consume_progress(
            stdout,
            counter.clone(),
            log.clone(),
        )));
    }
    if let Some(stderr) = stderr {
        consumers.push(tokio::spawn(consume_log(stderr, log.clone())));
    }

    let status = tokio::select! {
        status = child.wait() => status?,
        () = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            for consumer in consumers {
                let _ = consumer.await;
            }
            return Err(Error::Cancelled);
        }
    };

    // Pipes must be drained before the log file is parsed.
    for consumer in consumers {
        let _ = consumer.await;
    }
    log.lock().await.flush().await?;

    if !status.success() {
        return Err(Error::TransferFailed(status));
    }

    let stats = tokio::task::spawn_blocking(move || -> Result<Stats> {
        parse_stats(std::fs::File::open(&log_path)?)
    })
    .await
    .map_err(|err| Error::Other(err.into()))??;

    let _ = stats_tx.send(stats).await;
    Ok(())
}

/// Reads `--out-format=%l` lines, bumping the shared byte counter per line
/// while mirroring the raw stream into the worker log.
async fn consume_progress<R: AsyncRead + Unpin>(
    stream: R,
    counter: Arc<AtomicU64>,
    log: Arc<Mutex<tokio::fs::File>>,
) {
    let mut reader = BufReader::with_capacity(256 * 1024, stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {
                if let Some(size) = parse_leading_size(&line) {
                    if size > 0 {
                        counter.fetch_add(size, Ordering::Relaxed);
                    }
                }
                let mut file = log.lock().await;
                let _ = file.write_all(&line).await;
            }
        }
    }
}

/// Mirrors the stats/diagnostic stream into the worker log, echoing each
/// line at debug level.
async fn consume_log<R: AsyncRead + Unpin>(stream: R, log: Arc<Mutex<tokio::fs::File>>) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("rsync: {line}");
        let mut file = log.lock().await;
        let _ = file.write_all(line.as_bytes()).await;
        let _ = file.write_all(b"\n").await;
    }
}

/// Dry-run pass over the full file list to learn the exact byte total the
/// progress denominator should use. Failure or an empty result falls back
/// to the listed sizes; cancellation propagates.
async fn preflight_total(
    cancel: &CancellationToken,
    cfg: &Config,
    module: &str,
    files: &[FileEntry],
    dst_dir: &Path,
    scratch: &Path,
) -> Result<u64> {
    let list_path = scratch.join("all_files.txt");
    write_file_list(&list_path, files)?;

    let mut cmd = cfg.dry_run_command(module, &list_path, dst_dir);
    let output = tokio::select! {
        () = cancel.cancelled() => return Err(Error::Cancelled),
        output = cmd.output() => output?,
    };
    if !output.status.success() {
        return Ok(0);
    }

    let mut total = 0;
    for line in output.stdout.split(|byte| *byte == b'\n') {
        if let Some(size) = parse_leading_size(line) {
            total += size;
        }
    }
    Ok(total)
}

fn write_file_list(path: &Path, files: &[FileEntry]) -> Result<()> {
    let mut file = std::fs::File::create(path)?;
    for entry in files {
        writeln!(file, "{}", entry.path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    use tokio::sync::Mutex;

    use super::{aggregate, consume_progress, write_file_list, FileEntry, Stats};

    #[test]
    fn aggregate_overrides_bytes_received() {
        let first = Stats {
            num_files: 10,
            bytes_sent: 950,
            bytes_received: 900,
            ..Stats::default()
        };
        let second = Stats {
            num_files: 15,
            bytes_sent: 1850,
            bytes_received: 1800,
            ..Stats::default()
        };

        let total = aggregate([first, second], 2700);
        assert_eq!(total.num_files, 25);
        assert_eq!(total.bytes_sent, 2800);
        assert_eq!(total.bytes_received, 2700);
    }

    #[test]
    fn aggregate_keeps_summed_value_without_counter() {
        let first = Stats {
            bytes_received: 80,
            ..Stats::default()
        };
        let total = aggregate([first], 0);
        assert_eq!(total.bytes_received, 80);
    }

    #[test]
    fn aggregate_defuses_per_connection_inflation() {
        const GIB: u64 = 1024 * 1024 * 1024;

        // Eight workers each report a ~35 GiB connection total; the real
        // module moved far more than any single connection saw.
        let per_worker = Stats {
            bytes_received: 35 * GIB,
            bytes_sent: 1024 * 1024,
            ..Stats::default()
        };
        let actual = 3360 * GIB;
        let total = aggregate(std::iter::repeat(per_worker).take(8), actual);
        assert_eq!(total.bytes_received, actual);
        assert_eq!(total.bytes_sent, 8 * 1024 * 1024);
    }

    #[tokio::test]
    async fn progress_consumer_counts_leading_digits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("worker.log");
        let log = Arc::new(Mutex::new(
            tokio::fs::File::create(&log_path).await.expect("log"),
        ));

        let counter = Arc::new(AtomicU64::new(0));
        let input: &[u8] = b"100\n200\nsending incremental file list\n50\n";
        consume_progress(input, counter.clone(), log).await;

        assert_eq!(counter.load(Ordering::Relaxed), 350);
        let written = std::fs::read(&log_path).expect("read log");
        assert_eq!(written, input);
    }

    #[test]
    fn file_list_is_one_path_per_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("files.txt");
        let files = vec![
            FileEntry {
                path: "base/1/123".into(),
                size: 1,
            },
            FileEntry {
                path: "base/1/456".into(),
                size: 2,
            },
        ];
        write_file_list(&path, &files).expect("write");
        let contents = std::fs::read_to_string(&path).expect("read");
        assert_eq!(contents, "base/1/123\nbase/1/456\n");
    }
}
