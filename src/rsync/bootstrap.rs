use std::{collections::BTreeMap, fmt::Write as _, sync::LazyLock, time::Duration};

use log::{debug, info, warn};
use rand::Rng;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    ssh,
};

/// Configuration for [`start_remote`].
#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    /// Remote scratch directory; a random `/tmp/pgclone_<tag>` by default.
    pub remote_temp_dir: Option<String>,
    /// Inclusive candidate port range scanned on the primary.
    pub port_min: u16,
    pub port_max: u16,
    /// Module name -> absolute path on the primary.
    pub modules: BTreeMap<String, String>,
    /// `max connections` daemon parameter.
    pub max_connections: usize,
    /// How long to wait for the daemon's PORT file.
    pub timeout: Duration,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        BootstrapOptions {
            remote_temp_dir: None,
            port_min: 45000,
            port_max: 45100,
            modules: BTreeMap::new(),
            max_connections: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

/// A running rsync daemon on the primary. [`Daemon::stop`] must be called
/// to terminate it and remove its scratch directory.
#[derive(Debug)]
pub struct Daemon {
    pub port: u16,
    pub secret: String,
    pub remote_dir: String,
}

impl Daemon {
    /// Kills the daemon by PID file and removes the remote directory.
    /// Missing state is ignored, so stopping after a partial bootstrap is
    /// safe.
    pub async fn stop(&self, cancel: &CancellationToken, client: &ssh::Client) -> Result<()> {
        let script = stop_script(&self.remote_dir);
        if let Err(err) = client.output(cancel, &script).await {
            warn!("remote daemon stop failed: {err}");
            return Err(err);
        }
        Ok(())
    }
}

/// Starts `rsync --daemon` on the primary over the control channel: writes
/// config and secret into a fresh scratch dir, picks the first free port in
/// the candidate range, launches the daemon detached, and waits for the
/// PORT file to confirm it is up.
pub async fn start_remote(
    cancel: &CancellationToken,
    client: &ssh::Client,
    opts: BootstrapOptions,
) -> Result<Daemon> {
    let secret = format!("{:016x}", rand::thread_rng().gen::<u64>());
    let tag = format!("{:08x}", rand::thread_rng().gen::<u32>());
    let remote_dir = opts
        .remote_temp_dir
        .clone()
        .unwrap_or_else(|| format!("/tmp/pgclone_{tag}"));

    let config = render_config(&remote_dir, opts.max_connections, &opts.modules);
    let script = bootstrap_script(&remote_dir, &config, &secret, opts.port_min, opts.port_max);

    debug!("rsync bootstrap: running remote script");
    let output = client.output(cancel, &script).await.map_err(|err| {
        if err.is_cancelled() {
            err
        } else {
            Error::bootstrap(format!("remote script failed: {err}"))
        }
    })?;

    let port = wait_for_port(cancel, client, &remote_dir, opts.timeout, &output).await?;
    info!("rsync daemon ready on port {port}");

    Ok(Daemon {
        port,
        secret,
        remote_dir,
    })
}

static NUMERIC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+$").unwrap());

async fn wait_for_port(
    cancel: &CancellationToken,
    client: &ssh::Client,
    remote_dir: &str,
    timeout: Duration,
    bootstrap_output: &[u8],
) -> Result<u16> {
    let probe = format!("cat '{remote_dir}/PORT' 2>/dev/null || true");
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let data = client.output(cancel, &probe).await.unwrap_or_default();
        let text = String::from_utf8_lossy(&data);
        let text = text.trim();
        if NUMERIC.is_match(text) {
            if let Ok(port) = text.parse::<u16>() {
                if port > 0 {
                    return Ok(port);
                }
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(Error::bootstrap(format!(
                "PORT file not found within {timeout:?}; bootstrap output: {}",
                String::from_utf8_lossy(bootstrap_output).trim()
            )));
        }
        tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            () = tokio::time::sleep(Duration::from_millis(200)) => {}
        }
    }
}

fn render_config(remote_dir: &str, max_connections: usize, modules: &BTreeMap<String, String>) -> String {
    let mut conf = format!(
        "use chroot = no\n\
         max connections = {max_connections}\n\
         pid file = {remote_dir}/rsyncd.pid\n\
         log file = {remote_dir}/rsyncd.log\n\
         lock file = {remote_dir}/rsyncd.lock\n\
         sockopts = TCP_NODELAY,SO_SNDBUF=512000,SO_RCVBUF=512000\n\n"
    );
    for (name, path) in modules {
        let _ = write!(
            conf,
            "[{name}]\n    path = {path}\n    read only = yes\n    auth users = replica\n    secrets file = {remote_dir}/rsyncd.secrets\n\n"
        );
    }
    conf
}

/// One shell round-trip: create the dir, write config + secrets, pick the
/// first port that refuses a connect, record it, and detach the daemon.
fn bootstrap_script(
    remote_dir: &str,
    config: &str,
    secret: &str,
    port_min: u16,
    port_max: u16,
) -> String {
    format!(
        r#"bash -c 'set -euo pipefail
RD={remote_dir}
mkdir -p "$RD"
cat > "$RD/rsyncd.conf" <<CONF
{config}CONF
echo "replica:{secret}" > "$RD/rsyncd.secrets"
chmod 600 "$RD/rsyncd.secrets"
PORT=""
for p in $(seq {port_min} {port_max}); do
  (echo >/dev/tcp/127.0.0.1/$p) >/dev/null 2>&1 || {{ PORT=$p; break; }}
done
[ -z "$PORT" ] && {{ echo no_port >&2; exit 1; }}
echo "$PORT" > "$RD/PORT"
echo "$PORT"
nohup rsync --daemon --config="$RD/rsyncd.conf" --port=$PORT >/dev/null 2>&1 &
'"#
    )
}

fn stop_script(remote_dir: &str) -> String {
    format!(
        r#"set -euo pipefail
RD={remote_dir}
if [ -f "$RD/rsyncd.pid" ]; then
  kill -9 $(cat "$RD/rsyncd.pid") || true
fi
rm -rf "$RD"
"#
    )
}
