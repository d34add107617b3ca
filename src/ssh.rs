use std::{
    io::{self, Write},
    net::{TcpStream, ToSocketAddrs},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use log::{debug, warn};
use ssh2::{CheckResult, KnownHostFileKind, Session};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Captured command output is bounded to keep a misbehaving remote command
/// from exhausting memory.
const OUTPUT_LIMIT: usize = 1 << 20;

/// Connection parameters for the control channel to the primary.
#[derive(Debug, Clone)]
pub struct Config {
    pub user: String,
    /// Host or `host:port`; port 22 when absent.
    pub host: String,
    /// Private key; when `None`, default candidates and the agent are tried.
    pub key_path: Option<PathBuf>,
    /// Skip host-key verification.
    pub insecure: bool,
    /// Dial timeout; zero means [`DEFAULT_TIMEOUT`].
    pub timeout: Duration,
}

/// An authenticated SSH session. libssh2 calls are blocking, so every
/// operation runs on the blocking pool and races the cancellation token.
pub struct Client {
    session: Arc<Mutex<Session>>,
    host: String,
}

impl Client {
    pub async fn connect(cancel: &CancellationToken, cfg: Config) -> Result<Client> {
        if cfg.user.is_empty() || cfg.host.is_empty() {
            return Err(Error::config("ssh user and host are required"));
        }
        let host = cfg.host.clone();
        let handle = tokio::task::spawn_blocking(move || dial(&cfg));
        let session = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            joined = handle => joined.map_err(|err| Error::Other(err.into()))??,
        };
        Ok(Client {
            session: Arc::new(Mutex::new(session)),
            host,
        })
    }

    /// Runs a command with stdout/stderr attached to the given writers.
    /// If the cancellation token fires mid-run the session is abandoned and
    /// the cancellation error is returned. A non-zero exit status is an
    /// error; whatever the writers received is theirs to keep.
    pub async fn run<O, E>(
        &self,
        cancel: &CancellationToken,
        cmd: &str,
        mut stdout: O,
        mut stderr: E,
    ) -> Result<()>
    where
        O: Write + Send + 'static,
        E: Write + Send + 'static,
    {
        debug!("ssh run on {}: {cmd}", self.host);
        let session = self.session.clone();
        let cmd = cmd.to_string();
        let handle = tokio::task::spawn_blocking(move || {
            exec_streamed(&session, &cmd, &mut stdout, &mut stderr)
        });
        tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            joined = handle => joined.map_err(|err| Error::Other(err.into()))?,
        }
    }

    /// Runs a command and returns its combined stdout/stderr, bounded at
    /// 1 MiB. A non-zero exit status is an error carrying the captured
    /// output.
    pub async fn output(&self, cancel: &CancellationToken, cmd: &str) -> Result<Vec<u8>> {
        let buffer = LimitedBuffer::new(OUTPUT_LIMIT);
        match self.run(cancel, cmd, buffer.clone(), buffer.clone()).await {
            Ok(()) => Ok(buffer.bytes()),
            Err(_) if buffer.overflowed() => Err(Error::SshOutputOverflow(OUTPUT_LIMIT)),
            Err(Error::Ssh(msg)) => {
                let captured = buffer.bytes();
                let text = String::from_utf8_lossy(&captured);
                let text = text.trim();
                if text.is_empty() {
                    Err(Error::Ssh(msg))
                } else {
                    Err(Error::ssh(format!("{msg}: {text}")))
                }
            }
            Err(err) => Err(err),
        }
    }
}

fn dial(cfg: &Config) -> Result<Session> {
    let addr = if has_port(&cfg.host) {
        cfg.host.clone()
    } else {
        format!("{}:22", cfg.host)
    };
    debug!("ssh dial {addr} as {}", cfg.user);

    let sock_addr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::ssh(format!("cannot resolve {addr}")))?;
    let timeout = if cfg.timeout.is_zero() {
        DEFAULT_TIMEOUT
    } else {
        cfg.timeout
    };
    let tcp = TcpStream::connect_timeout(&sock_addr, timeout)?;

    let mut session = Session::new()?;
    session.set_tcp_stream(tcp);
    session.handshake()?;

    verify_host_key(&session, &cfg.host, cfg.insecure)?;
    authenticate(&session, &cfg.user, cfg.key_path.as_deref())?;
    Ok(session)
}

fn verify_host_key(session: &Session, host: &str, insecure: bool) -> Result<()> {
    if insecure {
        warn!("ssh: host-key verification disabled");
        return Ok(());
    }

    let Some(known_path) = dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts"))
    else {
        warn!("ssh: no home directory, skipping host-key verification");
        return Ok(());
    };

    let mut known_hosts = session.known_hosts()?;
    if known_hosts
        .read_file(&known_path, KnownHostFileKind::OpenSSH)
        .is_err()
    {
        warn!(
            "ssh: cannot load {}, skipping host-key verification",
            known_path.display()
        );
        return Ok(());
    }

    let (key, _) = session
        .host_key()
        .ok_or_else(|| Error::ssh("server presented no host key"))?;
    let bare_host = host.split(':').next().unwrap_or(host);
    match known_hosts.check(bare_host, key) {
        CheckResult::Match => Ok(()),
        CheckResult::NotFound => Err(Error::ssh(format!(
            "host {bare_host} not present in {}",
            known_path.display()
        ))),
        CheckResult::Mismatch => Err(Error::ssh(format!("host key mismatch for {bare_host}"))),
        CheckResult::Failure => Err(Error::ssh("host key check failed")),
    }
}

fn authenticate(session: &Session, user: &str, key_path: Option<&Path>) -> Result<()> {
    if let Some(path) = key_path {
        session
            .userauth_pubkey_file(user, None, path, None)
            .map_err(|err| Error::ssh(format!("key auth with {} failed: {err}", path.display())))?;
        return Ok(());
    }

    if let Some(home) = dirs::home_dir() {
        for name in ["id_ed25519", "id_rsa", "id_ecdsa"] {
            let candidate = home.join(".ssh").join(name);
            if candidate.exists()
                && session
                    .userauth_pubkey_file(user, None, &candidate, None)
                    .is_ok()
                && session.authenticated()
            {
                return Ok(());
            }
        }
    }

    if session.userauth_agent(user).is_ok() && session.authenticated() {
        return Ok(());
    }

    Err(Error::ssh(
        "no auth method succeeded (provide a key or ensure an agent is running)",
    ))
}

fn exec_streamed<O: Write, E: Write>(
    session: &Mutex<Session>,
    cmd: &str,
    stdout: &mut O,
    stderr: &mut E,
) -> Result<()> {
    let session = session
        .lock()
        .map_err(|_| Error::ssh("session lock poisoned"))?;
    let mut channel = session.channel_session()?;
    channel.exec(cmd)?;

    io::copy(&mut channel, stdout)?;
    io::copy(&mut channel.stderr(), stderr)?;
    channel.wait_close()?;

    let code = channel.exit_status()?;
    if code != 0 {
        return Err(Error::ssh(format!("command exited with status {code}")));
    }
    Ok(())
}

/// Caps the bytes it accepts; [`Client::output`] hands clones of one buffer
/// to both streams, so the limit applies to the combined capture.
#[derive(Clone)]
struct LimitedBuffer {
    state: Arc<Mutex<BufferState>>,
    limit: usize,
}

struct BufferState {
    data: Vec<u8>,
    overflowed: bool,
}

impl LimitedBuffer {
    fn new(limit: usize) -> LimitedBuffer {
        LimitedBuffer {
            state: Arc::new(Mutex::new(BufferState {
                data: Vec::new(),
                overflowed: false,
            })),
            limit,
        }
    }

    fn bytes(&self) -> Vec<u8> {
        self.state
            .lock()
            .map(|state| state.data.clone())
            .unwrap_or_default()
    }

    fn overflowed(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.overflowed)
            .unwrap_or(false)
    }
}

impl Write for LimitedBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let Ok(mut state) = self.state.lock() else {
            return Err(io::Error::other("buffer lock poisoned"));
        };
        if state.data.len() + data.len() > self.limit {
            state.overflowed = true;
            return Err(io::Error::other("capture limit exceeded"));
        }
        state.data.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn has_port(addr: &str) -> bool {
    for c in addr.chars().rev() {
        match c {
            ':' => return true,
            // IPv6 literals close with a bracket before any port colon
            ']' => return false,
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{has_port, LimitedBuffer};

    #[test]
    fn port_detection() {
        assert!(has_port("example.com:2222"));
        assert!(!has_port("example.com"));
        assert!(!has_port("[::1]"));
        assert!(has_port("[::1]:22"));
    }

    #[test]
    fn capture_is_bounded() {
        let mut buffer = LimitedBuffer::new(1024);
        buffer.write_all(b"ok").expect("within limit");
        assert_eq!(buffer.bytes(), b"ok");
        assert!(!buffer.overflowed());

        let err = buffer.write_all(&[0u8; 4096]).unwrap_err();
        assert_eq!(err.to_string(), "capture limit exceeded");
        assert!(buffer.overflowed());
        assert_eq!(buffer.bytes(), b"ok");
    }

    #[test]
    fn limit_spans_both_stream_handles() {
        let buffer = LimitedBuffer::new(8);
        let mut stdout = buffer.clone();
        let mut stderr = buffer.clone();

        stdout.write_all(b"12345").expect("stdout within limit");
        let err = stderr.write_all(b"6789").unwrap_err();
        assert_eq!(err.to_string(), "capture limit exceeded");
        assert_eq!(buffer.bytes(), b"12345");
    }
}
