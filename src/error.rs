use std::{path::PathBuf, process::ExitStatus, time::Duration};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Config(String),

    #[error("another clone is already running for `{0}`")]
    ReplicaBusy(PathBuf),

    #[error("ssh: {0}")]
    Ssh(String),

    #[error("ssh: {0}")]
    Ssh2(#[from] ssh2::Error),

    #[error("ssh output exceeds {0} bytes")]
    SshOutputOverflow(usize),

    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),

    #[error("PostgreSQL >= 15 required, server reports {0}")]
    UnsupportedServerVersion(String),

    #[error("replication did not start within {0:?}")]
    ReplicationTimeout(Duration),

    #[error("remote daemon bootstrap: {0}")]
    Bootstrap(String),

    #[error("rsync exited with {0}")]
    TransferFailed(ExitStatus),

    #[error("wal receiver already started")]
    ReceiverAlreadyStarted,

    #[error("WAL segment {name} not received within {timeout:?}")]
    WalSegmentTimeout { name: String, timeout: Duration },

    #[error("`{0}` missing from replica data directory")]
    MissingReplicaFile(PathBuf),

    #[error("no WAL segments in `{0}`")]
    NoWalSegments(PathBuf),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(anyhow::Error),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn ssh<S: Into<String>>(msg: S) -> Self {
        Error::Ssh(msg.into())
    }

    pub fn bootstrap<S: Into<String>>(msg: S) -> Self {
        Error::Bootstrap(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<anyhow::Error> for Error {
    fn from(error: anyhow::Error) -> Self {
        Error::Other(error)
    }
}
