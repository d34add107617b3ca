use std::{
    fmt::Write as _,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use fs2::FileExt;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Advisory lock preventing two clones from targeting the same replica
/// data directory. The lock file name is derived from the directory path,
/// so independent replicas never contend.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

pub fn lock_path(replica_pgdata: &Path) -> PathBuf {
    let digest = Sha256::digest(replica_pgdata.to_string_lossy().as_bytes());
    let mut tag = String::with_capacity(16);
    for byte in &digest[..8] {
        let _ = write!(tag, "{byte:02x}");
    }
    std::env::temp_dir().join(format!("pgclone_{tag}.lock"))
}

impl RunLock {
    /// Attempts a non-blocking exclusive lock. Returns `None` when another
    /// process already holds it.
    pub fn try_acquire(replica_pgdata: &Path) -> Result<Option<RunLock>> {
        let path = lock_path(replica_pgdata);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(RunLock { file, path })),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Releases the OS lock and removes the lock file. Removal is
    /// best-effort; another process may have unlinked it already.
    pub fn release(self) {
        let _ = self.file.unlock();
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{lock_path, RunLock};

    #[test]
    fn second_lock_is_busy() {
        let pgdata = Path::new("/tmp/pgdata_lock_test");
        let first = RunLock::try_acquire(pgdata)
            .expect("first lock")
            .expect("first lock acquired");

        let second = RunLock::try_acquire(pgdata).expect("second lock attempt");
        assert!(second.is_none(), "lock should be held by the first handle");

        first.release();
        let third = RunLock::try_acquire(pgdata)
            .expect("third lock")
            .expect("reacquire after release");
        third.release();
    }

    #[test]
    fn path_is_stable_per_target() {
        let a = lock_path(Path::new("/data/replica_a"));
        let b = lock_path(Path::new("/data/replica_b"));
        assert_ne!(a, b);
        assert_eq!(a, lock_path(Path::new("/data/replica_a")));
    }
}
