use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    fsutil,
};

use super::Orchestrator;

const WAL_SEGMENT_TIMEOUT: Duration = Duration::from_secs(60);
const WAL_POLL_INTERVAL: Duration = Duration::from_secs(2);

impl Orchestrator<'_> {
    /// Phase 3: leave backup mode, persist the label blobs, and fetch
    /// pg_control over the control channel. pg_control is deliberately not
    /// part of the rsync sweeps; the copy taken here is the authoritative
    /// one for the stop LSN.
    pub(super) async fn finish_backup(&mut self, cancel: &CancellationToken) -> Result<()> {
        let control = self
            .control
            .as_ref()
            .ok_or_else(|| Error::config("control connection not established"))?;
        let ssh_client = self
            .ssh
            .as_ref()
            .ok_or_else(|| Error::config("ssh client not connected"))?;

        let stop = control.backup_stop(cancel, true).await?;
        self.backup_stopped = true;
        info!("backup stopped, stop_lsn {}", stop.stop_lsn);

        write_with_mode(
            &self.cfg.replica_pgdata.join("backup_label"),
            &stop.label,
            0o644,
        )?;
        if !stop.tablespace_map.is_empty() {
            write_with_mode(
                &self.cfg.replica_pgdata.join("tablespace_map"),
                &stop.tablespace_map,
                0o644,
            )?;
        }

        let src = self.cfg.primary_pgdata.join("global").join("pg_control");
        let data = ssh_client
            .output(cancel, &format!("cat '{}'", src.display()))
            .await?;
        let dest = self.cfg.replica_pgdata.join("global").join("pg_control");
        if let Some(parent) = dest.parent() {
            fsutil::ensure_dir(parent)?;
        }
        write_with_mode(&dest, &data, 0o600)?;

        self.stop_lsn = Some(stop.stop_lsn);
        Ok(())
    }

    /// Phase 4: wait for the segment containing the stop LSN, stop the
    /// receiver, move everything into the replica WAL dir, and promote the
    /// in-flight `.partial` segment.
    pub(super) async fn finalize_wal(&mut self, cancel: &CancellationToken) -> Result<()> {
        let control = self
            .control
            .as_ref()
            .ok_or_else(|| Error::config("control connection not established"))?;
        let stop_lsn = self
            .stop_lsn
            .as_ref()
            .ok_or_else(|| Error::config("backup not stopped"))?;

        let wal_file = control.wal_file_name(stop_lsn).await?;
        let deadline = tokio::time::Instant::now() + WAL_SEGMENT_TIMEOUT;
        loop {
            if self.wal_dir.join(&wal_file).exists() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::WalSegmentTimeout {
                    name: wal_file,
                    timeout: WAL_SEGMENT_TIMEOUT,
                });
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(WAL_POLL_INTERVAL) => {}
            }
        }

        // The receiver must be down before the streamed segment is renamed.
        if let Some(receiver) = self.receiver.as_mut() {
            if let Err(err) = receiver.stop().await {
                warn!("stop wal receiver: {err}");
            }
        }
        self.receiver = None;

        let dst_wal = self.cfg.replica_wal_dir();
        fsutil::ensure_dir_mode(&dst_wal, 0o700)?;
        move_wal_entries(&self.wal_dir, &dst_wal)?;
        promote_last_partial(&dst_wal)?;
        Ok(())
    }

    /// Phase 5: structural sanity of the produced replica, then lock down
    /// permissions. On failure the tree is left in place for diagnosis.
    pub(super) fn validate(&self) -> Result<()> {
        for name in ["PG_VERSION", "postgresql.conf", "pg_hba.conf"] {
            let path = self.cfg.replica_pgdata.join(name);
            if !path.exists() {
                return Err(Error::MissingReplicaFile(path));
            }
        }

        let wal_dir = self.cfg.replica_wal_dir();
        let segments = count_wal_segments(&wal_dir)?;
        if segments == 0 {
            return Err(Error::NoWalSegments(wal_dir));
        }

        fsutil::set_mode(&self.cfg.replica_pgdata, 0o700)?;
        fsutil::set_mode(&wal_dir, 0o700)?;
        info!("final validation ok, {segments} wal files");
        Ok(())
    }
}

fn write_with_mode(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    fs::write(path, data)?;
    fsutil::set_mode(path, mode)
}

/// Moves every entry from the capture dir into the replica WAL dir,
/// falling back to copy + remove across filesystems.
fn move_wal_entries(src_dir: &Path, dst_dir: &Path) -> Result<()> {
    for entry in fs::read_dir(src_dir)? {
        let entry = entry?;
        fsutil::move_entry(&entry.path(), &dst_dir.join(entry.file_name()))?;
    }
    Ok(())
}

/// The lexicographically greatest `.partial` entry is the segment that was
/// being streamed at stop time; strip its suffix so PostgreSQL replays it.
fn promote_last_partial(wal_dir: &Path) -> Result<()> {
    let mut partials: Vec<PathBuf> = fs::read_dir(wal_dir)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "partial"))
        .collect();
    partials.sort();

    if let Some(last) = partials.last() {
        let target = last.with_extension("");
        fs::rename(last, target)?;
    }
    Ok(())
}

/// WAL segment names are upper-case hex; anything else (receiver log,
/// history files aside) does not count toward the "replica has WAL" check.
fn count_wal_segments(wal_dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(wal_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
        {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{count_wal_segments, move_wal_entries, promote_last_partial};

    #[test]
    fn finalize_moves_and_promotes_partial() {
        let src = tempfile::tempdir().expect("src");
        let dst = tempfile::tempdir().expect("dst");

        fs::write(src.path().join("000000010000000000000002"), b"full").expect("write");
        fs::write(
            src.path().join("000000010000000000000003.partial"),
            b"streaming",
        )
        .expect("write");

        move_wal_entries(src.path(), dst.path()).expect("move");
        promote_last_partial(dst.path()).expect("promote");

        assert!(dst.path().join("000000010000000000000002").exists());
        assert!(dst.path().join("000000010000000000000003").exists());
        assert!(!dst.path().join("000000010000000000000003.partial").exists());
        assert!(fs::read_dir(src.path()).expect("src read").next().is_none());
    }

    #[test]
    fn only_greatest_partial_is_promoted() {
        let dir = tempfile::tempdir().expect("dir");
        fs::write(dir.path().join("000000010000000000000003.partial"), b"a").expect("write");
        fs::write(dir.path().join("000000010000000000000004.partial"), b"b").expect("write");

        promote_last_partial(dir.path()).expect("promote");

        assert!(dir.path().join("000000010000000000000004").exists());
        assert!(dir.path().join("000000010000000000000003.partial").exists());
    }

    #[test]
    fn segment_count_ignores_receiver_log() {
        let dir = tempfile::tempdir().expect("dir");
        fs::write(dir.path().join("000000010000000000000002"), b"x").expect("write");
        fs::write(dir.path().join("pg_receivewal.log"), b"log").expect("write");

        assert_eq!(count_wal_segments(dir.path()).expect("count"), 1);
    }
}
