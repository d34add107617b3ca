use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::Result;

/// Per-run scratch directory holding worker file lists, worker logs and the
/// rsync secret file. Removed on cleanup unless the run asked to keep it.
#[derive(Debug)]
pub struct RunCtx {
    dir: Option<TempDir>,
    path: PathBuf,
    keep: bool,
}

impl RunCtx {
    pub fn new(prefix: &str, keep: bool) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir()?;
        let path = dir.path().to_path_buf();
        Ok(RunCtx {
            dir: Some(dir),
            path,
            keep,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join<P: AsRef<Path>>(&self, name: P) -> PathBuf {
        self.path.join(name)
    }

    pub fn cleanup(mut self) -> Result<()> {
        if let Some(dir) = self.dir.take() {
            if self.keep {
                let _ = dir.into_path();
            } else {
                dir.close()?;
            }
        }
        Ok(())
    }
}
