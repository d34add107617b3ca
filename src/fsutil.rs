use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::Path,
};

use crate::error::Result;

/// `mkdir -p` with default permissions.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// `mkdir -p` followed by an explicit mode on the leaf directory.
pub fn ensure_dir_mode(path: &Path, mode: u32) -> Result<()> {
    fs::create_dir_all(path)?;
    set_mode(path, mode)
}

pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Returns true when `path` does not exist or is an empty directory.
pub fn dir_is_empty(path: &Path) -> Result<bool> {
    match fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(err) => Err(err.into()),
    }
}

/// Moves a directory entry by rename, falling back to copy + remove when the
/// rename fails (typically a cross-device link error). The copy path applies
/// to regular files only; `fs::copy` carries the permission bits over.
pub fn move_entry(src: &Path, dst: &Path) -> Result<()> {
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    fs::copy(src, dst)?;
    fs::remove_file(src)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{dir_is_empty, ensure_dir_mode, move_entry};

    #[test]
    fn empty_checks() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(dir_is_empty(dir.path()).expect("empty"));
        assert!(dir_is_empty(&dir.path().join("missing")).expect("missing"));

        fs::write(dir.path().join("x"), b"x").expect("write");
        assert!(!dir_is_empty(dir.path()).expect("non-empty"));
    }

    #[test]
    fn mode_is_applied() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("private");
        ensure_dir_mode(&target, 0o700).expect("ensure");
        let mode = fs::metadata(&target).expect("meta").permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn move_between_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        fs::write(&src, b"payload").expect("write");
        move_entry(&src, &dst).expect("move");
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).expect("read"), b"payload");
    }
}
