use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::error::MptError;

const LOCK_FILE: &str = "~lock";
const DIRTY_FILE: &str = "~dirty";

/// Exclusive single-process ownership of a state directory, held through an
/// OS file lock on the `~lock` sentinel. The lock is released when the guard
/// is dropped.
pub struct DirectoryLock {
    file: File,
    path: PathBuf,
}

impl DirectoryLock {
    pub fn acquire(dir: &Path) -> Result<Self, MptError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| MptError::LockHeld(dir.to_path_buf()))?;
        debug!(dir = %dir.display(), "directory locked");
        Ok(DirectoryLock { file, path })
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

/// Fails on directories that were not cleanly closed, then plants the dirty
/// sentinel for the new session.
pub fn claim_clean_directory(dir: &Path) -> Result<(), MptError> {
    if is_dirty(dir) {
        return Err(MptError::DirtyDirectory(dir.to_path_buf()));
    }
    fs::write(dir.join(DIRTY_FILE), [])?;
    Ok(())
}

pub fn is_dirty(dir: &Path) -> bool {
    dir.join(DIRTY_FILE).exists()
}

pub fn clear_dirty(dir: &Path) -> Result<(), MptError> {
    let path = dir.join(DIRTY_FILE);
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lock_is_exclusive_within_the_process() {
        let dir = TempDir::new().unwrap();
        let lock = DirectoryLock::acquire(dir.path()).unwrap();
        assert!(matches!(
            DirectoryLock::acquire(dir.path()),
            Err(MptError::LockHeld(_))
        ));
        drop(lock);
        DirectoryLock::acquire(dir.path()).unwrap();
    }

    #[test]
    fn dirty_sentinel_blocks_reopen() {
        let dir = TempDir::new().unwrap();
        claim_clean_directory(dir.path()).unwrap();
        assert!(is_dirty(dir.path()));
        assert!(matches!(
            claim_clean_directory(dir.path()),
            Err(MptError::DirtyDirectory(_))
        ));
        clear_dirty(dir.path()).unwrap();
        claim_clean_directory(dir.path()).unwrap();
    }
}
