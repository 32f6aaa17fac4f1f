use crate::error::BootstrapError;

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs3::FileExt;
use tracing::debug;

const LOCK_FILE: &str = "LOCK";

/// Exclusive ownership of a state directory, released on drop.
#[derive(Debug)]
pub struct StateDirLock {
    file: File,
    path: PathBuf,
}

impl StateDirLock {
    /// Creates the directory if needed and takes the lock without blocking.
    pub fn acquire(dir: &Path) -> Result<Self, BootstrapError> {
        let unusable = |source| BootstrapError::StateDir {
            path: dir.to_path_buf(),
            source,
        };

        fs::create_dir_all(dir).map_err(unusable)?;

        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(unusable)?;

        if let Err(e) = FileExt::try_lock_exclusive(&file) {
            return Err(match e.kind() {
                ErrorKind::WouldBlock => BootstrapError::StateDirLocked(dir.to_path_buf()),
                _ if e.raw_os_error() == fs3::lock_contended_error().raw_os_error() => {
                    BootstrapError::StateDirLocked(dir.to_path_buf())
                }
                _ => unusable(e),
            });
        }

        debug!("locked state directory {:?}", dir);

        Ok(Self { file, path })
    }
}

impl Drop for StateDirLock {
    fn drop(&mut self) {
        if FileExt::unlock(&self.file).is_ok() {
            debug!("released {:?}", self.path);
        }
    }
}
