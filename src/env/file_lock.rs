//! Advisory lock on the database `LOCK` file.

use crate::error::LsmKvError;
use crate::Result;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Holds an exclusive lock on a file until dropped.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Fails if another handle, in this process or another one, already
    /// holds the lock.
    pub fn lock(path: &Path) -> Result<FileLock> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        Self::try_lock(&file).map_err(|e| {
            LsmKvError::IOError(std::io::Error::new(
                e.kind(),
                format!("lock {}: {}", path.display(), e),
            ))
        })?;
        Ok(FileLock {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> std::io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};
        use std::os::unix::io::AsRawFd;

        let result = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> std::io::Result<()> {
        Ok(())
    }
}

// The lock is released when the file descriptor is closed.

#[cfg(all(test, unix))]
mod tests {
    use crate::env::file_lock::FileLock;

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("LOCK");
        let lock = FileLock::lock(&path).unwrap();
        assert_eq!(lock.path(), path.as_path());
        assert!(FileLock::lock(&path).unwrap_err().is_io_error());
        drop(lock);
        FileLock::lock(&path).unwrap();
    }
}
