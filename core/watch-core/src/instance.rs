//! Single-instance guard for the resident daemon.
//!
//! The instance that owns the control socket holds an exclusive advisory lock
//! on a sibling `.lock` file. Concurrent launches that lose the lock never
//! touch the socket. The lock is given up on teardown so a replacement can
//! take over while the old process drains its delayed restarts.

use fs2::FileExt;
use fs_err as fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, WatchError};

const LOCK_EXTENSION: &str = "lock";

/// Lock file path paired with a control socket path.
pub fn lock_path_for(socket: &Path) -> PathBuf {
    socket.with_extension(LOCK_EXTENSION)
}

#[derive(Debug)]
pub struct InstanceLock {
    file: fs::File,
    path: PathBuf,
}

impl InstanceLock {
    /// Takes the lock without blocking. `Ok(None)` when another instance holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        // No truncate before the lock is held; that would wipe the holder's pid.
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|err| WatchError::io("open instance lock", err))?;

        if let Err(err) = FileExt::try_lock_exclusive(file.file()) {
            if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                debug!(path = %path.display(), "Instance lock held elsewhere");
                return Ok(None);
            }
            return Err(WatchError::io("lock instance file", err));
        }

        let mut file = file;
        file.set_len(0)
            .map_err(|err| WatchError::io("truncate instance lock", err))?;
        writeln!(file, "{}", std::process::id())
            .map_err(|err| WatchError::io("write instance lock pid", err))?;

        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(self.file.file());
        debug!(path = %self.path.display(), "Instance lock released");
    }
}
