use log::debug;
use std::{
    fs::{self, File, OpenOptions},
    os::unix::io::AsRawFd,
    path::Path,
};

use crate::error::{Error, Result};
use crate::topology::lock_path;

/// Exclusive `flock(2)` on `<state_dir>/locks/port-<P>.lock`, released on drop.
#[derive(Debug)]
pub struct PortLock {
    port: u16,
    _file: File,
}

impl PortLock {
    /// Block until the lock for `port` is ours.
    pub fn acquire(state_dir: &Path, port: u16) -> Result<Self> {
        Self::lock(state_dir, port, libc::LOCK_EX)
    }

    /// Fail immediately when another operation holds the port.
    #[cfg(test)]
    pub fn try_acquire(state_dir: &Path, port: u16) -> Result<Self> {
        Self::lock(state_dir, port, libc::LOCK_EX | libc::LOCK_NB)
    }

    fn lock(state_dir: &Path, port: u16, op: libc::c_int) -> Result<Self> {
        let path = lock_path(state_dir, port);
        let fail = |reason: String| Error::Lock { port, reason };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| fail(format!("mkdir {}: {e}", parent.display())))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| fail(format!("open {}: {e}", path.display())))?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc != 0 {
            let e = std::io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(fail("another operation is in progress for this port".into()));
            }
            return Err(fail(format!("flock {}: {e}", path.display())));
        }

        debug!("locked port {port} ({})", path.display());
        Ok(Self { port, _file: file })
    }
}

impl Drop for PortLock {
    fn drop(&mut self) {
        debug!("unlocked port {}", self.port);
    }
}
