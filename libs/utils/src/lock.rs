use std::fs::File;
use std::os::unix::io::AsRawFd;

use anyhow::Context;
use camino::Utf8Path;
use nix::fcntl::{flock, FlockArg};

/// An exclusive advisory lock on a directory, preventing two keepers from
/// managing the same data directory at once. The lock is released when the
/// guard is dropped, i.e. normally when the process exits.
pub struct DirLock {
    // Keeps the locked fd alive; flock is released on close.
    _file: File,
}

impl DirLock {
    /// Take an exclusive non-blocking lock on `dir`. Fails immediately if
    /// another process already holds it.
    pub fn acquire(dir: &Utf8Path) -> anyhow::Result<DirLock> {
        let file = File::open(dir).with_context(|| format!("failed to open {dir:?}"))?;
        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
            .with_context(|| format!("cannot take exclusive lock on {dir:?}"))?;
        Ok(DirLock { _file: file })
    }
}
