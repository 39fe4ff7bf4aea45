//! PID-file locking so two daemon instances never run against the same
//! workdir (and, transitively, the same sqlite catalog) at once.

use std::fs::{self, File};
use std::io::{Read, Write};

use camino::Utf8Path;

pub enum LockCreationResult {
    Created {
        new_lock_contents: String,
        file: File,
    },
    AlreadyLocked {
        existing_lock_contents: String,
    },
    CreationFailed(anyhow::Error),
}

/// Attempts to exclusively create (and `flock`) the lock file at `lock_file_path`,
/// writing `contents` (typically the current PID) into it. The returned `File`
/// must be kept alive (leaked, in the daemon's case) for the duration the lock
/// is held; dropping it releases the `flock`.
pub fn create_lock_file(lock_file_path: &Utf8Path, contents: String) -> LockCreationResult {
    let mut file = match fs::OpenOptions::new()
        .create(true)
        .write(true)
        .read(true)
        .open(lock_file_path)
    {
        Ok(file) => file,
        Err(e) => return LockCreationResult::CreationFailed(e.into()),
    };

    match nix::fcntl::flock(
        std::os::fd::AsRawFd::as_raw_fd(&file),
        nix::fcntl::FlockArg::LockExclusiveNonblock,
    ) {
        Ok(()) => {}
        Err(nix::errno::Errno::EWOULDBLOCK) => {
            let mut existing = String::new();
            if let Err(e) = file.read_to_string(&mut existing) {
                return LockCreationResult::CreationFailed(e.into());
            }
            return LockCreationResult::AlreadyLocked {
                existing_lock_contents: existing,
            };
        }
        Err(e) => return LockCreationResult::CreationFailed(e.into()),
    }

    if let Err(e) = file.set_len(0) {
        return LockCreationResult::CreationFailed(e.into());
    }
    if let Err(e) = file.write_all(contents.as_bytes()) {
        return LockCreationResult::CreationFailed(e.into());
    }
    if let Err(e) = file.flush() {
        return LockCreationResult::CreationFailed(e.into());
    }

    LockCreationResult::Created {
        new_lock_contents: contents,
        file,
    }
}
