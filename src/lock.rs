use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info};
use nix::{
    errno::Errno,
    fcntl::{Flock, FlockArg},
};

use osutils::files;
use sdk_api::error::{ContentionError, ReportError, SdkError};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum LockMode {
    /// Shared, for users that only need the chroot to stay as it is.
    Read,
    /// Exclusive, for anything that changes what the chroot is.
    Write,
}

impl LockMode {
    fn flock_arg(self) -> FlockArg {
        match self {
            LockMode::Read => FlockArg::LockSharedNonblock,
            LockMode::Write => FlockArg::LockExclusiveNonblock,
        }
    }
}

/// An advisory lock on a chroot, released on drop.
pub struct ChrootLock {
    _lock: Flock<File>,
    path: PathBuf,
    mode: LockMode,
}

impl std::fmt::Debug for ChrootLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChrootLock")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish()
    }
}

impl ChrootLock {
    /// Takes the lock at `path`, polling until `timeout` has passed.
    pub fn acquire(path: &Path, mode: LockMode, timeout: Duration) -> Result<Self, SdkError> {
        let lock_error = || ContentionError::Lock {
            path: path.display().to_string(),
        };
        if let Some(parent) = path.parent() {
            files::create_dirs(parent).structured(lock_error())?;
        }
        // The file is never removed, unlinking it could let two holders lock different inodes.
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .structured(lock_error())?;

        let start = Instant::now();
        let mut announced = false;
        loop {
            match Flock::lock(file, mode.flock_arg()) {
                Ok(lock) => {
                    debug!("Acquired {mode} lock '{}'", path.display());
                    return Ok(Self {
                        _lock: lock,
                        path: path.to_owned(),
                        mode,
                    });
                }
                Err((returned, Errno::EWOULDBLOCK)) => {
                    let elapsed = start.elapsed();
                    if elapsed >= timeout {
                        return Err(SdkError::new(ContentionError::LockTimeout {
                            path: path.display().to_string(),
                            seconds: timeout.as_secs(),
                        }));
                    }
                    if !announced {
                        info!(
                            "Waiting up to {}s for the {mode} lock '{}'",
                            timeout.as_secs(),
                            path.display()
                        );
                        announced = true;
                    }
                    thread::sleep(POLL_INTERVAL.min(timeout - elapsed));
                    file = returned;
                }
                Err((_, errno)) => return Err(errno).structured(lock_error()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use sdk_api::error::ErrorKind;

    #[test]
    fn test_shared_and_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".chroot_lock");

        let first = ChrootLock::acquire(&path, LockMode::Read, Duration::ZERO).unwrap();
        let second = ChrootLock::acquire(&path, LockMode::Read, Duration::ZERO).unwrap();
        assert_eq!(first.mode(), LockMode::Read);
        assert_eq!(second.path(), path);

        let error = ChrootLock::acquire(&path, LockMode::Write, Duration::ZERO).unwrap_err();
        assert_eq!(
            error.kind(),
            &ErrorKind::Contention(ContentionError::LockTimeout {
                path: path.display().to_string(),
                seconds: 0,
            })
        );

        assert_eq!(
            format!("{first:?}"),
            format!("ChrootLock {{ path: {path:?}, mode: Read }}")
        );
        drop(first);
        drop(second);
        let writer = ChrootLock::acquire(&path, LockMode::Write, Duration::ZERO).unwrap();
        assert!(ChrootLock::acquire(&path, LockMode::Read, Duration::from_millis(300)).is_err());
        drop(writer);
        assert!(path.exists());
    }

    #[test]
    fn test_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/.chroot_lock");

        let writer = ChrootLock::acquire(&path, LockMode::Write, Duration::ZERO).unwrap();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            drop(writer);
        });
        ChrootLock::acquire(&path, LockMode::Write, Duration::from_secs(10)).unwrap();
        handle.join().unwrap();
    }
}
