//! Advisory file locking with poll-and-sleep retry.

use crate::error::{Result, StoreError};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

/// How lock contention is waited out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockPolicy {
    /// Sleep between attempts.
    pub retry_interval: Duration,

    /// Give up after this long. `None` retries forever.
    pub timeout: Option<Duration>,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(250),
            timeout: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
    match mode {
        LockMode::Shared => FileExt::try_lock_shared(file),
        LockMode::Exclusive => FileExt::try_lock_exclusive(file),
    }
}

/// Open `path` and lock it.
///
/// On contention the handle is closed, the caller sleeps for the policy's
/// retry interval and opens again. Open failures are returned immediately.
pub fn acquire(
    path: &Path,
    options: &OpenOptions,
    mode: LockMode,
    policy: &LockPolicy,
) -> Result<File> {
    let deadline = policy.timeout.map(|t| Instant::now() + t);

    loop {
        let file = options.open(path)?;

        match try_lock(&file, mode) {
            Ok(()) => return Ok(file),
            Err(e) if is_contended(&e) => {
                drop(file);

                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(StoreError::LockTimeout(path.to_path_buf()));
                }

                tracing::trace!(path = %path.display(), ?mode, "lock busy, retrying");
                thread::sleep(policy.retry_interval);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Release a lock early. Closing the file releases it too.
pub fn release(file: &File) {
    if let Err(e) = FileExt::unlock(file) {
        tracing::warn!(error = %e, "failed to release file lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read_options() -> OpenOptions {
        let mut options = OpenOptions::new();
        options.read(true);
        options
    }

    #[test]
    fn test_shared_locks_coexist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta");
        File::create(&path).unwrap();

        let policy = LockPolicy {
            timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };

        let a = acquire(&path, &read_options(), LockMode::Shared, &policy).unwrap();
        let b = acquire(&path, &read_options(), LockMode::Shared, &policy).unwrap();
        drop((a, b));
    }

    #[test]
    fn test_exclusive_lock_times_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta");
        File::create(&path).unwrap();

        let policy = LockPolicy {
            retry_interval: Duration::from_millis(5),
            timeout: Some(Duration::from_millis(40)),
        };

        let _held = acquire(&path, &read_options(), LockMode::Exclusive, &policy).unwrap();
        let result = acquire(&path, &read_options(), LockMode::Shared, &policy);
        assert!(matches!(result, Err(StoreError::LockTimeout(p)) if p == path));
    }

    #[test]
    fn test_waiter_gets_lock_after_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta");
        File::create(&path).unwrap();

        let policy = LockPolicy {
            retry_interval: Duration::from_millis(5),
            timeout: Some(Duration::from_secs(5)),
        };

        let held = acquire(&path, &read_options(), LockMode::Exclusive, &policy).unwrap();

        let waiter = {
            let path = path.clone();
            let policy = policy.clone();
            thread::spawn(move || {
                acquire(&path, &read_options(), LockMode::Exclusive, &policy).is_ok()
            })
        };

        thread::sleep(Duration::from_millis(30));
        release(&held);
        drop(held);

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_missing_file_fails_fast() {
        let dir = TempDir::new().unwrap();
        let result = acquire(
            &dir.path().join("absent"),
            &read_options(),
            LockMode::Shared,
            &LockPolicy::default(),
        );
        assert!(matches!(result, Err(StoreError::Io(_))));
    }
}
