//! Cross-process update lock.
//!
//! Only one self-update may run at a time, across separate launches of the
//! tool. The lock lives in two sibling paths inside the lock directory:
//!
//! - `.update.lock.d`: a transient mutex directory. `mkdir` is atomic, so
//!   whoever creates it owns the right to replace the lock file. It is
//!   removed again right after.
//! - `.update.lock`: the steady-state lock, holding the owner's PID and
//!   creation time.
//!
//! A lock file whose PID is not a running process is stale. The next caller
//! re-reads it while holding the mutex directory and replaces it there, so
//! two contenders can never both reclaim the same stale lock. Losing the
//! mutex to a concurrent acquirer reports `Busy` instead of looping.
//!
//! The returned [`UpdateLockGuard`] removes the lock file when released or
//! dropped, so every early return and panic path releases it.
//!
//! # Examples
//!
//! ```rust,no_run
//! use multi_updater::lock::{LockAttempt, UpdateLock};
//!
//! # fn example() -> anyhow::Result<()> {
//! match UpdateLock::new("/opt/updater").try_acquire()? {
//!     LockAttempt::Acquired(guard) => {
//!         // ... update ...
//!         guard.release()?;
//!     }
//!     LockAttempt::Busy { holder } => eprintln!("update already running: {holder:?}"),
//! }
//! # Ok(())
//! # }
//! ```

use crate::constants::{LOCK_FILE_NAME, LOCK_MUTEX_STALE_AFTER};
use crate::utils::fs::{atomic_write, ensure_dir};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a lock file says about its holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateLockRecord {
    pub lock_dir_path: PathBuf,
    pub lock_file_path: PathBuf,
    pub holder_pid: Option<u32>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Outcome of [`UpdateLock::try_acquire`].
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(UpdateLockGuard),
    /// Someone else holds the lock. `holder` is `None` when the contender
    /// was caught mid-acquisition.
    Busy {
        holder: Option<u32>,
    },
}

/// Handle for acquiring the update lock in one directory.
#[derive(Debug, Clone)]
pub struct UpdateLock {
    lock_dir: PathBuf,
    pid: u32,
    mutex_stale_after: Duration,
}

impl UpdateLock {
    /// Lock in `lock_dir` on behalf of the current process.
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self::with_pid(lock_dir, std::process::id())
    }

    /// Lock on behalf of an arbitrary PID. Used to simulate other processes.
    pub fn with_pid(lock_dir: impl Into<PathBuf>, pid: u32) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            pid,
            mutex_stale_after: LOCK_MUTEX_STALE_AFTER,
        }
    }

    /// Age after which a leftover mutex directory is removed.
    #[must_use]
    pub const fn mutex_stale_after(mut self, age: Duration) -> Self {
        self.mutex_stale_after = age;
        self
    }

    #[must_use]
    pub fn lock_file_path(&self) -> PathBuf {
        self.lock_dir.join(LOCK_FILE_NAME)
    }

    #[must_use]
    pub fn mutex_dir_path(&self) -> PathBuf {
        self.lock_dir.join(format!("{LOCK_FILE_NAME}.d"))
    }

    /// Current lock file contents, if a lock file exists.
    pub fn read_record(&self) -> Result<Option<UpdateLockRecord>> {
        let path = self.lock_file_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read lock file {}", path.display()));
            }
        };

        let mut lines = content.lines();
        let holder_pid = lines.next().and_then(|l| l.trim().parse().ok());
        let created_at = lines
            .next()
            .and_then(|l| DateTime::parse_from_rfc3339(l.trim()).ok())
            .map(|t| t.with_timezone(&Utc));

        Ok(Some(UpdateLockRecord {
            lock_dir_path: self.lock_dir.clone(),
            lock_file_path: path,
            holder_pid,
            created_at,
        }))
    }

    /// Try once to take the lock, reclaiming a stale lock if there is one.
    pub fn try_acquire(&self) -> Result<LockAttempt> {
        ensure_dir(&self.lock_dir)?;

        if let Some(record) = self.read_record()?
            && record.holder_pid.is_some_and(process_alive)
        {
            debug!(target: "lock", "Update lock held by live pid {:?}", record.holder_pid);
            return Ok(LockAttempt::Busy {
                holder: record.holder_pid,
            });
        }

        let mutex = self.mutex_dir_path();
        match fs::create_dir(&mutex) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                self.clear_abandoned_mutex(&mutex);
                return Ok(LockAttempt::Busy {
                    holder: None,
                });
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to create lock directory {}", mutex.display()));
            }
        }

        let result = self.acquire_holding_mutex();

        if let Err(e) = fs::remove_dir(&mutex) {
            warn!(target: "lock", "Failed to remove lock directory {}: {}", mutex.display(), e);
        }
        result
    }

    /// Decide from the lock file as it is now. Only called while this
    /// process owns the mutex directory, so nobody else writes or reclaims
    /// the lock file in between.
    fn acquire_holding_mutex(&self) -> Result<LockAttempt> {
        if let Some(record) = self.read_record()? {
            if record.holder_pid.is_some_and(process_alive) {
                return Ok(LockAttempt::Busy {
                    holder: record.holder_pid,
                });
            }
            info!(target: "lock", "Removing stale update lock (pid {:?})", record.holder_pid);
            match fs::remove_file(&record.lock_file_path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to remove stale lock {}", record.lock_file_path.display())
                    });
                }
            }
        }

        self.write_lock_file()?;
        Ok(LockAttempt::Acquired(UpdateLockGuard {
            lock_file_path: self.lock_file_path(),
            pid: self.pid,
            released: false,
        }))
    }

    fn write_lock_file(&self) -> Result<()> {
        let content = format!("{}\n{}\n", self.pid, Utc::now().to_rfc3339());
        atomic_write(&self.lock_file_path(), content.as_bytes())
            .context("Failed to write update lock file")?;
        debug!(target: "lock", "Update lock acquired by pid {}", self.pid);
        Ok(())
    }

    /// A mutex directory that outlived the acquisition window belongs to a
    /// process that crashed between mkdir and rmdir.
    fn clear_abandoned_mutex(&self, mutex: &Path) {
        let age = fs::metadata(mutex)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok());
        if age.is_some_and(|age| age >= self.mutex_stale_after) {
            info!(target: "lock", "Removing abandoned lock directory {}", mutex.display());
            if let Err(e) = fs::remove_dir(mutex) {
                debug!(target: "lock", "Could not remove abandoned lock directory: {}", e);
            }
        }
    }
}

/// Proof of holding the update lock.
#[derive(Debug)]
pub struct UpdateLockGuard {
    lock_file_path: PathBuf,
    pid: u32,
    released: bool,
}

impl UpdateLockGuard {
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub fn lock_file_path(&self) -> &Path {
        &self.lock_file_path
    }

    /// Remove the lock file now.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        remove_lock_file(&self.lock_file_path)
    }
}

impl Drop for UpdateLockGuard {
    fn drop(&mut self) {
        if !self.released
            && let Err(e) = remove_lock_file(&self.lock_file_path)
        {
            warn!(target: "lock", "{:#}", e);
        }
    }
}

fn remove_lock_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(target: "lock", "Update lock released");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove lock file {}", path.display())),
    }
}

/// Whether `pid` names a running process.
///
/// `kill(pid, 0)` delivers no signal; `EPERM` means the process exists but
/// belongs to another user.
#[cfg(unix)]
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Without a portable liveness check every recorded holder counts as alive.
#[cfg(not(unix))]
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    pid != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn acquired(attempt: LockAttempt) -> UpdateLockGuard {
        match attempt {
            LockAttempt::Acquired(guard) => guard,
            LockAttempt::Busy {
                holder,
            } => panic!("expected lock, busy with {holder:?}"),
        }
    }

    #[test]
    fn test_acquire_writes_pid_and_release_removes() {
        let dir = TempDir::new().unwrap();
        let lock = UpdateLock::new(dir.path());

        let guard = acquired(lock.try_acquire().unwrap());
        let record = lock.read_record().unwrap().unwrap();
        assert_eq!(record.holder_pid, Some(std::process::id()));
        assert!(record.created_at.is_some());
        assert!(!lock.mutex_dir_path().exists());

        guard.release().unwrap();
        assert!(!lock.lock_file_path().exists());
    }

    #[test]
    fn test_live_holder_means_busy() {
        let dir = TempDir::new().unwrap();
        let _guard = acquired(UpdateLock::new(dir.path()).try_acquire().unwrap());

        match UpdateLock::with_pid(dir.path(), 1).try_acquire().unwrap() {
            LockAttempt::Busy {
                holder,
            } => assert_eq!(holder, Some(std::process::id())),
            LockAttempt::Acquired(_) => panic!("lock acquired twice"),
        }
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(LOCK_FILE_NAME), "999999\n").unwrap();

        let lock = UpdateLock::new(dir.path());
        let guard = acquired(lock.try_acquire().unwrap());
        assert_eq!(lock.read_record().unwrap().unwrap().holder_pid, Some(std::process::id()));
        drop(guard);
        assert!(!lock.lock_file_path().exists());
    }

    #[test]
    fn test_corrupt_lock_file_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(LOCK_FILE_NAME), "not a pid").unwrap();

        let _guard = acquired(UpdateLock::new(dir.path()).try_acquire().unwrap());
    }

    #[test]
    fn test_fresh_mutex_dir_means_busy() {
        let dir = TempDir::new().unwrap();
        let lock = UpdateLock::new(dir.path());
        std::fs::create_dir(lock.mutex_dir_path()).unwrap();

        assert!(matches!(
            lock.try_acquire().unwrap(),
            LockAttempt::Busy {
                holder: None
            }
        ));
        assert!(lock.mutex_dir_path().exists());
    }

    #[test]
    fn test_abandoned_mutex_dir_is_cleared() {
        let dir = TempDir::new().unwrap();
        let lock = UpdateLock::new(dir.path()).mutex_stale_after(Duration::ZERO);
        std::fs::create_dir(lock.mutex_dir_path()).unwrap();

        // First call clears it, second succeeds
        assert!(matches!(lock.try_acquire().unwrap(), LockAttempt::Busy { .. }));
        let _guard = acquired(lock.try_acquire().unwrap());
    }

    #[test]
    fn test_concurrent_acquirers_never_both_succeed() {
        let dir = TempDir::new().unwrap();
        let contenders = 8;
        let barrier = Arc::new(Barrier::new(contenders));
        let done = Arc::new(Barrier::new(contenders));

        let handles: Vec<_> = (0..contenders)
            .map(|_| {
                let path = dir.path().to_path_buf();
                let barrier = Arc::clone(&barrier);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    let lock = UpdateLock::new(path);
                    barrier.wait();
                    let attempt = lock.try_acquire().unwrap();
                    let won = matches!(attempt, LockAttempt::Acquired(_));
                    // Hold any guard until everyone has tried
                    done.wait();
                    drop(attempt);
                    won
                })
            })
            .collect();

        let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|w| *w).count();
        assert!(winners <= 1, "{winners} contenders acquired the lock");
    }

    #[test]
    fn test_concurrent_reclaim_of_stale_lock_has_one_winner() {
        for _ in 0..20 {
            let dir = TempDir::new().unwrap();
            std::fs::write(dir.path().join(LOCK_FILE_NAME), "999999\n").unwrap();
            let contenders = 6;
            let barrier = Arc::new(Barrier::new(contenders));
            let done = Arc::new(Barrier::new(contenders));

            let handles: Vec<_> = (0..contenders)
                .map(|_| {
                    let path = dir.path().to_path_buf();
                    let barrier = Arc::clone(&barrier);
                    let done = Arc::clone(&done);
                    std::thread::spawn(move || {
                        let lock = UpdateLock::new(path);
                        barrier.wait();
                        let attempt = lock.try_acquire().unwrap();
                        let won = matches!(attempt, LockAttempt::Acquired(_));
                        let lock_file_kept = !won || lock.lock_file_path().exists();
                        done.wait();
                        drop(attempt);
                        (won, lock_file_kept)
                    })
                })
                .collect();

            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            let winners = results.iter().filter(|(won, _)| *won).count();
            assert_eq!(winners, 1, "{winners} contenders reclaimed the stale lock");
            assert!(results.iter().all(|(_, kept)| *kept));
            assert!(!dir.path().join(format!("{LOCK_FILE_NAME}.d")).exists());
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_process_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(0));
        assert!(!process_alive(u32::MAX));
    }
}
