//! The filesystem lock.
//!
//! The filesystem collaborator is not thread-safe, so every file operation the
//! kernel performs on behalf of a process (system calls, lazy loads, mmap
//! write-back during eviction) happens with this lock held.

use super::mutex::{Mutex, MutexGuard};
use crate::user_program::process::Tid;
use core::sync::atomic::{AtomicU32, Ordering};

const NO_HOLDER: u32 = 0;

pub struct FilesysLock {
    lock: Mutex<()>,
    // Holder's tid + 1, or NO_HOLDER.
    holder: AtomicU32,
}

/// Proof that the filesystem lock is held. Dropping it releases the lock, so
/// a system call that bails out early (including because the process is
/// being killed) can never leak it.
pub struct FilesysGuard<'a> {
    holder: &'a AtomicU32,
    _guard: MutexGuard<'a, ()>,
}

impl FilesysLock {
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            holder: AtomicU32::new(NO_HOLDER),
        }
    }

    pub fn acquire(&self, tid: Tid) -> FilesysGuard<'_> {
        debug_assert!(!self.held_by(tid), "filesys lock is not recursive");
        let guard = self.lock.lock();
        self.holder.store(u32::from(tid) + 1, Ordering::Release);
        FilesysGuard {
            holder: &self.holder,
            _guard: guard,
        }
    }

    /// Acquires the lock unless `tid` already holds it, in which case the
    /// caller is running inside that thread's critical section and `None` is
    /// returned.
    pub fn acquire_unless_held(&self, tid: Tid) -> Option<FilesysGuard<'_>> {
        if self.held_by(tid) {
            None
        } else {
            Some(self.acquire(tid))
        }
    }

    pub fn held_by(&self, tid: Tid) -> bool {
        self.holder.load(Ordering::Acquire) == u32::from(tid) + 1
    }
}

impl Default for FilesysLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FilesysGuard<'_> {
    fn drop(&mut self) {
        self.holder.store(NO_HOLDER, Ordering::Release);
    }
}
