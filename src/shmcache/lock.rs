//! Segment Lock
//!
//! Cross-process test-and-set lock living in the shared segment. The holder
//! records its pid so a waiter can take over a lock whose holder died.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use tracing::warn;

/// Spins before the first sleep
const SPIN_LIMIT: u32 = 1000;

/// Upper bound for the sleep between attempts
const MAX_SLEEP: Duration = Duration::from_millis(10);

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Lock word and holder pid as stored in the segment header
#[repr(C)]
#[derive(Default)]
pub struct LockWord {
    state: AtomicU32,
    holder: AtomicI32,
}

unsafe impl super::sheep::Shared for LockWord {}

impl LockWord {
    /// Acquire the lock on behalf of process `pid`
    pub fn lock(&self, pid: i32) -> SegmentGuard<'_> {
        let mut spins = 0u32;
        let mut sleep = Duration::from_micros(10);

        loop {
            if self
                .state
                .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.holder.store(pid, Ordering::Relaxed);
                return SegmentGuard { word: self };
            }

            if spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
                continue;
            }

            if self.reclaim_from_dead(pid) {
                return SegmentGuard { word: self };
            }
            thread::sleep(sleep);
            sleep = (sleep * 2).min(MAX_SLEEP);
        }
    }

    /// Take over a lock whose holder no longer exists
    fn reclaim_from_dead(&self, pid: i32) -> bool {
        let holder = self.holder.load(Ordering::Relaxed);
        // 0: holder not yet recorded
        if holder == 0 || holder == pid || process_alive(holder) {
            return false;
        }
        if self
            .holder
            .compare_exchange(holder, pid, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            warn!(dead_pid = holder, pid, "Reclaimed shared cache lock from dead holder");
            return true;
        }
        false
    }

    /// Pid of the current holder, 0 if unlocked
    pub fn holder(&self) -> i32 {
        if self.state.load(Ordering::Relaxed) == UNLOCKED {
            0
        } else {
            self.holder.load(Ordering::Relaxed)
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) == LOCKED
    }
}

/// Held segment lock; released on drop
pub struct SegmentGuard<'a> {
    word: &'a LockWord,
}

impl Drop for SegmentGuard<'_> {
    fn drop(&mut self) {
        self.word.holder.store(0, Ordering::Relaxed);
        self.word.state.store(UNLOCKED, Ordering::Release);
    }
}

/// True unless `pid` is known not to exist
#[cfg(unix)]
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks for existence and permission.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
pub fn process_alive(pid: i32) -> bool {
    pid > 0
}

/// Pid of the calling process
pub fn current_pid() -> i32 {
    std::process::id() as i32
}

// =============================================================================
// Tests
// =============================================================================
