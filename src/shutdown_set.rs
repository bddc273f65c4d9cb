//! Process-wide forced-shutdown registry.
//!
//! Sockets may register their fd here; a system-wide shutdown routine can
//! then force-close every registered fd atomically. A socket whose fd is
//! registered routes its own `close(2)` through the set so the close happens
//! exactly once whichever side gets there first.

use std::sync::atomic::{AtomicU8, Ordering};

const FD_FREE: u8 = 0;
const FD_IN_USE: u8 = 1;
const FD_SHUT_DOWN: u8 = 2;

/// Registry of fds that a process-wide shutdown can force-close.
///
/// Shared across threads behind an `Arc`; all state is per-fd atomics.
pub struct ShutdownSocketSet {
    states: Vec<AtomicU8>,
}

impl ShutdownSocketSet {
    /// Create a registry covering fds `0..max_fd`.
    pub fn new(max_fd: usize) -> Self {
        let mut states = Vec::with_capacity(max_fd);
        states.resize_with(max_fd, || AtomicU8::new(FD_FREE));
        ShutdownSocketSet { states }
    }

    /// Register an fd. No-op for fds beyond the registry's range.
    pub fn add(&self, fd: i32) {
        if let Some(slot) = self.slot(fd) {
            slot.store(FD_IN_USE, Ordering::Release);
        }
    }

    /// Deregister an fd without closing it (e.g. on `detach_fd`).
    pub fn remove(&self, fd: i32) {
        if let Some(slot) = self.slot(fd) {
            slot.store(FD_FREE, Ordering::Release);
        }
    }

    /// Close an fd through the registry. If a forced shutdown already closed
    /// it, only the slot is released.
    pub fn close(&self, fd: i32) {
        let Some(slot) = self.slot(fd) else {
            // Out-of-range fds are not tracked; close directly.
            unsafe { libc::close(fd) };
            return;
        };
        let prev = slot.swap(FD_FREE, Ordering::AcqRel);
        if prev != FD_SHUT_DOWN {
            unsafe { libc::close(fd) };
        }
    }

    /// Force-close every registered fd. Sockets that later call
    /// [`ShutdownSocketSet::close`] on a force-closed fd release the slot
    /// without a second `close(2)`.
    pub fn shutdown_all(&self) {
        for (fd, slot) in self.states.iter().enumerate() {
            let prev =
                slot.compare_exchange(FD_IN_USE, FD_SHUT_DOWN, Ordering::AcqRel, Ordering::Acquire);
            if prev.is_ok() {
                unsafe {
                    libc::shutdown(fd as i32, libc::SHUT_RDWR);
                    libc::close(fd as i32);
                }
            }
        }
    }

    /// Whether the fd is currently registered.
    pub fn is_registered(&self, fd: i32) -> bool {
        self.slot(fd)
            .map(|s| s.load(Ordering::Acquire) == FD_IN_USE)
            .unwrap_or(false)
    }

    fn slot(&self, fd: i32) -> Option<&AtomicU8> {
        if fd < 0 {
            return None;
        }
        self.states.get(fd as usize)
    }
}
