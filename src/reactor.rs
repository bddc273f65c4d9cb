//! Reactor collaborator contract and the fd/timer bindings built on it.
//!
//! The engine never runs an event loop of its own. The embedder implements
//! [`Reactor`], delivers readiness by calling `io_ready` on the socket, and
//! delivers timer expiry by calling the socket method the timer is
//! documented to drive (`timeout_expired`, `handshake_timeout_expired`).

use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

/// Interest/readiness bit-set for reactor registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFlags(u16);

impl EventFlags {
    /// No interest.
    pub const NONE: EventFlags = EventFlags(0);
    /// Readable interest/readiness.
    pub const READ: EventFlags = EventFlags(0x01);
    /// Writable interest/readiness.
    pub const WRITE: EventFlags = EventFlags(0x02);
    /// Registration persists across deliveries. Without it the registration
    /// is one-shot and consumed by the first delivery.
    pub const PERSIST: EventFlags = EventFlags(0x04);

    /// Whether every bit of `other` is set in `self`.
    #[inline]
    pub fn contains(self, other: EventFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set in `self`.
    #[inline]
    pub fn intersects(self, other: EventFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether no bits are set.
    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// `self` with the bits of `other` cleared.
    #[inline]
    pub fn without(self, other: EventFlags) -> EventFlags {
        EventFlags(self.0 & !other.0)
    }
}

impl std::ops::BitOr for EventFlags {
    type Output = EventFlags;
    #[inline]
    fn bitor(self, rhs: EventFlags) -> EventFlags {
        EventFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for EventFlags {
    #[inline]
    fn bitor_assign(&mut self, rhs: EventFlags) {
        self.0 |= rhs.0;
    }
}

/// Identifier for a scheduled one-shot timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// The event loop the socket is embedded in.
///
/// One loop per thread; a socket is affine to one reactor at a time. The
/// implementation demultiplexes fd readiness and calls `io_ready(events)` on
/// the owning socket, and fires scheduled timers by calling the socket
/// method each timer is bound to.
///
/// Contract notes:
/// - `register_io` on an already-registered fd replaces the interest set.
/// - `unregister_io` and `cancel_timer` are idempotent; cancelling a timer
///   that already fired is a no-op.
pub trait Reactor {
    /// Register (or re-register) interest in `flags` for `fd`.
    fn register_io(&self, fd: RawFd, flags: EventFlags) -> io::Result<()>;

    /// Drop any registration for `fd`.
    fn unregister_io(&self, fd: RawFd);

    /// Schedule a one-shot timer `delay_ms` from now.
    fn schedule_timer(&self, delay_ms: u32) -> TimerId;

    /// Cancel a previously scheduled timer.
    fn cancel_timer(&self, id: TimerId);

    /// Whether the caller is running on the loop's owning thread.
    fn in_loop_thread(&self) -> bool {
        true
    }
}

/// Owns the fd ↔ reactor registration for one socket.
pub(crate) struct IoHandler {
    reactor: Option<Rc<dyn Reactor>>,
    fd: RawFd,
    registered: bool,
}

impl IoHandler {
    pub(crate) fn new(reactor: Option<Rc<dyn Reactor>>, fd: RawFd) -> Self {
        IoHandler {
            reactor,
            fd,
            registered: false,
        }
    }

    /// Register interest. `flags` without [`EventFlags::PERSIST`] is a
    /// one-shot registration; the reactor consumes it on delivery and the
    /// socket calls [`IoHandler::set_unregistered`] to resynchronise.
    pub(crate) fn register_handler(&mut self, flags: EventFlags) -> io::Result<()> {
        let reactor = self
            .reactor
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket has no reactor"))?;
        reactor.register_io(self.fd, flags)?;
        self.registered = true;
        Ok(())
    }

    pub(crate) fn unregister_handler(&mut self) {
        if self.registered {
            if let Some(reactor) = &self.reactor {
                reactor.unregister_io(self.fd);
            }
            self.registered = false;
        }
    }

    /// A one-shot registration was consumed by delivery; no reactor call.
    pub(crate) fn set_unregistered(&mut self) {
        self.registered = false;
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered
    }

    /// Point the handler at a different fd. Only legal while unregistered.
    pub(crate) fn change_fd(&mut self, fd: RawFd) {
        debug_assert!(!self.registered, "change_fd on a registered handler");
        self.fd = fd;
    }

    pub(crate) fn attach(&mut self, reactor: Rc<dyn Reactor>) {
        debug_assert!(self.reactor.is_none());
        self.reactor = Some(reactor);
    }

    pub(crate) fn detach(&mut self) {
        debug_assert!(!self.registered, "detach with a live registration");
        self.reactor = None;
    }

    pub(crate) fn reactor(&self) -> Option<&Rc<dyn Reactor>> {
        self.reactor.as_ref()
    }
}

/// A one-shot timer slot bound to a socket method. Rescheduling cancels the
/// previous schedule (last scheduler wins).
pub(crate) struct Timeout {
    reactor: Option<Rc<dyn Reactor>>,
    scheduled: Option<TimerId>,
}

impl Timeout {
    pub(crate) fn new(reactor: Option<Rc<dyn Reactor>>) -> Self {
        Timeout {
            reactor,
            scheduled: None,
        }
    }

    /// Schedule (or reschedule) the timer. Returns false when no reactor is
    /// attached.
    pub(crate) fn schedule(&mut self, delay_ms: u32) -> bool {
        self.cancel();
        match &self.reactor {
            Some(reactor) => {
                self.scheduled = Some(reactor.schedule_timer(delay_ms));
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel(&mut self) {
        if let Some(id) = self.scheduled.take() {
            if let Some(reactor) = &self.reactor {
                reactor.cancel_timer(id);
            }
        }
    }

    /// The timer fired; forget the id without a cancel round-trip.
    pub(crate) fn note_fired(&mut self) {
        self.scheduled = None;
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        self.scheduled.is_some()
    }

    pub(crate) fn attach(&mut self, reactor: Rc<dyn Reactor>) {
        debug_assert!(self.reactor.is_none());
        self.reactor = Some(reactor);
    }

    pub(crate) fn detach(&mut self) {
        debug_assert!(!self.is_scheduled(), "detach with a scheduled timeout");
        self.reactor = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_algebra() {
        let rw = EventFlags::READ | EventFlags::WRITE;
        assert!(rw.contains(EventFlags::READ));
        assert!(rw.contains(EventFlags::WRITE));
        assert!(!rw.contains(EventFlags::PERSIST));
        assert!(rw.intersects(EventFlags::WRITE));
        assert_eq!(rw.without(EventFlags::WRITE), EventFlags::READ);
        assert!(EventFlags::NONE.is_empty());
        assert!(!EventFlags::NONE.intersects(rw));
    }

    #[test]
    fn without_clears_only_named_bits() {
        let all = EventFlags::READ | EventFlags::WRITE | EventFlags::PERSIST;
        assert_eq!(
            all.without(EventFlags::PERSIST),
            EventFlags::READ | EventFlags::WRITE
        );
    }
}
