//! Plain-TCP async socket: state machine, read/write loops, failure paths.
//!
//! The socket performs partial I/O against a non-blocking fd and returns to
//! the reactor whenever the kernel would block. All callback invocations
//! happen with internal state already consistent, and every loop re-checks
//! the reactor binding and callback installation after a callback returns —
//! a callback may have closed the socket, moved it to another reactor, or
//! swapped itself out.

use std::cell::Cell;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::callback::{ConnectCallback, ReadCallback, WriteCallback};
use crate::chain::BufferChain;
use crate::error::SocketError;
use crate::metrics;
use crate::reactor::{EventFlags, IoHandler, Reactor, Timeout};
use crate::shutdown_set::ShutdownSocketSet;
use crate::write_queue::{WriteFlags, WriteQueue, WriteRequest};

/// Iovec count handed to a single `sendmsg`. Linux UIO_MAXIOV.
const IOV_MAX: usize = 1024;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Fresh socket, no fd yet.
    Uninit,
    /// `connect(2)` issued, completion pending.
    Connecting,
    /// Connected and usable.
    Established,
    /// Cleanly closed.
    Closed,
    /// Torn down by a failure.
    Error,
}

/// Monotone shutdown bit-set: once a bit is set it never clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownFlags(u8);

impl ShutdownFlags {
    /// Reads are shut down (peer EOF seen, or close requested).
    pub const READ_SHUT: ShutdownFlags = ShutdownFlags(0x01);
    /// Writes are shut down.
    pub const WRITE_SHUT: ShutdownFlags = ShutdownFlags(0x02);
    /// Writes will be shut down once the pending queue drains.
    pub const WRITE_PENDING: ShutdownFlags = ShutdownFlags(0x04);

    /// Whether every bit of `other` is set.
    #[inline]
    pub fn contains(self, other: ShutdownFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set.
    #[inline]
    pub fn intersects(self, other: ShutdownFlags) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub(crate) fn insert(&mut self, other: ShutdownFlags) {
        self.0 |= other.0;
    }

    /// Whether no bit is set.
    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for ShutdownFlags {
    type Output = ShutdownFlags;
    #[inline]
    fn bitor(self, rhs: ShutdownFlags) -> ShutdownFlags {
        ShutdownFlags(self.0 | rhs.0)
    }
}

/// One socket option applied between `socket(2)` and `connect(2)`.
#[derive(Debug, Clone, Copy)]
pub struct SocketOption {
    /// `setsockopt` level.
    pub level: i32,
    /// `setsockopt` option name.
    pub name: i32,
    /// Option value.
    pub value: i32,
}

impl SocketOption {
    /// Build an option entry.
    pub fn new(level: i32, name: i32, value: i32) -> Self {
        SocketOption { level, name, value }
    }

    fn apply(&self, fd: RawFd) -> Result<(), i32> {
        let rv = unsafe {
            libc::setsockopt(
                fd,
                self.level,
                self.name,
                &self.value as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rv != 0 {
            return Err(last_errno());
        }
        Ok(())
    }
}

/// The operations surface shared by [`AsyncSocket`] and
/// [`AsyncSslSocket`](crate::ssl_socket::AsyncSslSocket).
///
/// Callbacks receive the transport through this trait, so code written
/// against it works identically over plain TCP and TLS.
pub trait AsyncTransport {
    /// Send one buffer. The bytes are copied; the caller may reuse `buf`.
    fn write(&mut self, callback: Option<Rc<dyn WriteCallback>>, buf: &[u8], flags: WriteFlags);

    /// Send several buffers as one submission. The bytes are copied.
    fn writev(&mut self, callback: Option<Rc<dyn WriteCallback>>, bufs: &[&[u8]], flags: WriteFlags);

    /// Send an owned buffer chain without copying.
    fn write_chain(
        &mut self,
        callback: Option<Rc<dyn WriteCallback>>,
        chain: BufferChain,
        flags: WriteFlags,
    );

    /// Install or clear the read callback.
    fn set_read_callback(&mut self, callback: Option<Rc<dyn ReadCallback>>);

    /// Close once pending writes drain; immediate close otherwise.
    fn close(&mut self);

    /// Close immediately, failing pending operations.
    fn close_now(&mut self);

    /// Close immediately with a TCP reset.
    fn close_with_reset(&mut self);

    /// Shut down writes once pending writes drain.
    fn shutdown_write(&mut self);

    /// Shut down writes immediately, failing pending writes.
    fn shutdown_write_now(&mut self);

    /// Open and without any shutdown latch.
    fn good(&self) -> bool;

    /// In the error state.
    fn error(&self) -> bool;

    /// Connect still in progress.
    fn connecting(&self) -> bool;

    /// Non-blocking poll: data available to read.
    fn readable(&self) -> bool;

    /// Non-blocking poll: peer hung up.
    fn hangup(&self) -> bool;

    /// Local address, when the fd is open.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Peer address; resolved lazily and cached.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Application bytes handed to the kernel (plaintext for TLS).
    fn app_bytes_written(&self) -> u64;

    /// Application bytes delivered to the read callback.
    fn app_bytes_received(&self) -> u64;

    /// Set the write/connect timeout in milliseconds; 0 disables.
    fn set_send_timeout(&mut self, ms: u32);

    /// Move the socket onto a reactor. Legal only while detached.
    fn attach_reactor(&mut self, reactor: Rc<dyn Reactor>);

    /// Detach from the current reactor. Legal only when
    /// [`AsyncTransport::is_detachable`].
    fn detach_reactor(&mut self);

    /// No registration and no scheduled timeout.
    fn is_detachable(&self) -> bool;
}

/// Outcome of one non-blocking wire read.
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    /// `n > 0` bytes appended to the buffer.
    Data(usize),
    /// Kernel has nothing; wait for readiness.
    Blocked,
    /// Orderly EOF from the peer.
    Eof,
    /// recv failed with this errno.
    Err(i32),
}

/// Prefix-progress of one `sendmsg` over an op slice.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WriteProgress {
    /// Total bytes accepted by the kernel.
    pub total: usize,
    /// Ops fully written.
    pub full_ops: usize,
    /// Bytes written into the first unfinished op.
    pub partial_bytes: usize,
}

/// An event-driven, non-blocking TCP socket affine to one reactor.
pub struct AsyncSocket {
    fd: RawFd,
    state: SocketState,
    shutdown_flags: ShutdownFlags,
    event_flags: EventFlags,
    io_handler: IoHandler,
    write_timeout: Timeout,
    /// Bumped on every attach/detach; loops snapshot it to detect that a
    /// callback moved the socket to another reactor.
    loop_generation: u64,
    connect_callback: Option<Rc<dyn ConnectCallback>>,
    read_callback: Option<Rc<dyn ReadCallback>>,
    write_queue: WriteQueue,
    send_timeout_ms: u32,
    max_reads_per_event: u16,
    app_bytes_written: u64,
    app_bytes_received: u64,
    peer_addr: Cell<Option<SocketAddr>>,
    shutdown_set: Option<Arc<ShutdownSocketSet>>,
}

impl AsyncSocket {
    /// A fresh, unconnected socket.
    pub fn new(reactor: Option<Rc<dyn Reactor>>) -> Self {
        AsyncSocket {
            fd: -1,
            state: SocketState::Uninit,
            shutdown_flags: ShutdownFlags::default(),
            event_flags: EventFlags::NONE,
            io_handler: IoHandler::new(reactor.clone(), -1),
            write_timeout: Timeout::new(reactor),
            loop_generation: 0,
            connect_callback: None,
            read_callback: None,
            write_queue: WriteQueue::new(),
            send_timeout_ms: 0,
            max_reads_per_event: 0,
            app_bytes_written: 0,
            app_bytes_received: 0,
            peer_addr: Cell::new(None),
            shutdown_set: None,
        }
    }

    /// Adopt an already-connected fd. The fd must be non-blocking; socket
    /// options on it are left untouched.
    pub fn from_fd(reactor: Option<Rc<dyn Reactor>>, fd: RawFd) -> Self {
        let mut sock = AsyncSocket::new(reactor);
        sock.io_handler.change_fd(fd);
        sock.fd = fd;
        sock.state = SocketState::Established;
        sock
    }

    /// The underlying fd, `-1` when none.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SocketState {
        self.state
    }

    /// Current shutdown bits.
    pub fn shutdown_flags(&self) -> ShutdownFlags {
        self.shutdown_flags
    }

    /// Cap on read-loop iterations per readiness event; 0 = unbounded.
    pub fn set_max_reads_per_event(&mut self, max: u16) {
        self.max_reads_per_event = max;
    }

    /// Register the socket's fd with a process-wide shutdown registry.
    pub fn set_shutdown_socket_set(&mut self, set: Option<Arc<ShutdownSocketSet>>) {
        if let (Some(old), true) = (&self.shutdown_set, self.fd != -1) {
            old.remove(self.fd);
        }
        self.shutdown_set = set;
        if let (Some(new), true) = (&self.shutdown_set, self.fd != -1) {
            new.add(self.fd);
        }
    }

    /// The installed read callback, if any.
    pub fn read_callback(&self) -> Option<Rc<dyn ReadCallback>> {
        self.read_callback.clone()
    }

    // ── Connect ─────────────────────────────────────────────────────

    /// Begin a non-blocking connect. Fails with `AlreadyOpen` unless the
    /// socket is uninitialised.
    pub fn connect(
        &mut self,
        callback: Option<Rc<dyn ConnectCallback>>,
        addr: SocketAddr,
        timeout_ms: u32,
        options: &[SocketOption],
        bind_addr: Option<SocketAddr>,
    ) {
        self.assert_in_loop_thread();
        self.peer_addr.set(Some(addr));

        if self.state != SocketState::Uninit {
            return self.invalid_state_connect(callback);
        }
        debug_assert!(self.fd == -1);
        self.state = SocketState::Connecting;
        self.connect_callback = callback;
        metrics::CONNECTS_ATTEMPTED.increment();

        match self.open_and_connect(addr, options, bind_addr) {
            Ok(true) => {
                // Connection in progress: one-shot write readiness, plus a
                // connect timeout when requested.
                if timeout_ms > 0 && !self.write_timeout.schedule(timeout_ms) {
                    return self
                        .fail_connect(self.addr_err_internal("failed to schedule connect timeout"));
                }
                debug_assert!(self.event_flags.is_empty());
                self.event_flags = EventFlags::WRITE;
                if self.io_handler.register_handler(EventFlags::WRITE).is_err() {
                    return self
                        .fail_connect(self.addr_err_internal("failed to register connect handler"));
                }
            }
            Ok(false) => {
                // Immediate success. Nothing can be registered yet: the read
                // callback and writes arrive after connect() returns.
                debug_assert!(self.read_callback.is_none());
                debug_assert!(self.write_queue.is_empty());
                self.state = SocketState::Established;
                if let Some(cb) = self.connect_callback.take() {
                    cb.connect_success(self);
                }
            }
            Err(ex) => return self.fail_connect(ex),
        }
    }

    /// Convenience connect without options or a bind address.
    pub fn connect_addr(
        &mut self,
        callback: Option<Rc<dyn ConnectCallback>>,
        addr: SocketAddr,
        timeout_ms: u32,
    ) {
        self.connect(callback, addr, timeout_ms, &[], None);
    }

    /// fd creation through `connect(2)`. `Ok(true)` means in progress.
    fn open_and_connect(
        &mut self,
        addr: SocketAddr,
        options: &[SocketOption],
        bind_addr: Option<SocketAddr>,
    ) -> Result<bool, SocketError> {
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = unsafe {
            libc::socket(
                family,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(self.addr_err_internal_errno("failed to create socket", last_errno()));
        }
        self.fd = fd;
        if let Some(set) = &self.shutdown_set {
            set.add(fd);
        }
        self.io_handler.change_fd(fd);

        // TCP_NODELAY by default; a failure here is not fatal.
        let _ = self.set_no_delay(true);

        if let Some(bind_addr) = bind_addr {
            let one: libc::c_int = 1;
            let rv = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_REUSEADDR,
                    &one as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rv != 0 {
                return Err(SocketError::not_open(format!(
                    "failed to setsockopt prior to bind on {bind_addr} (errno {})",
                    last_errno()
                )));
            }
            let (storage, len) = socket_addr_to_storage(&bind_addr);
            let rv = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
            if rv != 0 {
                return Err(SocketError::not_open(format!(
                    "failed to bind to async socket: {bind_addr} (errno {})",
                    last_errno()
                )));
            }
        }

        for opt in options {
            if let Err(errno) = opt.apply(fd) {
                return Err(self.addr_err_internal_errno("failed to set socket option", errno));
            }
        }

        let (storage, len) = socket_addr_to_storage(&addr);
        let rv = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if rv < 0 {
            let errno = last_errno();
            if errno == libc::EINPROGRESS {
                return Ok(true);
            }
            return Err(SocketError::not_open(format!(
                "connect failed (immediately) (errno {errno})"
            )));
        }
        Ok(false)
    }

    // ── Read callback ───────────────────────────────────────────────

    /// Install or clear the read callback.
    ///
    /// Legal while connecting (stored, applied on completion) or
    /// established. After reads are shut down only `None` is accepted; any
    /// other argument fails through `invalid_state`.
    pub fn set_read_callback(&mut self, callback: Option<Rc<dyn ReadCallback>>) {
        // Short-circuit when unchanged; this also allows clearing after the
        // socket detached during cleanup.
        let same = match (&self.read_callback, &callback) {
            (None, None) => true,
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            _ => false,
        };
        if same {
            return;
        }

        if self.shutdown_flags.contains(ShutdownFlags::READ_SHUT) {
            // Reads already shut down: permit clearing only.
            if let Some(cb) = callback {
                return self.invalid_state_read(Some(cb));
            }
            debug_assert!(!self.event_flags.contains(EventFlags::READ));
            self.read_callback = None;
            return;
        }

        self.assert_in_loop_thread();
        match self.state {
            SocketState::Connecting => {
                // Stored now, read events registered once connected.
                self.read_callback = callback;
            }
            SocketState::Established => {
                self.read_callback = callback;
                let enable = if self.read_callback.is_some() {
                    (EventFlags::READ, EventFlags::NONE)
                } else {
                    (EventFlags::NONE, EventFlags::READ)
                };
                if !self.update_event_registration(enable.0, enable.1) {
                    return;
                }
                if self.read_callback.is_some() {
                    self.check_for_immediate_read();
                }
            }
            SocketState::Closed | SocketState::Error | SocketState::Uninit => {
                self.invalid_state_read(callback);
            }
        }
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Send one buffer; the bytes are copied on submission.
    pub fn write(
        &mut self,
        callback: Option<Rc<dyn WriteCallback>>,
        buf: &[u8],
        flags: WriteFlags,
    ) {
        let ops = if buf.is_empty() {
            Vec::new()
        } else {
            vec![Bytes::copy_from_slice(buf)]
        };
        self.write_impl(callback, ops, flags);
    }

    /// Send several buffers as one ordered submission; bytes are copied.
    pub fn writev(
        &mut self,
        callback: Option<Rc<dyn WriteCallback>>,
        bufs: &[&[u8]],
        flags: WriteFlags,
    ) {
        let ops = bufs
            .iter()
            .filter(|b| !b.is_empty())
            .map(|b| Bytes::copy_from_slice(b))
            .collect();
        self.write_impl(callback, ops, flags);
    }

    /// Send an owned buffer chain without copying.
    pub fn write_chain(
        &mut self,
        callback: Option<Rc<dyn WriteCallback>>,
        chain: BufferChain,
        flags: WriteFlags,
    ) {
        self.write_impl(callback, chain.into_ops(), flags);
    }

    pub(crate) fn write_impl(
        &mut self,
        callback: Option<Rc<dyn WriteCallback>>,
        ops: Vec<Bytes>,
        flags: WriteFlags,
    ) {
        self.assert_in_loop_thread();

        if self.writes_barred() {
            // A write after shutdown is a caller bug: fail the whole socket
            // rather than limping on.
            return self.invalid_state_write(callback);
        }

        let mut progress = WriteProgress::default();
        let mut attempted = false;
        if self.state == SocketState::Established {
            if self.write_queue.is_empty() {
                // Established with nothing queued: try the wire right away.
                // An empty submission (no bytes at all) completes here too.
                debug_assert!(!self.event_flags.contains(EventFlags::WRITE));
                if ops.is_empty() {
                    if let Some(cb) = callback {
                        cb.write_success(self);
                    }
                    return;
                }
                match wire_writev(self.fd, &ops, flags) {
                    Err(errno) => {
                        let ex = self.addr_err_internal_errno("writev failed", errno);
                        return self.fail_write_unqueued(callback, 0, ex);
                    }
                    Ok(p) => {
                        self.note_app_bytes_written(p.total as u64);
                        if p.full_ops == ops.len() {
                            if let Some(cb) = callback {
                                cb.write_success(self);
                            }
                            return;
                        }
                        progress = p;
                        attempted = true;
                    }
                }
            }
        } else if self.state != SocketState::Connecting {
            return self.invalid_state_write(callback);
        }

        // Queue the remainder (or, while connecting / behind other pending
        // writes, the whole submission — empty ones included, so completion
        // order stays FIFO).

        let mut req = WriteRequest::new(callback, ops, flags);
        if progress.total > 0 || progress.partial_bytes > 0 || progress.full_ops > 0 {
            req.consume(progress.full_ops, progress.partial_bytes, progress.total);
        }
        self.write_queue.push(req);
        metrics::WRITES_QUEUED.increment();

        if attempted {
            debug_assert!(self.state == SocketState::Established);
            if !self.update_event_registration(EventFlags::WRITE, EventFlags::NONE) {
                return;
            }
            if self.send_timeout_ms > 0 && !self.write_timeout.schedule(self.send_timeout_ms) {
                let ex = self.addr_err_internal("failed to schedule send timeout");
                return self.fail_write_head(ex);
            }
        }
    }

    // ── Close / shutdown ────────────────────────────────────────────

    /// Close the socket. With writes pending on a live connection the real
    /// teardown is deferred until the queue drains; reads are shut down now
    /// and an installed read callback receives a synthetic EOF.
    pub fn close(&mut self) {
        // The queue can be non-empty in Closed/Error if close() re-enters
        // from a write-error callback while teardown is still draining it.
        if self.write_queue.is_empty()
            || !matches!(
                self.state,
                SocketState::Connecting | SocketState::Established
            )
        {
            return self.close_now();
        }

        self.assert_in_loop_thread();
        self.shutdown_flags
            .insert(ShutdownFlags::READ_SHUT | ShutdownFlags::WRITE_PENDING);

        if self.read_callback.is_some() {
            if !self.update_event_registration(EventFlags::NONE, EventFlags::READ) {
                // Failure path ran; callbacks are already cleaned up.
                debug_assert!(self.state == SocketState::Error);
                debug_assert!(self.read_callback.is_none());
                return;
            }
            let cb = self.read_callback.take().expect("checked above");
            cb.read_eof(self);
        }
    }

    /// Close immediately: cancel timers and registration, close the fd, and
    /// fail pending callbacks with "socket closed locally". Re-entrant-safe.
    pub fn close_now(&mut self) {
        self.assert_in_loop_thread();
        match self.state {
            SocketState::Closed | SocketState::Error => {
                // Possibly re-entered from a callback of an outer close that
                // is still unwinding. Nothing left to do.
            }
            SocketState::Uninit | SocketState::Connecting | SocketState::Established => {
                self.shutdown_flags
                    .insert(ShutdownFlags::READ_SHUT | ShutdownFlags::WRITE_SHUT);
                self.state = SocketState::Closed;
                self.write_timeout.cancel();

                if !self.event_flags.is_empty() {
                    self.event_flags = EventFlags::NONE;
                    self.io_handler.unregister_handler();
                }
                if self.fd >= 0 {
                    self.io_handler.change_fd(-1);
                    self.do_close();
                }

                if let Some(cb) = self.connect_callback.take() {
                    cb.connect_error(self, closed_locally());
                }
                self.fail_all_writes(&closed_locally());
                if let Some(cb) = self.read_callback.take() {
                    cb.read_eof(self);
                }
            }
        }
    }

    /// Arrange a TCP RST on close, then close immediately.
    pub fn close_with_reset(&mut self) {
        if self.fd >= 0 {
            let opt = libc::linger {
                l_onoff: 1,
                l_linger: 0,
            };
            // Failure only degrades the RST into a normal close.
            unsafe {
                libc::setsockopt(
                    self.fd,
                    libc::SOL_SOCKET,
                    libc::SO_LINGER,
                    &opt as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::linger>() as libc::socklen_t,
                );
            }
        }
        self.close_now();
    }

    /// Shut down writes once the pending queue drains.
    pub fn shutdown_write(&mut self) {
        if self.write_queue.is_empty() {
            return self.shutdown_write_now();
        }
        self.assert_in_loop_thread();
        self.shutdown_flags.insert(ShutdownFlags::WRITE_PENDING);
    }

    /// Shut down writes immediately, failing everything queued.
    pub fn shutdown_write_now(&mut self) {
        if self.shutdown_flags.contains(ShutdownFlags::WRITE_SHUT) {
            return;
        }
        if self.shutdown_flags.contains(ShutdownFlags::READ_SHUT) {
            // close() already ran with writes pending; finishing the write
            // side means finishing the close.
            return self.close_now();
        }
        self.assert_in_loop_thread();

        match self.state {
            SocketState::Established => {
                self.shutdown_flags.insert(ShutdownFlags::WRITE_SHUT);
                self.write_timeout.cancel();
                if !self.update_event_registration(EventFlags::NONE, EventFlags::WRITE) {
                    debug_assert!(self.state == SocketState::Error);
                    return;
                }
                unsafe {
                    libc::shutdown(self.fd, libc::SHUT_WR);
                }
                self.fail_all_writes(&shutdown_for_writes());
            }
            SocketState::Connecting => {
                // Latch the shutdown; the connect completion performs it.
                self.shutdown_flags.insert(ShutdownFlags::WRITE_PENDING);
                self.fail_all_writes(&shutdown_for_writes());
            }
            SocketState::Uninit => {
                // Arm the latch for whenever the socket eventually connects.
                self.shutdown_flags.insert(ShutdownFlags::WRITE_PENDING);
            }
            SocketState::Closed | SocketState::Error => {
                debug_assert!(false, "WRITE_SHUT must be set in Closed/Error");
            }
        }
    }

    /// Surrender the fd. Pending callbacks fail as for `close_now`, but the
    /// fd itself is left open and returned.
    pub fn detach_fd(&mut self) -> RawFd {
        if let (Some(set), true) = (&self.shutdown_set, self.fd >= 0) {
            set.remove(self.fd);
        }
        // Clear fd first so close_now() leaves the descriptor open.
        let fd = self.fd;
        let was_registered = self.io_handler.is_registered();
        if was_registered {
            self.io_handler.unregister_handler();
        }
        self.fd = -1;
        self.io_handler.change_fd(-1);
        self.close_now();
        fd
    }

    // ── Reactor binding ─────────────────────────────────────────────

    /// Move the socket onto a reactor. Legal only while detached.
    pub fn attach_reactor(&mut self, reactor: Rc<dyn Reactor>) {
        self.loop_generation += 1;
        self.io_handler.attach(reactor.clone());
        self.write_timeout.attach(reactor);
    }

    /// Detach from the current reactor. Legal only when `is_detachable()`.
    pub fn detach_reactor(&mut self) {
        debug_assert!(self.is_detachable());
        self.loop_generation += 1;
        self.io_handler.detach();
        self.write_timeout.detach();
    }

    /// Whether the socket currently holds no registration and no timeout.
    pub fn is_detachable(&self) -> bool {
        !self.io_handler.is_registered() && !self.write_timeout.is_scheduled()
    }

    // ── Probes ──────────────────────────────────────────────────────

    /// Non-blocking poll for readable data.
    pub fn readable(&self) -> bool {
        if self.fd == -1 {
            return false;
        }
        let mut fds = [libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        }];
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, 0) };
        rc == 1
    }

    /// Non-blocking poll for peer hangup.
    pub fn hangup(&self) -> bool {
        if self.fd == -1 {
            debug_assert!(false, "hangup() on a socket without an fd");
            return false;
        }
        let mut fds = [libc::pollfd {
            fd: self.fd,
            events: libc::POLLRDHUP | libc::POLLHUP,
            revents: 0,
        }];
        unsafe { libc::poll(fds.as_mut_ptr(), 1, 0) };
        fds[0].revents & (libc::POLLRDHUP | libc::POLLHUP) != 0
    }

    /// Open, with no shutdown latch set, and attached to a reactor.
    pub fn good(&self) -> bool {
        matches!(
            self.state,
            SocketState::Connecting | SocketState::Established
        ) && self.shutdown_flags.is_empty()
            && self.io_handler.reactor().is_some()
    }

    /// Whether the socket failed.
    pub fn error(&self) -> bool {
        self.state == SocketState::Error
    }

    /// Whether a connect is still in flight.
    pub fn connecting(&self) -> bool {
        self.state == SocketState::Connecting
    }

    /// Local address of the fd.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        if self.fd == -1 {
            return None;
        }
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rv = unsafe {
            libc::getsockname(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if rv != 0 {
            return None;
        }
        sockaddr_to_socket_addr(&storage)
    }

    /// Peer address; resolved lazily from the fd and cached.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        if let Some(addr) = self.peer_addr.get() {
            return Some(addr);
        }
        if self.fd == -1 {
            return None;
        }
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rv = unsafe {
            libc::getpeername(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if rv != 0 {
            return None;
        }
        let addr = sockaddr_to_socket_addr(&storage);
        self.peer_addr.set(addr);
        addr
    }

    /// Application bytes handed to the kernel.
    pub fn app_bytes_written(&self) -> u64 {
        self.app_bytes_written
    }

    /// Application bytes delivered to the read callback.
    pub fn app_bytes_received(&self) -> u64 {
        self.app_bytes_received
    }

    // ── Socket options ──────────────────────────────────────────────

    /// Set the write/connect timeout; applies immediately when writes are
    /// already pending.
    pub fn set_send_timeout(&mut self, ms: u32) {
        self.send_timeout_ms = ms;
        if self.event_flags.contains(EventFlags::WRITE) && self.state == SocketState::Established {
            debug_assert!(!self.shutdown_flags.contains(ShutdownFlags::WRITE_SHUT));
            if ms > 0 {
                if !self.write_timeout.schedule(ms) {
                    let ex = self.addr_err_internal("failed to reschedule send timeout");
                    self.fail_write_head(ex);
                }
            } else {
                self.write_timeout.cancel();
            }
        }
    }

    /// Toggle `TCP_NODELAY`.
    pub fn set_no_delay(&mut self, no_delay: bool) -> Result<(), i32> {
        SocketOption::new(libc::IPPROTO_TCP, libc::TCP_NODELAY, no_delay as i32).apply_checked(self.fd)
    }

    /// Toggle `TCP_QUICKACK`.
    pub fn set_quick_ack(&mut self, quick_ack: bool) -> Result<(), i32> {
        SocketOption::new(libc::IPPROTO_TCP, libc::TCP_QUICKACK, quick_ack as i32)
            .apply_checked(self.fd)
    }

    /// Set `SO_SNDBUF`.
    pub fn set_send_buf_size(&mut self, size: usize) -> Result<(), i32> {
        SocketOption::new(libc::SOL_SOCKET, libc::SO_SNDBUF, size as i32).apply_checked(self.fd)
    }

    /// Set `SO_RCVBUF`.
    pub fn set_recv_buf_size(&mut self, size: usize) -> Result<(), i32> {
        SocketOption::new(libc::SOL_SOCKET, libc::SO_RCVBUF, size as i32).apply_checked(self.fd)
    }

    /// Select the TCP congestion-control algorithm.
    pub fn set_congestion_flavor(&mut self, name: &str) -> Result<(), i32> {
        if self.fd < 0 {
            return Err(libc::EINVAL);
        }
        let rv = unsafe {
            libc::setsockopt(
                self.fd,
                libc::IPPROTO_TCP,
                libc::TCP_CONGESTION,
                name.as_ptr() as *const libc::c_void,
                name.len() as libc::socklen_t,
            )
        };
        if rv != 0 {
            return Err(last_errno());
        }
        Ok(())
    }

    /// Apply an arbitrary socket option.
    pub fn set_sock_opt(&mut self, opt: SocketOption) -> Result<(), i32> {
        opt.apply_checked(self.fd)
    }

    // ── Event handling ──────────────────────────────────────────────

    /// Readiness delivery from the reactor. Writes are processed before
    /// reads so a combined event drains sends first.
    pub fn io_ready(&mut self, events: EventFlags) {
        self.assert_in_loop_thread();
        let relevant = events.without(EventFlags::PERSIST);
        debug_assert!(relevant.intersects(EventFlags::READ | EventFlags::WRITE));

        if relevant == EventFlags::READ {
            self.handle_read();
        } else if relevant == EventFlags::WRITE {
            self.handle_write();
        } else if relevant.contains(EventFlags::READ | EventFlags::WRITE) {
            let gen = self.loop_generation;
            self.handle_write();
            if self.loop_generation != gen {
                return;
            }
            // The write phase may have uninstalled the read callback.
            if self.read_callback.is_some() {
                self.handle_read();
            }
        }
    }

    /// Connect/write timeout expiry, bound to the reactor timer scheduled
    /// by `connect` or the write path.
    pub fn timeout_expired(&mut self) {
        self.assert_in_loop_thread();
        self.write_timeout.note_fired();
        if self.state == SocketState::Connecting {
            metrics::CONNECT_TIMEOUTS.increment();
            self.fail_connect(SocketError::timed_out("connect timed out"));
        } else if self.state == SocketState::Established && !self.write_queue.is_empty() {
            metrics::WRITE_TIMEOUTS.increment();
            self.fail_write_head(SocketError::timed_out("write timed out"));
        }
    }

    pub(crate) fn handle_read(&mut self) {
        debug_assert!(self.state == SocketState::Established);
        debug_assert!(!self.shutdown_flags.contains(ShutdownFlags::READ_SHUT));

        // Loop until the kernel runs dry, the callback uninstalls itself,
        // the iteration cap is hit, or the socket moves to another reactor.
        let gen = self.loop_generation;
        let mut num_reads: u16 = 0;
        loop {
            let Some(cb) = self.read_callback.clone() else {
                return;
            };
            if self.loop_generation != gen {
                return;
            }

            let mut buf = cb.read_buffer();
            if buf.capacity() == 0 {
                return self.fail_read(SocketError::bad_args(
                    "read_buffer() returned a buffer with no capacity",
                ));
            }
            let capacity = buf.capacity();

            match wire_read(self.fd, &mut buf) {
                ReadOutcome::Data(n) => {
                    self.note_app_bytes_received(n as u64);
                    let filled = n == capacity;
                    cb.read_data_available(self, buf);
                    // A short read means the kernel is empty; stop until the
                    // next readiness event.
                    if !filled {
                        return;
                    }
                }
                ReadOutcome::Blocked => return,
                ReadOutcome::Eof => {
                    self.shutdown_flags.insert(ShutdownFlags::READ_SHUT);
                    if !self.update_event_registration(EventFlags::NONE, EventFlags::READ) {
                        debug_assert!(self.state == SocketState::Error);
                        debug_assert!(self.read_callback.is_none());
                        return;
                    }
                    let cb = self.read_callback.take().expect("still installed");
                    cb.read_eof(self);
                    return;
                }
                ReadOutcome::Err(errno) => {
                    let ex = self.addr_err_internal_errno("recv() failed", errno);
                    return self.fail_read(ex);
                }
            }

            num_reads += 1;
            if self.max_reads_per_event != 0 && num_reads >= self.max_reads_per_event {
                return;
            }
        }
    }

    pub(crate) fn handle_write(&mut self) {
        if self.state == SocketState::Connecting {
            return self.handle_connect();
        }
        debug_assert!(self.state == SocketState::Established);
        debug_assert!(!self.shutdown_flags.contains(ShutdownFlags::WRITE_SHUT));

        let gen = self.loop_generation;
        while !self.write_queue.is_empty() && self.loop_generation == gen {
            let (res, head_remaining) = {
                let head = self.write_queue.head().expect("non-empty");
                let mut flags = head.flags();
                if self.write_queue.len() > 1 {
                    // More requests follow: tell the kernel more is coming.
                    flags = flags | WriteFlags::CORK;
                }
                (
                    wire_writev(self.fd, head.current_ops(), flags),
                    head.remaining_ops(),
                )
            };
            match res {
                Err(errno) => {
                    let ex = self.addr_err_internal_errno("writev() failed", errno);
                    return self.fail_write_head(ex);
                }
                Ok(p) => {
                    self.note_app_bytes_written(p.total as u64);
                    if p.full_ops == head_remaining {
                        // Head fully drained. Update state before invoking
                        // the callback, so it may safely close or detach.
                        let req = self.write_queue.pop().expect("non-empty");
                        metrics::WRITES_COMPLETED.increment();
                        if self.write_queue.is_empty() {
                            if self.event_flags.contains(EventFlags::WRITE) {
                                if !self
                                    .update_event_registration(EventFlags::NONE, EventFlags::WRITE)
                                {
                                    return;
                                }
                                self.write_timeout.cancel();
                            }
                            debug_assert!(!self.write_timeout.is_scheduled());
                            self.promote_write_pending();
                        }
                        let (cb, _) = req.into_parts();
                        if let Some(cb) = cb {
                            cb.write_success(self);
                        }
                        // Keep draining the queue.
                    } else {
                        // Partial progress; a retry now would just EAGAIN.
                        self.write_queue
                            .head_mut()
                            .expect("non-empty")
                            .consume(p.full_ops, p.partial_bytes, p.total);
                        if !self.event_flags.contains(EventFlags::WRITE)
                            && !self.update_event_registration(EventFlags::WRITE, EventFlags::NONE)
                        {
                            return;
                        }
                        if self.send_timeout_ms > 0
                            && !self.write_timeout.schedule(self.send_timeout_ms)
                        {
                            let ex = self.addr_err_internal("failed to reschedule write timeout");
                            return self.fail_write_head(ex);
                        }
                        return;
                    }
                }
            }
        }
    }

    /// `WRITE_PENDING` promotion once the queue drains: half-close, or full
    /// close when reads are already shut down.
    pub(crate) fn promote_write_pending(&mut self) {
        if !self.shutdown_flags.contains(ShutdownFlags::WRITE_PENDING) {
            return;
        }
        debug_assert!(self.connect_callback.is_none());
        self.shutdown_flags.insert(ShutdownFlags::WRITE_SHUT);
        if self.shutdown_flags.contains(ShutdownFlags::READ_SHUT) {
            debug_assert!(self.read_callback.is_none());
            self.state = SocketState::Closed;
            if self.fd >= 0 {
                self.io_handler.unregister_handler();
                self.io_handler.change_fd(-1);
                self.do_close();
            }
        } else {
            unsafe {
                libc::shutdown(self.fd, libc::SHUT_WR);
            }
        }
    }

    fn handle_connect(&mut self) {
        debug_assert!(self.state == SocketState::Connecting);
        debug_assert!(!self.shutdown_flags.contains(ShutdownFlags::WRITE_SHUT));

        match self.finish_tcp_connect() {
            Ok(()) => {}
            Err(ex) => return self.fail_connect(ex),
        }

        let gen = self.loop_generation;
        if let Some(cb) = self.connect_callback.take() {
            cb.connect_success(self);
        }
        // The callback may have closed the socket, started writes, set the
        // read callback, or detached us. Only continue on the same loop.
        if self.loop_generation != gen {
            return;
        }
        self.handle_initial_read_write();
    }

    /// Complete the TCP connect: consume the one-shot registration, cancel
    /// the timeout, read `SO_ERROR`, transition, and honour a latched write
    /// shutdown. No callbacks are invoked here.
    pub(crate) fn finish_tcp_connect(&mut self) -> Result<(), SocketError> {
        self.write_timeout.cancel();

        // Connect used a one-shot registration, so delivery consumed it.
        debug_assert!(self.event_flags == EventFlags::WRITE);
        self.event_flags = EventFlags::NONE;
        self.io_handler.set_unregistered();

        let mut error: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rv = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut error as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rv != 0 {
            return Err(
                self.addr_err_internal_errno("error calling getsockopt() after connect", last_errno())
            );
        }
        if error != 0 {
            return Err(SocketError::not_open(format!(
                "connect failed (errno {error})"
            )));
        }

        self.state = SocketState::Established;

        // close()/shutdown_write() during connect latched WRITE_PENDING; a
        // drained queue means the write side shuts down right here.
        if self.shutdown_flags.contains(ShutdownFlags::WRITE_PENDING) && self.write_queue.is_empty()
        {
            debug_assert!(!self.shutdown_flags.contains(ShutdownFlags::READ_SHUT));
            unsafe {
                libc::shutdown(self.fd, libc::SHUT_WR);
            }
            self.shutdown_flags.insert(ShutdownFlags::WRITE_SHUT);
        }
        Ok(())
    }

    /// Post-connect registration fixup: read interest per callback presence,
    /// then drain any writes queued while connecting.
    pub(crate) fn handle_initial_read_write(&mut self) {
        if self.read_callback.is_some() && !self.event_flags.contains(EventFlags::READ) {
            debug_assert!(self.state == SocketState::Established);
            debug_assert!(!self.shutdown_flags.contains(ShutdownFlags::READ_SHUT));
            if !self.update_event_registration(EventFlags::READ, EventFlags::NONE) {
                return;
            }
            self.check_for_immediate_read();
        } else if self.read_callback.is_none() {
            self.update_event_registration(EventFlags::NONE, EventFlags::READ);
        }

        if !self.write_queue.is_empty() && !self.event_flags.contains(EventFlags::WRITE) {
            self.handle_write();
        } else if self.write_queue.is_empty() {
            self.update_event_registration(EventFlags::NONE, EventFlags::WRITE);
        }
    }

    /// Hook for subclasses with buffered input. Probing the kernel here
    /// would make the callback allocate a buffer with no data to fill it,
    /// so the plain socket waits for the reactor instead.
    fn check_for_immediate_read(&mut self) {}

    // ── Registration plumbing ───────────────────────────────────────

    /// Adjust interest bits and re-register. On failure the socket moves to
    /// the error state (all callbacks notified) and `false` is returned.
    pub(crate) fn update_event_registration(
        &mut self,
        enable: EventFlags,
        disable: EventFlags,
    ) -> bool {
        let old = self.event_flags;
        self.event_flags = (self.event_flags | enable).without(disable);
        if self.event_flags == old {
            return true;
        }
        self.apply_event_registration()
    }

    fn apply_event_registration(&mut self) -> bool {
        if self.event_flags.is_empty() {
            self.io_handler.unregister_handler();
            return true;
        }
        if self
            .io_handler
            .register_handler(self.event_flags | EventFlags::PERSIST)
            .is_err()
        {
            self.event_flags = EventFlags::NONE;
            let ex = self.addr_err_internal("failed to update socket event registration");
            self.fail(ex);
            return false;
        }
        true
    }

    // ── Failure machinery ───────────────────────────────────────────

    /// Phase one of failure: error state, both shutdown bits, drop interest,
    /// cancel the timeout, close the fd. Invokes no callbacks.
    pub(crate) fn start_fail(&mut self) {
        debug_assert!(self.state != SocketState::Error);
        self.state = SocketState::Error;
        self.shutdown_flags
            .insert(ShutdownFlags::READ_SHUT | ShutdownFlags::WRITE_SHUT);

        if !self.event_flags.is_empty() {
            self.event_flags = EventFlags::NONE;
            self.io_handler.unregister_handler();
        }
        self.write_timeout.cancel();

        if self.fd >= 0 {
            self.io_handler.change_fd(-1);
            self.do_close();
        }
    }

    /// Phase two: notify whatever callbacks remain installed, exactly once
    /// each.
    pub(crate) fn finish_fail(&mut self) {
        debug_assert!(self.state == SocketState::Error);
        let ex = self.addr_err_internal("socket closing after error");
        if let Some(cb) = self.connect_callback.take() {
            cb.connect_error(self, ex.clone());
        }
        self.fail_all_writes(&ex);
        if let Some(cb) = self.read_callback.take() {
            cb.read_error(self, ex);
        }
    }

    fn fail(&mut self, _ex: SocketError) {
        self.start_fail();
        self.finish_fail();
    }

    pub(crate) fn fail_connect(&mut self, ex: SocketError) {
        metrics::CONNECTS_FAILED.increment();
        self.start_fail();
        if let Some(cb) = self.connect_callback.take() {
            cb.connect_error(self, ex);
        }
        self.finish_fail();
    }

    pub(crate) fn fail_read(&mut self, ex: SocketError) {
        self.start_fail();
        if let Some(cb) = self.read_callback.take() {
            cb.read_error(self, ex);
        }
        self.finish_fail();
    }

    /// Fail with the head write seeing the actual error; the rest of the
    /// queue sees the generic closing error in `finish_fail`.
    pub(crate) fn fail_write_head(&mut self, ex: SocketError) {
        self.start_fail();
        if let Some(req) = self.write_queue.pop() {
            metrics::WRITES_FAILED.increment();
            let (cb, bytes_written) = req.into_parts();
            if let Some(cb) = cb {
                cb.write_error(self, bytes_written, ex);
            }
        }
        self.finish_fail();
    }

    /// Fail a write that never reached the queue.
    pub(crate) fn fail_write_unqueued(
        &mut self,
        callback: Option<Rc<dyn WriteCallback>>,
        bytes_written: u64,
        ex: SocketError,
    ) {
        metrics::WRITES_FAILED.increment();
        self.start_fail();
        if let Some(cb) = callback {
            cb.write_error(self, bytes_written, ex);
        }
        self.finish_fail();
    }

    pub(crate) fn fail_all_writes(&mut self, ex: &SocketError) {
        while let Some(req) = self.write_queue.pop() {
            metrics::WRITES_FAILED.increment();
            let (cb, bytes_written) = req.into_parts();
            if let Some(cb) = cb {
                cb.write_error(self, bytes_written, ex.clone());
            }
        }
    }

    /// `connect()` in a bad state. Runs outside the normal failure pair so
    /// an already-failed socket can still notify a freshly-passed callback.
    fn invalid_state_connect(&mut self, callback: Option<Rc<dyn ConnectCallback>>) {
        let ex = SocketError::already_open("connect() called with socket in invalid state");
        if matches!(self.state, SocketState::Closed | SocketState::Error) {
            if let Some(cb) = callback {
                cb.connect_error(self, ex);
            }
        } else {
            self.start_fail();
            if let Some(cb) = callback {
                cb.connect_error(self, ex);
            }
            self.finish_fail();
        }
    }

    fn invalid_state_read(&mut self, callback: Option<Rc<dyn ReadCallback>>) {
        let ex = SocketError::not_open("set_read_callback() called with socket in invalid state");
        if matches!(self.state, SocketState::Closed | SocketState::Error) {
            if let Some(cb) = callback {
                cb.read_error(self, ex);
            }
        } else {
            self.start_fail();
            if let Some(cb) = callback {
                cb.read_error(self, ex);
            }
            self.finish_fail();
        }
    }

    pub(crate) fn invalid_state_write(&mut self, callback: Option<Rc<dyn WriteCallback>>) {
        let ex = self.with_addr_err(|msg| SocketError::not_open(msg), "write() called with socket in invalid state");
        if matches!(self.state, SocketState::Closed | SocketState::Error) {
            if let Some(cb) = callback {
                cb.write_error(self, 0, ex);
            }
        } else {
            self.start_fail();
            if let Some(cb) = callback {
                cb.write_error(self, 0, ex);
            }
            self.finish_fail();
        }
    }

    fn do_close(&mut self) {
        if self.fd == -1 {
            return;
        }
        match &self.shutdown_set {
            Some(set) => set.close(self.fd),
            None => unsafe {
                libc::close(self.fd);
            },
        }
        self.fd = -1;
    }

    // ── Support for the TLS layer and error decoration ──────────────

    pub(crate) fn loop_generation(&self) -> u64 {
        self.loop_generation
    }

    pub(crate) fn event_flags(&self) -> EventFlags {
        self.event_flags
    }

    pub(crate) fn write_queue(&self) -> &WriteQueue {
        &self.write_queue
    }

    pub(crate) fn write_queue_mut(&mut self) -> &mut WriteQueue {
        &mut self.write_queue
    }

    pub(crate) fn writes_barred(&self) -> bool {
        self.shutdown_flags.intersects(
            ShutdownFlags::READ_SHUT | ShutdownFlags::WRITE_SHUT | ShutdownFlags::WRITE_PENDING,
        )
    }

    pub(crate) fn read_callback_installed(&self) -> bool {
        self.read_callback.is_some()
    }

    pub(crate) fn take_read_callback(&mut self) -> Option<Rc<dyn ReadCallback>> {
        self.read_callback.take()
    }

    pub(crate) fn take_connect_callback(&mut self) -> Option<Rc<dyn ConnectCallback>> {
        self.connect_callback.take()
    }

    pub(crate) fn set_read_shut(&mut self) {
        self.shutdown_flags.insert(ShutdownFlags::READ_SHUT);
    }

    /// Latch a deferred close: reads shut now, writes once the queue drains.
    pub(crate) fn latch_close_pending(&mut self) {
        self.shutdown_flags
            .insert(ShutdownFlags::READ_SHUT | ShutdownFlags::WRITE_PENDING);
    }

    /// Latch a deferred write shutdown.
    pub(crate) fn latch_write_pending(&mut self) {
        self.shutdown_flags.insert(ShutdownFlags::WRITE_PENDING);
    }

    /// The write/connect timer fired externally; drop the stale id.
    pub(crate) fn note_write_timeout_fired(&mut self) {
        self.write_timeout.note_fired();
    }

    pub(crate) fn max_reads_per_event(&self) -> u16 {
        self.max_reads_per_event
    }

    pub(crate) fn arm_send_timeout(&mut self) -> bool {
        if self.send_timeout_ms == 0 {
            return true;
        }
        self.write_timeout.schedule(self.send_timeout_ms)
    }

    pub(crate) fn cancel_send_timeout(&mut self) {
        self.write_timeout.cancel();
    }

    pub(crate) fn note_app_bytes_written(&mut self, n: u64) {
        self.app_bytes_written += n;
        metrics::APP_BYTES_SENT.add(n);
    }

    pub(crate) fn note_app_bytes_received(&mut self, n: u64) {
        self.app_bytes_received += n;
        metrics::APP_BYTES_RECEIVED.add(n);
    }

    fn assert_in_loop_thread(&self) {
        debug_assert!(
            self.io_handler
                .reactor()
                .map(|r| r.in_loop_thread())
                .unwrap_or(true),
            "socket used off its reactor's thread"
        );
    }

    /// Decorate a message with peer/local addresses, like every failure the
    /// socket reports.
    pub(crate) fn with_addr(&self, msg: &str) -> String {
        let fmt = |addr: Option<SocketAddr>| {
            addr.map(|a| a.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        };
        format!(
            "{msg} (peer={}, local={})",
            fmt(self.peer_addr()),
            fmt(self.local_addr())
        )
    }

    pub(crate) fn with_addr_err(
        &self,
        build: impl FnOnce(String) -> SocketError,
        msg: &str,
    ) -> SocketError {
        build(self.with_addr(msg))
    }

    pub(crate) fn addr_err_internal(&self, msg: &str) -> SocketError {
        SocketError::internal(self.with_addr(msg))
    }

    pub(crate) fn addr_err_internal_errno(&self, msg: &str, errno: i32) -> SocketError {
        SocketError::internal_errno(self.with_addr(msg), errno)
    }
}

impl Drop for AsyncSocket {
    fn drop(&mut self) {
        // Callbacks are not invoked from drop; an explicit close_now() is
        // the notifying path. This only reclaims the descriptor.
        if self.io_handler.is_registered() {
            self.io_handler.unregister_handler();
        }
        self.write_timeout.cancel();
        self.do_close();
    }
}

impl AsyncTransport for AsyncSocket {
    fn write(&mut self, callback: Option<Rc<dyn WriteCallback>>, buf: &[u8], flags: WriteFlags) {
        AsyncSocket::write(self, callback, buf, flags)
    }

    fn writev(&mut self, callback: Option<Rc<dyn WriteCallback>>, bufs: &[&[u8]], flags: WriteFlags) {
        AsyncSocket::writev(self, callback, bufs, flags)
    }

    fn write_chain(
        &mut self,
        callback: Option<Rc<dyn WriteCallback>>,
        chain: BufferChain,
        flags: WriteFlags,
    ) {
        AsyncSocket::write_chain(self, callback, chain, flags)
    }

    fn set_read_callback(&mut self, callback: Option<Rc<dyn ReadCallback>>) {
        AsyncSocket::set_read_callback(self, callback)
    }

    fn close(&mut self) {
        AsyncSocket::close(self)
    }

    fn close_now(&mut self) {
        AsyncSocket::close_now(self)
    }

    fn close_with_reset(&mut self) {
        AsyncSocket::close_with_reset(self)
    }

    fn shutdown_write(&mut self) {
        AsyncSocket::shutdown_write(self)
    }

    fn shutdown_write_now(&mut self) {
        AsyncSocket::shutdown_write_now(self)
    }

    fn good(&self) -> bool {
        AsyncSocket::good(self)
    }

    fn error(&self) -> bool {
        AsyncSocket::error(self)
    }

    fn connecting(&self) -> bool {
        AsyncSocket::connecting(self)
    }

    fn readable(&self) -> bool {
        AsyncSocket::readable(self)
    }

    fn hangup(&self) -> bool {
        AsyncSocket::hangup(self)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        AsyncSocket::local_addr(self)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        AsyncSocket::peer_addr(self)
    }

    fn app_bytes_written(&self) -> u64 {
        AsyncSocket::app_bytes_written(self)
    }

    fn app_bytes_received(&self) -> u64 {
        AsyncSocket::app_bytes_received(self)
    }

    fn set_send_timeout(&mut self, ms: u32) {
        AsyncSocket::set_send_timeout(self, ms)
    }

    fn attach_reactor(&mut self, reactor: Rc<dyn Reactor>) {
        AsyncSocket::attach_reactor(self, reactor)
    }

    fn detach_reactor(&mut self) {
        AsyncSocket::detach_reactor(self)
    }

    fn is_detachable(&self) -> bool {
        AsyncSocket::is_detachable(self)
    }
}

impl SocketOption {
    fn apply_checked(&self, fd: RawFd) -> Result<(), i32> {
        if fd < 0 {
            return Err(libc::EINVAL);
        }
        self.apply(fd)
    }
}

// ── Wire primitives ─────────────────────────────────────────────────

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// One non-blocking `recv` into the buffer's spare capacity.
pub(crate) fn wire_read(fd: RawFd, buf: &mut BytesMut) -> ReadOutcome {
    let spare = buf.spare_capacity_mut();
    let n = unsafe {
        libc::recv(
            fd,
            spare.as_mut_ptr() as *mut libc::c_void,
            spare.len(),
            libc::MSG_DONTWAIT,
        )
    };
    match n {
        1.. => {
            // SAFETY: the kernel initialised exactly n bytes of the spare
            // capacity.
            unsafe {
                buf.set_len(buf.len() + n as usize);
            }
            ReadOutcome::Data(n as usize)
        }
        0 => ReadOutcome::Eof,
        _ => {
            let errno = last_errno();
            if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                ReadOutcome::Blocked
            } else {
                ReadOutcome::Err(errno)
            }
        }
    }
}

/// One `sendmsg` over an op slice, with the written prefix decomposed into
/// whole ops plus a partial byte count. EAGAIN reports zero progress, which
/// is distinct from an error.
pub(crate) fn wire_writev(
    fd: RawFd,
    ops: &[Bytes],
    flags: WriteFlags,
) -> Result<WriteProgress, i32> {
    let iov_count = ops.len().min(IOV_MAX);
    let mut iov: Vec<libc::iovec> = ops[..iov_count]
        .iter()
        .map(|b| libc::iovec {
            iov_base: b.as_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();

    // SAFETY: msghdr is plain-old-data; zeroed means "no name, no control".
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = iov_count;

    // sendmsg over writev for MSG_NOSIGNAL: EPIPE is handled as an errno,
    // never as a signal.
    let mut msg_flags = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
    if flags.contains(WriteFlags::CORK) {
        msg_flags |= libc::MSG_MORE;
    }
    if flags.contains(WriteFlags::EOR) {
        msg_flags |= libc::MSG_EOR;
    }

    let total = unsafe { libc::sendmsg(fd, &msg, msg_flags) };
    if total < 0 {
        let errno = last_errno();
        if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
            // Kernel buffer full: no progress, not an error.
            return Ok(WriteProgress::default());
        }
        return Err(errno);
    }
    let total = total as usize;

    let mut remaining = total;
    for (n, op) in ops.iter().enumerate() {
        if op.len() > remaining {
            return Ok(WriteProgress {
                total,
                full_ops: n,
                partial_bytes: remaining,
            });
        }
        remaining -= op.len();
    }
    debug_assert!(remaining == 0);
    Ok(WriteProgress {
        total,
        full_ops: ops.len(),
        partial_bytes: 0,
    })
}

fn closed_locally() -> SocketError {
    SocketError::end_of_file("socket closed locally")
}

fn shutdown_for_writes() -> SocketError {
    SocketError::end_of_file("socket shutdown for writes")
}

fn socket_addr_to_storage(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: sockaddr_storage is plain-old-data.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    // Octets are already network order.
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // SAFETY: sockaddr_in fits inside sockaddr_storage.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin as *const _ as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in>(),
                );
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            // SAFETY: sockaddr_in6 fits inside sockaddr_storage.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin6 as *const _ as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in6>(),
                );
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

/// Convert a `sockaddr_storage` (from getsockname/getpeername) to a Rust
/// `SocketAddr`.
fn sockaddr_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: ss_family says this is a sockaddr_in.
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            let port = u16::from_be(sa.sin_port);
            Some(SocketAddr::from((ip, port)))
        }
        libc::AF_INET6 => {
            // SAFETY: ss_family says this is a sockaddr_in6.
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr);
            let port = u16::from_be(sa.sin6_port);
            Some(SocketAddr::from((ip, port)))
        }
        _ => None,
    }
}
