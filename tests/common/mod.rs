//! Shared harness for integration tests: a scripted reactor, recording
//! callbacks, and raw-fd helpers over non-blocking socketpairs.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

use bytes::BytesMut;
use wireline::{
    AsyncTransport, ConnectCallback, EventFlags, ReadCallback, Reactor, SocketError, TimerId,
    WriteCallback,
};

/// A reactor double: records registrations and timers, never polls. Tests
/// deliver readiness themselves by calling `io_ready` on the socket.
pub struct SimReactor {
    registrations: RefCell<HashMap<RawFd, EventFlags>>,
    timers: RefCell<Vec<(TimerId, u32)>>,
    cancelled: RefCell<Vec<TimerId>>,
    next_timer: Cell<u64>,
}

impl SimReactor {
    pub fn new() -> Rc<Self> {
        Rc::new(SimReactor {
            registrations: RefCell::new(HashMap::new()),
            timers: RefCell::new(Vec::new()),
            cancelled: RefCell::new(Vec::new()),
            next_timer: Cell::new(1),
        })
    }

    pub fn flags_for(&self, fd: RawFd) -> Option<EventFlags> {
        self.registrations.borrow().get(&fd).copied()
    }

    pub fn has_read_interest(&self, fd: RawFd) -> bool {
        self.flags_for(fd)
            .map(|f| f.contains(EventFlags::READ))
            .unwrap_or(false)
    }

    pub fn has_write_interest(&self, fd: RawFd) -> bool {
        self.flags_for(fd)
            .map(|f| f.contains(EventFlags::WRITE))
            .unwrap_or(false)
    }

    /// Timers scheduled and not yet cancelled.
    pub fn live_timer_count(&self) -> usize {
        let cancelled = self.cancelled.borrow();
        self.timers
            .borrow()
            .iter()
            .filter(|(id, _)| !cancelled.contains(id))
            .count()
    }
}

impl Reactor for SimReactor {
    fn register_io(&self, fd: RawFd, flags: EventFlags) -> io::Result<()> {
        self.registrations.borrow_mut().insert(fd, flags);
        Ok(())
    }

    fn unregister_io(&self, fd: RawFd) {
        self.registrations.borrow_mut().remove(&fd);
    }

    fn schedule_timer(&self, delay_ms: u32) -> TimerId {
        let id = TimerId(self.next_timer.get());
        self.next_timer.set(id.0 + 1);
        self.timers.borrow_mut().push((id, delay_ms));
        id
    }

    fn cancel_timer(&self, id: TimerId) {
        self.cancelled.borrow_mut().push(id);
    }
}

// ── Recording callbacks ─────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub enum ReadEvent {
    Data(Vec<u8>),
    Eof,
    Error(String),
}

/// Read callback that hands out fixed-capacity buffers and logs everything
/// it is told.
pub struct RecordingRead {
    pub buf_capacity: Cell<usize>,
    pub events: RefCell<Vec<ReadEvent>>,
}

impl RecordingRead {
    pub fn new(buf_capacity: usize) -> Rc<Self> {
        Rc::new(RecordingRead {
            buf_capacity: Cell::new(buf_capacity),
            events: RefCell::new(Vec::new()),
        })
    }

    pub fn data_concat(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for ev in self.events.borrow().iter() {
            if let ReadEvent::Data(d) = ev {
                out.extend_from_slice(d);
            }
        }
        out
    }

    pub fn saw_eof(&self) -> bool {
        self.events.borrow().iter().any(|e| *e == ReadEvent::Eof)
    }

    pub fn error_text(&self) -> Option<String> {
        self.events.borrow().iter().find_map(|e| match e {
            ReadEvent::Error(s) => Some(s.clone()),
            _ => None,
        })
    }
}

impl ReadCallback for RecordingRead {
    fn read_buffer(&self) -> BytesMut {
        BytesMut::with_capacity(self.buf_capacity.get())
    }

    fn read_data_available(&self, _sock: &mut dyn AsyncTransport, data: BytesMut) {
        self.events.borrow_mut().push(ReadEvent::Data(data.to_vec()));
    }

    fn read_eof(&self, _sock: &mut dyn AsyncTransport) {
        self.events.borrow_mut().push(ReadEvent::Eof);
    }

    fn read_error(&self, _sock: &mut dyn AsyncTransport, err: SocketError) {
        self.events
            .borrow_mut()
            .push(ReadEvent::Error(err.to_string()));
    }
}

/// Write callback recording its completion.
#[derive(Default)]
pub struct RecordingWrite {
    pub successes: Cell<u32>,
    pub errors: RefCell<Vec<(u64, SocketError)>>,
}

impl RecordingWrite {
    pub fn new() -> Rc<Self> {
        Rc::new(RecordingWrite::default())
    }

    pub fn error_count(&self) -> usize {
        self.errors.borrow().len()
    }
}

impl WriteCallback for RecordingWrite {
    fn write_success(&self, _sock: &mut dyn AsyncTransport) {
        self.successes.set(self.successes.get() + 1);
    }

    fn write_error(&self, _sock: &mut dyn AsyncTransport, bytes_written: u64, err: SocketError) {
        self.errors.borrow_mut().push((bytes_written, err));
    }
}

/// Write callback that appends its tag to a shared log on success, for
/// completion-order assertions.
pub struct OrderedWrite {
    pub tag: u32,
    pub log: Rc<RefCell<Vec<u32>>>,
    pub errors: RefCell<Vec<(u64, SocketError)>>,
}

impl OrderedWrite {
    pub fn new(tag: u32, log: Rc<RefCell<Vec<u32>>>) -> Rc<Self> {
        Rc::new(OrderedWrite {
            tag,
            log,
            errors: RefCell::new(Vec::new()),
        })
    }
}

impl WriteCallback for OrderedWrite {
    fn write_success(&self, _sock: &mut dyn AsyncTransport) {
        self.log.borrow_mut().push(self.tag);
    }

    fn write_error(&self, _sock: &mut dyn AsyncTransport, bytes_written: u64, err: SocketError) {
        self.errors.borrow_mut().push((bytes_written, err));
    }
}

/// Connect callback recording its single outcome.
#[derive(Default)]
pub struct RecordingConnect {
    pub outcome: RefCell<Option<Result<(), SocketError>>>,
}

impl RecordingConnect {
    pub fn new() -> Rc<Self> {
        Rc::new(RecordingConnect::default())
    }

    pub fn succeeded(&self) -> bool {
        matches!(*self.outcome.borrow(), Some(Ok(())))
    }

    pub fn error_text(&self) -> Option<String> {
        match &*self.outcome.borrow() {
            Some(Err(e)) => Some(e.to_string()),
            _ => None,
        }
    }
}

impl ConnectCallback for RecordingConnect {
    fn connect_success(&self, _sock: &mut dyn AsyncTransport) {
        *self.outcome.borrow_mut() = Some(Ok(()));
    }

    fn connect_error(&self, _sock: &mut dyn AsyncTransport, err: SocketError) {
        *self.outcome.borrow_mut() = Some(Err(err));
    }
}

// ── Raw fd helpers ──────────────────────────────────────────────────────

/// A connected non-blocking AF_UNIX stream pair.
pub fn socketpair_nonblocking() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rv = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    assert_eq!(rv, 0, "socketpair failed");
    (fds[0], fds[1])
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Shrink the kernel send buffer to force early back-pressure.
pub fn set_small_send_buf(fd: RawFd) {
    let size: libc::c_int = 1;
    // The kernel clamps to its minimum; any small value does.
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

/// Read everything currently buffered on `fd`.
pub fn drain_fd(fd: RawFd) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 65536];
    loop {
        let n = unsafe {
            libc::recv(
                fd,
                chunk.as_mut_ptr() as *mut libc::c_void,
                chunk.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if n <= 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n as usize]);
    }
    out
}

/// Write raw bytes into `fd`; panics if the kernel does not take them all.
pub fn write_all_fd(fd: RawFd, data: &[u8]) {
    let n = unsafe {
        libc::send(
            fd,
            data.as_ptr() as *const libc::c_void,
            data.len(),
            libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
        )
    };
    assert_eq!(n, data.len() as isize, "short raw write in test harness");
}

/// Block (bounded) until `fd` polls writable.
pub fn await_writable(fd: RawFd) {
    let mut fds = [libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    }];
    let rv = unsafe { libc::poll(fds.as_mut_ptr(), 1, 5_000) };
    assert!(rv > 0, "fd never became writable");
}

/// Block (bounded) until `fd` polls readable.
pub fn await_readable(fd: RawFd) {
    let mut fds = [libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }];
    let rv = unsafe { libc::poll(fds.as_mut_ptr(), 1, 5_000) };
    assert!(rv > 0, "fd never became readable");
}

/// A listening TCP socket on a loopback ephemeral port.
pub fn loopback_listener() -> (RawFd, std::net::SocketAddr) {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
        )
    };
    assert!(fd >= 0);
    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes([127, 0, 0, 1]),
        },
        sin_zero: [0; 8],
    };
    let rv = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    assert_eq!(rv, 0);
    let rv = unsafe { libc::listen(fd, 8) };
    assert_eq!(rv, 0);

    let mut bound: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rv = unsafe {
        libc::getsockname(fd, &mut bound as *mut _ as *mut libc::sockaddr, &mut len)
    };
    assert_eq!(rv, 0);
    let port = u16::from_be(bound.sin_port);
    (fd, format!("127.0.0.1:{port}").parse().unwrap())
}

/// Accept one pending connection, non-blocking with a bounded wait.
pub fn accept_one(listener: RawFd) -> RawFd {
    await_readable(listener);
    let fd = unsafe {
        libc::accept4(
            listener,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    assert!(fd >= 0, "accept failed");
    fd
}
