//! TLS socket layered over [`AsyncSocket`].
//!
//! The TLS socket replaces the plain socket's event handlers: while a
//! handshake is in flight, readiness is routed into the engine's
//! accept/connect retry loop; once established, the read and write loops
//! run the same bookkeeping as the plain socket but move bytes through the
//! engine. The engine performs its wire I/O through [`SocketWire`], which
//! also observes the inbound record layer (ClientHello capture,
//! renegotiation detection) and applies `MSG_EOR` to exactly the `sendmsg`
//! that carries the end of a flagged application record.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::callback::{ConnectCallback, HandshakeCallback, ReadCallback, WriteCallback};
use crate::chain::BufferChain;
use crate::client_hello::{render_cipher_suites, ClientHelloInfo, RecordMonitor};
use crate::error::{ssl_code, SocketError};
use crate::metrics;
use crate::reactor::{EventFlags, Reactor, Timeout};
use crate::socket::{AsyncSocket, AsyncTransport, ShutdownFlags, SocketOption, SocketState};
use crate::tls::{
    resolve_verify, HandshakeIo, IoOutcome, PeerCertInfo, PeerVerifier, TlsContext, TlsEngine,
    TlsFault, TlsPoll, TlsSession, VerifyMode, VerifyPeer, WireIo,
};
use crate::write_queue::{WriteFlags, WriteRequest};

/// TLS-layer lifecycle state, tracked alongside the transport state of the
/// underlying socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslState {
    /// No TLS started yet.
    Uninit,
    /// Server handshake in flight.
    Accepting,
    /// Paused for an out-of-band session-cache lookup.
    CacheLookup,
    /// Paused for an asynchronous private-key operation.
    KeyOpPending,
    /// Client handshake (or the TCP connect preceding it) in flight.
    Connecting,
    /// Handshake complete; application data flows.
    Established,
    /// Peer closed its end; writes may still proceed.
    RemoteClosed,
    /// `close()` requested, waiting for pending writes to drain.
    Closing,
    /// `close()` requested while the connect was still in flight.
    ConnectingClosing,
    /// Cleanly closed.
    Closed,
    /// Torn down by a failure.
    Error,
}

/// Captures the synchronous outcome of the underlying TCP connect so the
/// TLS layer can bridge it into the handshake.
#[derive(Default)]
struct ConnectBridge {
    outcome: RefCell<Option<Result<(), SocketError>>>,
}

impl ConnectBridge {
    fn take(&self) -> Option<Result<(), SocketError>> {
        self.outcome.borrow_mut().take()
    }
}

impl ConnectCallback for ConnectBridge {
    fn connect_success(&self, _sock: &mut dyn AsyncTransport) {
        *self.outcome.borrow_mut() = Some(Ok(()));
    }

    fn connect_error(&self, _sock: &mut dyn AsyncTransport, err: SocketError) {
        *self.outcome.borrow_mut() = Some(Err(err));
    }
}

/// Forwards engine verification to the installed handshake callback.
struct CallbackVerifier {
    cb: Option<Rc<dyn HandshakeCallback>>,
}

impl PeerVerifier for CallbackVerifier {
    fn verify(&mut self, preverify_ok: bool, cert: &PeerCertInfo) -> bool {
        match &self.cb {
            Some(cb) => cb.handshake_verify(preverify_ok, cert),
            None => preverify_ok,
        }
    }
}

/// Whether this wire send crosses the end-of-record threshold and must carry
/// `MSG_EOR`.
fn eor_crosses(min_eor_raw_byte_no: Option<u64>, raw_written: u64, chunk_len: usize) -> bool {
    match min_eor_raw_byte_no {
        Some(min) => raw_written < min && raw_written + chunk_len as u64 >= min,
        None => false,
    }
}

/// The engine's wire surface for one socket: non-blocking fd transfer with
/// record observation on the inbound side and end-of-record flagging on the
/// outbound side.
struct SocketWire<'a> {
    fd: RawFd,
    raw_bytes_written: &'a mut u64,
    raw_bytes_received: &'a mut u64,
    min_eor_raw_byte_no: Option<u64>,
    monitor: &'a mut RecordMonitor,
}

impl WireIo for SocketWire<'_> {
    fn recv(&mut self, buf: &mut [u8]) -> IoOutcome {
        let n = unsafe {
            libc::recv(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        match n {
            1.. => {
                let n = n as usize;
                *self.raw_bytes_received += n as u64;
                self.monitor.feed(&buf[..n]);
                IoOutcome::Done(n)
            }
            0 => IoOutcome::Done(0),
            _ => {
                let errno = last_errno();
                if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                    IoOutcome::WouldBlock
                } else {
                    IoOutcome::Err(errno)
                }
            }
        }
    }

    fn send(&mut self, buf: &[u8]) -> IoOutcome {
        let mut flags = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
        if eor_crosses(self.min_eor_raw_byte_no, *self.raw_bytes_written, buf.len()) {
            flags |= libc::MSG_EOR;
        }
        let n = unsafe {
            libc::send(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                flags,
            )
        };
        if n < 0 {
            let errno = last_errno();
            return if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                IoOutcome::WouldBlock
            } else {
                IoOutcome::Err(errno)
            };
        }
        *self.raw_bytes_written += n as u64;
        IoOutcome::Done(n as usize)
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

enum SslReadOutcome {
    Data(usize),
    Blocked,
    Eof,
    Err(SocketError),
}

enum SslWriteOutcome {
    Written(usize),
    Blocked,
}

/// An event-driven TLS socket.
pub struct AsyncSslSocket {
    sock: AsyncSocket,
    ctx: Rc<dyn TlsContext>,
    /// Bound during an SNI context switch, until the handshake completes.
    handshake_ctx: Option<Rc<dyn TlsContext>>,
    engine: Option<Box<dyn TlsEngine>>,
    server: bool,
    ssl_state: SslState,
    handshake_complete: bool,
    renegotiate_attempted: bool,
    handshake_callback: Option<Rc<dyn HandshakeCallback>>,
    handshake_timeout: Timeout,
    /// The user's connect callback for the combined TCP+TLS connect; fires
    /// only once the handshake completes.
    user_connect_cb: Option<Rc<dyn ConnectCallback>>,
    tcp_bridge: Option<Rc<ConnectBridge>>,
    session: Option<Arc<dyn TlsSession>>,
    verify_peer: VerifyPeer,
    resolved_verify: VerifyMode,
    session_id_resumed: bool,
    eor_tracking: bool,
    /// Application-byte position (exclusive) where the flagged record ends.
    app_eor_byte_no: Option<u64>,
    /// Wire-byte threshold whose crossing send carries `MSG_EOR`.
    min_eor_raw_byte_no: Option<u64>,
    raw_bytes_written: u64,
    raw_bytes_received: u64,
    monitor: RecordMonitor,
}

impl AsyncSslSocket {
    /// A client socket that will connect and then handshake.
    pub fn new_client(ctx: Rc<dyn TlsContext>, reactor: Option<Rc<dyn Reactor>>) -> Self {
        Self::with_base(AsyncSocket::new(reactor.clone()), ctx, reactor, false)
    }

    /// Adopt an already-connected fd in the given role. Socket options on
    /// the fd are left untouched.
    pub fn from_fd(
        ctx: Rc<dyn TlsContext>,
        reactor: Option<Rc<dyn Reactor>>,
        fd: RawFd,
        server: bool,
    ) -> Self {
        Self::with_base(AsyncSocket::from_fd(reactor.clone(), fd), ctx, reactor, server)
    }

    fn with_base(
        sock: AsyncSocket,
        ctx: Rc<dyn TlsContext>,
        reactor: Option<Rc<dyn Reactor>>,
        server: bool,
    ) -> Self {
        AsyncSslSocket {
            sock,
            ctx,
            handshake_ctx: None,
            engine: None,
            server,
            ssl_state: SslState::Uninit,
            handshake_complete: false,
            renegotiate_attempted: false,
            handshake_callback: None,
            handshake_timeout: Timeout::new(reactor),
            user_connect_cb: None,
            tcp_bridge: None,
            session: None,
            verify_peer: VerifyPeer::UseCtx,
            resolved_verify: VerifyMode::NoVerify,
            session_id_resumed: false,
            eor_tracking: false,
            app_eor_byte_no: None,
            min_eor_raw_byte_no: None,
            raw_bytes_written: 0,
            raw_bytes_received: 0,
            monitor: RecordMonitor::new(),
        }
    }

    /// The underlying plain socket.
    pub fn plain_socket(&self) -> &AsyncSocket {
        &self.sock
    }

    /// TLS-layer state.
    pub fn ssl_state(&self) -> SslState {
        self.ssl_state
    }

    /// Whether this socket plays the server role.
    pub fn is_server(&self) -> bool {
        self.server
    }

    /// Wire bytes written, including TLS framing.
    pub fn raw_bytes_written(&self) -> u64 {
        self.raw_bytes_written
    }

    /// Wire bytes received, including TLS framing.
    pub fn raw_bytes_received(&self) -> u64 {
        self.raw_bytes_received
    }

    /// Enable `MSG_EOR` propagation for writes flagged with
    /// [`WriteFlags::EOR`].
    pub fn set_eor_tracking(&mut self, track: bool) {
        self.eor_tracking = track;
        if !track {
            self.app_eor_byte_no = None;
            self.min_eor_raw_byte_no = None;
        }
    }

    /// Whether EOR tracking is on.
    pub fn is_eor_tracking_enabled(&self) -> bool {
        self.eor_tracking
    }

    /// The application-byte position (exclusive) of the record end currently
    /// being tracked for `MSG_EOR`, if one is in flight.
    pub fn app_eor_byte_no(&self) -> Option<u64> {
        self.app_eor_byte_no
    }

    /// Cap on read-loop iterations per readiness event; 0 = unbounded.
    pub fn set_max_reads_per_event(&mut self, max: u16) {
        self.sock.set_max_reads_per_event(max);
    }

    /// Verification policy for a combined `connect()`; `ssl_accept` and
    /// `ssl_connect` take theirs as a parameter.
    pub fn set_verify_peer(&mut self, verify: VerifyPeer) {
        self.verify_peer = verify;
    }

    /// Register the socket's fd with a process-wide shutdown registry.
    pub fn set_shutdown_socket_set(
        &mut self,
        set: Option<std::sync::Arc<crate::shutdown_set::ShutdownSocketSet>>,
    ) {
        self.sock.set_shutdown_socket_set(set);
    }

    /// Toggle `TCP_NODELAY` on the underlying fd.
    pub fn set_no_delay(&mut self, no_delay: bool) -> Result<(), i32> {
        self.sock.set_no_delay(no_delay)
    }

    /// Set `SO_SNDBUF` on the underlying fd.
    pub fn set_send_buf_size(&mut self, size: usize) -> Result<(), i32> {
        self.sock.set_send_buf_size(size)
    }

    /// Set `SO_RCVBUF` on the underlying fd.
    pub fn set_recv_buf_size(&mut self, size: usize) -> Result<(), i32> {
        self.sock.set_recv_buf_size(size)
    }

    /// Apply an arbitrary socket option to the underlying fd.
    pub fn set_sock_opt(&mut self, opt: SocketOption) -> Result<(), i32> {
        self.sock.set_sock_opt(opt)
    }

    // ── Handshake entry points ──────────────────────────────────────

    /// Accept a TLS connection on an established server socket.
    pub fn ssl_accept(
        &mut self,
        callback: Option<Rc<dyn HandshakeCallback>>,
        timeout_ms: u32,
        verify: VerifyPeer,
    ) {
        if !self.server
            || self.ssl_state != SslState::Uninit
            || self.sock.state() != SocketState::Established
            || self.engine.is_some()
        {
            return self.invalid_state_handshake(callback);
        }
        self.verify_peer = verify;
        self.handshake_callback = callback;
        self.ssl_state = SslState::Accepting;
        self.install_engine(true);
        metrics::HANDSHAKES_STARTED.increment();
        if timeout_ms > 0 && !self.handshake_timeout.schedule(timeout_ms) {
            return self.fail_handshake(
                self.sock
                    .addr_err_internal("failed to schedule handshake timeout"),
            );
        }
        self.drive_accept();
    }

    /// Re-enter the accept loop after an out-of-band pause was resolved
    /// (session injected after a cache miss, or an async key operation
    /// completed).
    pub fn restart_ssl_accept(&mut self) {
        debug_assert!(matches!(
            self.ssl_state,
            SslState::CacheLookup
                | SslState::KeyOpPending
                | SslState::Accepting
                | SslState::Closed
                | SslState::Error
        ));
        if matches!(self.ssl_state, SslState::Closed | SslState::Error) {
            return;
        }
        self.ssl_state = SslState::Accepting;
        if let (Some(engine), Some(session)) = (&mut self.engine, &self.session) {
            let _ = engine.set_session(session.clone());
        }
        self.drive_accept();
    }

    /// Start the client handshake on an established socket.
    pub fn ssl_connect(
        &mut self,
        callback: Option<Rc<dyn HandshakeCallback>>,
        timeout_ms: u32,
        verify: VerifyPeer,
    ) {
        if self.server
            || self.ssl_state != SslState::Uninit
            || self.sock.state() != SocketState::Established
            || self.engine.is_some()
        {
            return self.invalid_state_handshake(callback);
        }
        self.verify_peer = verify;
        self.handshake_callback = callback;
        self.ssl_state = SslState::Connecting;
        if timeout_ms > 0 && !self.handshake_timeout.schedule(timeout_ms) {
            return self.fail_handshake(
                self.sock
                    .addr_err_internal("failed to schedule handshake timeout"),
            );
        }
        self.start_tls_connect();
    }

    /// TCP connect followed by the TLS handshake, under one combined
    /// timeout. The callback's `connect_success` fires only once the
    /// handshake has completed; a failure in either phase reports
    /// `connect_error`.
    pub fn connect(
        &mut self,
        callback: Option<Rc<dyn ConnectCallback>>,
        addr: SocketAddr,
        timeout_ms: u32,
        options: &[SocketOption],
        bind_addr: Option<SocketAddr>,
    ) {
        if self.server || self.ssl_state != SslState::Uninit || self.engine.is_some() {
            let ex = SocketError::already_open(
                self.sock
                    .with_addr("connect() called with SSL socket in invalid state"),
            );
            if let Some(cb) = callback {
                cb.connect_error(self, ex);
            }
            return;
        }
        self.user_connect_cb = callback;
        self.ssl_state = SslState::Connecting;
        if timeout_ms > 0 && !self.handshake_timeout.schedule(timeout_ms) {
            return self.fail_handshake(
                self.sock
                    .addr_err_internal("failed to schedule connect timeout"),
            );
        }

        let bridge = Rc::new(ConnectBridge::default());
        self.tcp_bridge = Some(bridge.clone());
        self.sock.connect(Some(bridge), addr, 0, options, bind_addr);
        self.poll_tcp_bridge();
    }

    fn poll_tcp_bridge(&mut self) {
        let Some(bridge) = self.tcp_bridge.clone() else {
            return;
        };
        match bridge.take() {
            None => {}
            Some(Ok(())) => {
                self.tcp_bridge = None;
                let _ = self.sock.take_connect_callback();
                if self.ssl_state == SslState::ConnectingClosing {
                    return self.close_now();
                }
                self.start_tls_connect();
            }
            Some(Err(ex)) => {
                self.tcp_bridge = None;
                self.fail_handshake(ex);
            }
        }
    }

    fn start_tls_connect(&mut self) {
        debug_assert!(self.sock.state() == SocketState::Established);
        debug_assert!(self.ssl_state == SslState::Connecting);
        self.install_engine(false);
        metrics::HANDSHAKES_STARTED.increment();
        self.drive_connect();
    }

    fn install_engine(&mut self, server: bool) {
        let ctx = self.active_ctx();
        let mut engine = ctx.new_engine(server);
        let mode = resolve_verify(self.verify_peer, ctx.as_ref());
        self.resolved_verify = mode;
        engine.set_verify(mode);
        if let Some(session) = &self.session {
            let _ = engine.set_session(session.clone());
        }
        self.engine = Some(engine);
    }

    fn active_ctx(&self) -> Rc<dyn TlsContext> {
        self.handshake_ctx.clone().unwrap_or_else(|| self.ctx.clone())
    }

    // ── Handshake drive loop ────────────────────────────────────────

    fn drive_accept(&mut self) {
        debug_assert!(self.ssl_state == SslState::Accepting);
        let verifies = self.resolved_verify.verifies();
        let mut verifier = CallbackVerifier {
            cb: self.handshake_callback.clone(),
        };
        let res = {
            let (engine, mut wire) = borrow_engine_wire(
                &mut self.engine,
                self.sock.fd(),
                &mut self.raw_bytes_written,
                &mut self.raw_bytes_received,
                self.min_eor_raw_byte_no,
                &mut self.monitor,
            );
            let mut io = HandshakeIo {
                wire: &mut wire,
                verifier: if verifies { Some(&mut verifier) } else { None },
            };
            engine.accept(&mut io)
        };
        self.after_handshake_step(res);
    }

    fn drive_connect(&mut self) {
        debug_assert!(self.ssl_state == SslState::Connecting);
        let verifies = self.resolved_verify.verifies();
        let mut verifier = CallbackVerifier {
            cb: self.handshake_callback.clone(),
        };
        let res = {
            let (engine, mut wire) = borrow_engine_wire(
                &mut self.engine,
                self.sock.fd(),
                &mut self.raw_bytes_written,
                &mut self.raw_bytes_received,
                self.min_eor_raw_byte_no,
                &mut self.monitor,
            );
            let mut io = HandshakeIo {
                wire: &mut wire,
                verifier: if verifies { Some(&mut verifier) } else { None },
            };
            engine.connect(&mut io)
        };
        self.after_handshake_step(res);
    }

    /// Map one engine outcome onto reactor interest or a state pause; the
    /// `will_block` logic of the handshake.
    fn after_handshake_step(&mut self, res: Result<TlsPoll<()>, TlsFault>) {
        match res {
            Ok(TlsPoll::Ready(())) => self.handshake_completed(),
            Ok(TlsPoll::WantRead) => {
                if !self
                    .sock
                    .update_event_registration(EventFlags::READ, EventFlags::WRITE)
                {
                    self.fail_handshake(
                        self.sock
                            .addr_err_internal("failed to register for handshake read"),
                    );
                }
            }
            Ok(TlsPoll::WantWrite) => {
                if !self
                    .sock
                    .update_event_registration(EventFlags::WRITE, EventFlags::READ)
                {
                    self.fail_handshake(
                        self.sock
                            .addr_err_internal("failed to register for handshake write"),
                    );
                }
            }
            Ok(TlsPoll::WantSessionLookup) => {
                self.ssl_state = SslState::CacheLookup;
                // No I/O can progress until the lookup resolves.
                self.sock
                    .update_event_registration(EventFlags::NONE, EventFlags::READ | EventFlags::WRITE);
            }
            Ok(TlsPoll::WantAsyncKey) => {
                self.ssl_state = SslState::KeyOpPending;
                self.sock
                    .update_event_registration(EventFlags::NONE, EventFlags::READ | EventFlags::WRITE);
            }
            Ok(TlsPoll::Closed) => {
                let ex = SocketError::end_of_file(
                    self.sock.with_addr("connection closed during SSL handshake"),
                );
                self.fail_handshake(ex);
            }
            Err(fault) => {
                let ex = SocketError::ssl(fault.code, self.sock.with_addr(&fault.msg));
                self.fail_handshake(ex);
            }
        }
    }

    fn handshake_completed(&mut self) {
        self.handshake_timeout.cancel();
        self.handshake_complete = true;
        self.ssl_state = SslState::Established;
        self.monitor.set_established();
        if let Some(engine) = &self.engine {
            self.session_id_resumed = engine.session_reused();
        }
        metrics::HANDSHAKES_COMPLETED.increment();

        let gen = self.sock.loop_generation();
        if let Some(cb) = self.handshake_callback.take() {
            cb.handshake_success(self);
        }
        if self.sock.loop_generation() != gen || self.ssl_state != SslState::Established {
            return;
        }
        if let Some(cb) = self.user_connect_cb.take() {
            cb.connect_success(self);
            if self.sock.loop_generation() != gen || self.ssl_state != SslState::Established {
                return;
            }
        }
        self.initial_read_write();
    }

    /// Post-handshake registration fixup: read interest per callback
    /// presence (with an immediate read for plaintext the engine already
    /// buffered), then drain writes queued while connecting.
    fn initial_read_write(&mut self) {
        if self.sock.state() != SocketState::Established {
            return;
        }
        if self.sock.read_callback_installed() {
            if !self.sock.event_flags().contains(EventFlags::READ) {
                if !self
                    .sock
                    .update_event_registration(EventFlags::READ, EventFlags::NONE)
                {
                    self.sync_from_base();
                    return;
                }
            }
            self.check_for_immediate_read();
            if self.ssl_state != SslState::Established {
                return;
            }
        } else if !self
            .sock
            .update_event_registration(EventFlags::NONE, EventFlags::READ)
        {
            self.sync_from_base();
            return;
        }

        if !self.sock.write_queue().is_empty() && !self.sock.event_flags().contains(EventFlags::WRITE)
        {
            self.handle_ssl_write();
        } else if self.sock.write_queue().is_empty() {
            if !self
                .sock
                .update_event_registration(EventFlags::NONE, EventFlags::WRITE)
            {
                self.sync_from_base();
            }
        }
    }

    /// The engine may hold plaintext decrypted alongside the handshake
    /// tail; deliver it without waiting for more wire readiness.
    fn check_for_immediate_read(&mut self) {
        let pending = self
            .engine
            .as_ref()
            .map(|e| e.pending_plaintext() > 0)
            .unwrap_or(false);
        if pending {
            self.handle_ssl_read();
        }
    }

    // ── Event handling ──────────────────────────────────────────────

    /// Readiness delivery from the reactor.
    pub fn io_ready(&mut self, events: EventFlags) {
        match self.ssl_state {
            SslState::Connecting | SslState::ConnectingClosing
                if self.sock.state() == SocketState::Connecting =>
            {
                // TCP phase of a combined connect.
                let _ = self.sock.take_connect_callback();
                match self.sock.finish_tcp_connect() {
                    Ok(()) => {
                        self.tcp_bridge = None;
                        if self.ssl_state == SslState::ConnectingClosing {
                            return self.close_now();
                        }
                        self.start_tls_connect();
                    }
                    Err(ex) => {
                        self.tcp_bridge = None;
                        metrics::CONNECTS_FAILED.increment();
                        self.fail_handshake(ex);
                    }
                }
            }
            SslState::Accepting => self.drive_accept(),
            SslState::Connecting => self.drive_connect(),
            SslState::CacheLookup | SslState::KeyOpPending => {
                // Paused; interest was dropped, stale events are ignored.
            }
            SslState::Established | SslState::RemoteClosed | SslState::Closing => {
                self.handle_established(events)
            }
            SslState::Uninit => {
                debug_assert!(false, "readiness delivered before TLS was started");
            }
            SslState::ConnectingClosing | SslState::Closed | SslState::Error => {}
        }
    }

    fn handle_established(&mut self, events: EventFlags) {
        let gen = self.sock.loop_generation();
        if events.contains(EventFlags::WRITE)
            && self.sock.state() == SocketState::Established
            && !self.sock.write_queue().is_empty()
        {
            self.handle_ssl_write();
        }
        if self.sock.loop_generation() != gen {
            return;
        }
        if !matches!(
            self.ssl_state,
            SslState::Established | SslState::RemoteClosed | SslState::Closing
        ) {
            return;
        }
        if events.contains(EventFlags::READ) && self.sock.read_callback_installed() {
            self.handle_ssl_read();
        }
    }

    /// Handshake timer expiry; also covers the TCP phase of a combined
    /// connect.
    pub fn handshake_timeout_expired(&mut self) {
        self.handshake_timeout.note_fired();
        match self.ssl_state {
            SslState::Accepting | SslState::CacheLookup | SslState::KeyOpPending => {
                let ex = SocketError::timed_out(self.sock.with_addr("SSL accept timed out"));
                self.fail_handshake(ex);
            }
            SslState::Connecting | SslState::ConnectingClosing => {
                let ex = if self.sock.state() == SocketState::Connecting {
                    metrics::CONNECT_TIMEOUTS.increment();
                    SocketError::timed_out("connect timed out")
                } else {
                    SocketError::timed_out(self.sock.with_addr("SSL connect timed out"))
                };
                self.fail_handshake(ex);
            }
            _ => {}
        }
    }

    /// Write timer expiry for the established phase.
    pub fn timeout_expired(&mut self) {
        self.sock.note_write_timeout_fired();
        if self.sock.state() == SocketState::Established && !self.sock.write_queue().is_empty() {
            metrics::WRITE_TIMEOUTS.increment();
            self.fail_ssl_write_head(SocketError::timed_out("write timed out"));
        }
    }

    // ── Established-phase read ──────────────────────────────────────

    fn handle_ssl_read(&mut self) {
        if self.sock.state() != SocketState::Established
            || self
                .sock
                .shutdown_flags()
                .contains(ShutdownFlags::READ_SHUT)
        {
            return;
        }

        let gen = self.sock.loop_generation();
        let mut num_reads: u16 = 0;
        loop {
            if self.renegotiate_attempted || self.monitor.renegotiation_seen() {
                let ex = self.renegotiation_error();
                return self.fail_ssl_read(ex);
            }
            let Some(cb) = self.sock.read_callback() else {
                return;
            };
            if self.sock.loop_generation() != gen {
                return;
            }

            let mut buf = cb.read_buffer();
            if buf.capacity() == 0 {
                return self.fail_ssl_read(SocketError::bad_args(
                    "read_buffer() returned a buffer with no capacity",
                ));
            }
            let capacity = buf.capacity();

            match self.perform_ssl_read(&mut buf) {
                SslReadOutcome::Data(n) => {
                    self.sock.note_app_bytes_received(n as u64);
                    let filled = n == capacity;
                    cb.read_data_available(self, buf);
                    if !filled {
                        return;
                    }
                }
                SslReadOutcome::Blocked => return,
                SslReadOutcome::Eof => {
                    self.ssl_state = SslState::RemoteClosed;
                    self.sock.set_read_shut();
                    if !self
                        .sock
                        .update_event_registration(EventFlags::NONE, EventFlags::READ)
                    {
                        self.sync_from_base();
                        return;
                    }
                    let Some(cb) = self.sock.take_read_callback() else {
                        return;
                    };
                    cb.read_eof(self);
                    return;
                }
                SslReadOutcome::Err(ex) => return self.fail_ssl_read(ex),
            }

            num_reads += 1;
            let cap = self.sock.max_reads_per_event();
            if cap != 0 && num_reads >= cap {
                return;
            }
        }
    }

    fn perform_ssl_read(&mut self, buf: &mut BytesMut) -> SslReadOutcome {
        let start = buf.len();
        let want = buf.capacity() - start;
        buf.resize(start + want, 0);

        let res = {
            let (engine, mut wire) = borrow_engine_wire(
                &mut self.engine,
                self.sock.fd(),
                &mut self.raw_bytes_written,
                &mut self.raw_bytes_received,
                self.min_eor_raw_byte_no,
                &mut self.monitor,
            );
            engine.read(&mut wire, &mut buf[start..])
        };

        let outcome = match res {
            Ok(TlsPoll::Ready(0)) => {
                buf.truncate(start);
                SslReadOutcome::Blocked
            }
            Ok(TlsPoll::Ready(n)) => {
                buf.truncate(start + n);
                SslReadOutcome::Data(n)
            }
            Ok(TlsPoll::WantRead) => {
                buf.truncate(start);
                SslReadOutcome::Blocked
            }
            Ok(TlsPoll::WantWrite) => {
                buf.truncate(start);
                // The engine has pending output to flush before it can make
                // read progress.
                self.sock
                    .update_event_registration(EventFlags::WRITE, EventFlags::NONE);
                SslReadOutcome::Blocked
            }
            Ok(TlsPoll::WantSessionLookup) | Ok(TlsPoll::WantAsyncKey) => {
                buf.truncate(start);
                SslReadOutcome::Err(
                    self.sock
                        .addr_err_internal("unexpected engine pause during established read"),
                )
            }
            Ok(TlsPoll::Closed) => {
                buf.truncate(start);
                SslReadOutcome::Eof
            }
            Err(fault) => {
                buf.truncate(start);
                SslReadOutcome::Err(SocketError::ssl(fault.code, self.sock.with_addr(&fault.msg)))
            }
        };

        // A renegotiation record may have arrived inside this read's recv;
        // surface it now rather than waiting for the next event.
        if matches!(outcome, SslReadOutcome::Blocked) && self.monitor.renegotiation_seen() {
            return SslReadOutcome::Err(self.renegotiation_error());
        }
        outcome
    }

    fn renegotiation_error(&mut self) -> SocketError {
        self.renegotiate_attempted = true;
        metrics::RENEGOTIATIONS_REJECTED.increment();
        SocketError::ssl(
            ssl_code::CLIENT_RENEGOTIATION_ATTEMPT,
            self.sock.with_addr("client renegotiation attempt"),
        )
    }

    // ── Established-phase write ─────────────────────────────────────

    fn ssl_write_impl(
        &mut self,
        callback: Option<Rc<dyn WriteCallback>>,
        ops: Vec<Bytes>,
        flags: WriteFlags,
    ) {
        if self.sock.writes_barred() {
            return self.ssl_invalid_state_write(callback);
        }
        match self.ssl_state {
            SslState::Established | SslState::RemoteClosed => {}
            SslState::Connecting if self.sock.state() == SocketState::Connecting => {
                // TCP still connecting: queue now, drain after the
                // handshake completes.
                self.sock
                    .write_queue_mut()
                    .push(WriteRequest::new(callback, ops, flags));
                metrics::WRITES_QUEUED.increment();
                return;
            }
            _ => {
                let ex = SocketError::ssl(
                    ssl_code::EARLY_WRITE,
                    self.sock
                        .with_addr("attempt to write before SSL handshake completed"),
                );
                return self.fail_ssl_write_unqueued(callback, ex);
            }
        }
        if self.sock.state() != SocketState::Established {
            return self.ssl_invalid_state_write(callback);
        }

        if self.sock.write_queue().is_empty() {
            if ops.is_empty() {
                if let Some(cb) = callback {
                    cb.write_success(self);
                }
                return;
            }
            self.sock
                .write_queue_mut()
                .push(WriteRequest::new(callback, ops, flags));
            metrics::WRITES_QUEUED.increment();
            // Queue was empty, so this drives an immediate attempt and
            // registers write interest on partial progress.
            self.handle_ssl_write();
        } else {
            self.sock
                .write_queue_mut()
                .push(WriteRequest::new(callback, ops, flags));
            metrics::WRITES_QUEUED.increment();
        }
    }

    fn handle_ssl_write(&mut self) {
        debug_assert!(self.sock.state() == SocketState::Established);
        let gen = self.sock.loop_generation();
        while !self.sock.write_queue().is_empty() && self.sock.loop_generation() == gen {
            let head_flags = self.sock.write_queue().head().expect("non-empty").flags();
            match self.perform_ssl_write_head(head_flags) {
                Err(ex) => return self.fail_ssl_write_head(ex),
                Ok(true) => {
                    let req = self.sock.write_queue_mut().pop().expect("non-empty");
                    metrics::WRITES_COMPLETED.increment();
                    if self.sock.write_queue().is_empty() {
                        if self.sock.event_flags().contains(EventFlags::WRITE) {
                            if !self
                                .sock
                                .update_event_registration(EventFlags::NONE, EventFlags::WRITE)
                            {
                                self.sync_from_base();
                                return;
                            }
                            self.sock.cancel_send_timeout();
                        }
                        self.sock.promote_write_pending();
                        self.sync_from_base();
                    }
                    let (cb, _) = req.into_parts();
                    if let Some(cb) = cb {
                        cb.write_success(self);
                    }
                }
                Ok(false) => {
                    if !self.sock.event_flags().contains(EventFlags::WRITE)
                        && !self
                            .sock
                            .update_event_registration(EventFlags::WRITE, EventFlags::NONE)
                    {
                        self.sync_from_base();
                        return;
                    }
                    if !self.sock.arm_send_timeout() {
                        let ex = self
                            .sock
                            .addr_err_internal("failed to reschedule write timeout");
                        return self.fail_ssl_write_head(ex);
                    }
                    return;
                }
            }
        }
    }

    /// Push the head request through the engine. `Ok(true)` when the head
    /// is fully drained (caller pops it), `Ok(false)` when blocked.
    fn perform_ssl_write_head(&mut self, flags: WriteFlags) -> Result<bool, SocketError> {
        loop {
            let (op, remaining_ops) = {
                let head = self.sock.write_queue().head().expect("non-empty");
                if head.remaining_ops() == 0 {
                    return Ok(true);
                }
                (head.current_ops()[0].clone(), head.remaining_ops())
            };
            let eor =
                self.eor_tracking && flags.contains(WriteFlags::EOR) && remaining_ops == 1;
            match self.eor_aware_ssl_write(&op, eor)? {
                SslWriteOutcome::Blocked => return Ok(false),
                SslWriteOutcome::Written(n) => {
                    if n == op.len() {
                        if remaining_ops == 1 {
                            return Ok(true);
                        }
                        self.sock
                            .write_queue_mut()
                            .head_mut()
                            .expect("non-empty")
                            .consume(1, 0, n);
                    } else {
                        self.sock
                            .write_queue_mut()
                            .head_mut()
                            .expect("non-empty")
                            .consume(0, n, n);
                    }
                }
            }
        }
    }

    /// One engine write, registering the EOR cursors when this buffer ends
    /// a flagged application record. Only one app-EOR can be in flight.
    fn eor_aware_ssl_write(
        &mut self,
        buf: &Bytes,
        eor: bool,
    ) -> Result<SslWriteOutcome, SocketError> {
        if eor && self.min_eor_raw_byte_no.is_none() {
            self.app_eor_byte_no = Some(self.sock.app_bytes_written() + buf.len() as u64);
            let wire_size = self
                .engine
                .as_ref()
                .expect("established")
                .wire_size_of_record(buf.len());
            self.min_eor_raw_byte_no = Some(self.raw_bytes_written + wire_size as u64);
        }

        let res = {
            let (engine, mut wire) = borrow_engine_wire(
                &mut self.engine,
                self.sock.fd(),
                &mut self.raw_bytes_written,
                &mut self.raw_bytes_received,
                self.min_eor_raw_byte_no,
                &mut self.monitor,
            );
            engine.write(&mut wire, &buf[..])
        };

        match res {
            Ok(TlsPoll::Ready(0)) => Ok(SslWriteOutcome::Blocked),
            Ok(TlsPoll::Ready(n)) => {
                self.sock.note_app_bytes_written(n as u64);
                if let Some(min) = self.min_eor_raw_byte_no {
                    if self.raw_bytes_written >= min {
                        self.min_eor_raw_byte_no = None;
                        self.app_eor_byte_no = None;
                    }
                }
                Ok(SslWriteOutcome::Written(n))
            }
            Ok(TlsPoll::WantWrite) => Ok(SslWriteOutcome::Blocked),
            Ok(TlsPoll::WantRead) => Err(SocketError::ssl(
                ssl_code::INVALID_RENEGOTIATION,
                self.sock
                    .with_addr("TLS write demanded a read; renegotiation is not supported"),
            )),
            Ok(TlsPoll::WantSessionLookup) | Ok(TlsPoll::WantAsyncKey) => Err(self
                .sock
                .addr_err_internal("unexpected engine pause during established write")),
            Ok(TlsPoll::Closed) => Err(SocketError::end_of_file(
                self.sock.with_addr("TLS connection closed during write"),
            )),
            Err(fault) => Err(SocketError::ssl(
                fault.code,
                self.sock.with_addr(&fault.msg),
            )),
        }
    }

    // ── SNI / sessions / ClientHello ────────────────────────────────

    /// Swap the active context mid-handshake after an SNI policy decision.
    /// Server mode, before completion, only.
    pub fn switch_server_ssl_context(&mut self, ctx: Rc<dyn TlsContext>) -> Result<(), TlsFault> {
        if !self.server || self.handshake_complete {
            return Err(TlsFault::new(
                0,
                "SSL context switch is only valid during a server handshake",
            ));
        }
        if let Some(engine) = &mut self.engine {
            engine.use_context(ctx.as_ref())?;
        }
        self.handshake_ctx = Some(ctx);
        Ok(())
    }

    /// The SNI server name seen (server) or sent (client), if any.
    pub fn ssl_server_name(&self) -> Option<String> {
        self.engine.as_ref().and_then(|e| e.server_name())
    }

    /// Inject a session for resumption. The socket shares ownership with
    /// the engine through the `Arc`.
    pub fn set_ssl_session(&mut self, session: Arc<dyn TlsSession>) {
        if let Some(engine) = &mut self.engine {
            let _ = engine.set_session(session.clone());
        }
        self.session = Some(session);
    }

    /// The negotiated session, for caching.
    pub fn ssl_session(&self) -> Option<Arc<dyn TlsSession>> {
        self.engine
            .as_ref()
            .and_then(|e| e.session())
            .or_else(|| self.session.clone())
    }

    /// Whether the peer accepted the session offered via
    /// [`AsyncSslSocket::set_ssl_session`].
    pub fn ssl_session_reused(&self) -> bool {
        self.engine
            .as_ref()
            .map(|e| e.session_reused())
            .unwrap_or(false)
    }

    /// Whether the session was resumed via session ID.
    pub fn session_id_resumed(&self) -> bool {
        self.session_id_resumed
    }

    /// Record session-ID resumption (server-side cache bookkeeping).
    pub fn set_session_id_resumed(&mut self, resumed: bool) {
        self.session_id_resumed = resumed;
    }

    /// Negotiated cipher name, or `None` before completion.
    pub fn negotiated_cipher_name(&self) -> Option<String> {
        self.engine.as_ref().and_then(|e| e.negotiated_cipher())
    }

    /// Negotiated protocol version code, or `None` before completion.
    pub fn ssl_version(&self) -> Option<u16> {
        self.engine.as_ref().and_then(|e| e.version())
    }

    /// Application protocol selected by NPN/ALPN, if any.
    pub fn selected_next_protocol(&self) -> Option<Vec<u8>> {
        self.engine.as_ref().and_then(|e| e.selected_protocol())
    }

    /// DER size of the peer certificate, 0 when none was presented.
    pub fn peer_cert_size(&self) -> usize {
        self.engine.as_ref().map(|e| e.peer_cert_size()).unwrap_or(0)
    }

    /// Capture the inbound ClientHello for telemetry/policy. Must be called
    /// before `ssl_accept` to observe the full hello.
    pub fn enable_client_hello_parsing(&mut self) {
        self.monitor.enable_parsing();
    }

    /// Rearm the ClientHello parser after a handshake restart.
    pub fn reset_client_hello_parsing(&mut self) {
        self.monitor.reset_parsing();
    }

    /// Parsed ClientHello fields, when capture is enabled and a complete
    /// hello has been seen.
    pub fn client_hello_info(&self) -> Option<&ClientHelloInfo> {
        self.monitor.parsed_info()
    }

    /// The client's advertised cipher suites in its preference order; known
    /// suites by name, unknown ones as 4-hex-digit codes, `:`-separated.
    /// Empty when parsing is off or no hello has been captured.
    pub fn ssl_client_ciphers(&self) -> String {
        match self.monitor.parsed_info() {
            Some(info) => render_cipher_suites(&info.cipher_suites),
            None => String::new(),
        }
    }

    /// The client's compression methods, `:`-separated.
    pub fn ssl_client_compression_methods(&self) -> String {
        match self.monitor.parsed_info() {
            Some(info) => info
                .compression_methods
                .iter()
                .map(|m| m.to_string())
                .collect::<Vec<_>>()
                .join(":"),
            None => String::new(),
        }
    }

    /// The client's extension types in the order seen, `:`-separated.
    pub fn ssl_client_extensions(&self) -> String {
        match self.monitor.parsed_info() {
            Some(info) => info
                .extensions
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(":"),
            None => String::new(),
        }
    }

    // ── Failure machinery ───────────────────────────────────────────

    fn fail_handshake(&mut self, ex: SocketError) {
        metrics::HANDSHAKES_FAILED.increment();
        self.handshake_timeout.cancel();
        self.ssl_state = SslState::Error;
        self.tcp_bridge = None;
        if self.sock.state() != SocketState::Error {
            self.sock.start_fail();
        }
        if let Some(cb) = self.handshake_callback.take() {
            cb.handshake_error(self, ex.clone());
        }
        if let Some(cb) = self.user_connect_cb.take() {
            cb.connect_error(self, ex);
        }
        self.ssl_finish_fail();
    }

    fn fail_ssl_read(&mut self, ex: SocketError) {
        self.ssl_state = SslState::Error;
        if self.sock.state() != SocketState::Error {
            self.sock.start_fail();
        }
        if let Some(cb) = self.sock.take_read_callback() {
            cb.read_error(self, ex);
        }
        self.ssl_finish_fail();
    }

    fn fail_ssl_write_head(&mut self, ex: SocketError) {
        self.ssl_state = SslState::Error;
        if self.sock.state() != SocketState::Error {
            self.sock.start_fail();
        }
        if let Some(req) = self.sock.write_queue_mut().pop() {
            metrics::WRITES_FAILED.increment();
            let (cb, bytes_written) = req.into_parts();
            if let Some(cb) = cb {
                cb.write_error(self, bytes_written, ex);
            }
        }
        self.ssl_finish_fail();
    }

    fn fail_ssl_write_unqueued(
        &mut self,
        callback: Option<Rc<dyn WriteCallback>>,
        ex: SocketError,
    ) {
        metrics::WRITES_FAILED.increment();
        self.ssl_state = SslState::Error;
        if self.sock.state() != SocketState::Error {
            self.sock.start_fail();
        }
        if let Some(cb) = callback {
            cb.write_error(self, 0, ex);
        }
        self.ssl_finish_fail();
    }

    /// Notify every remaining installed callback, exactly once each, with
    /// this socket as the transport.
    fn ssl_finish_fail(&mut self) {
        self.handshake_timeout.cancel();
        let ex = self.sock.addr_err_internal("socket closing after error");
        if let Some(cb) = self.handshake_callback.take() {
            cb.handshake_error(self, ex.clone());
        }
        if let Some(cb) = self.sock.take_connect_callback() {
            cb.connect_error(self, ex.clone());
        }
        if let Some(cb) = self.user_connect_cb.take() {
            cb.connect_error(self, ex.clone());
        }
        while let Some(req) = self.sock.write_queue_mut().pop() {
            metrics::WRITES_FAILED.increment();
            let (cb, bytes_written) = req.into_parts();
            if let Some(cb) = cb {
                cb.write_error(self, bytes_written, ex.clone());
            }
        }
        if let Some(cb) = self.sock.take_read_callback() {
            cb.read_error(self, ex);
        }
    }

    fn invalid_state_handshake(&mut self, callback: Option<Rc<dyn HandshakeCallback>>) {
        metrics::HANDSHAKES_FAILED.increment();
        let ex = SocketError::internal(
            self.sock
                .with_addr("handshake requested with socket in invalid state"),
        );
        if matches!(self.sock.state(), SocketState::Closed | SocketState::Error) {
            if let Some(cb) = callback {
                cb.handshake_error(self, ex);
            }
        } else {
            self.ssl_state = SslState::Error;
            self.sock.start_fail();
            if let Some(cb) = callback {
                cb.handshake_error(self, ex);
            }
            self.ssl_finish_fail();
        }
    }

    fn ssl_invalid_state_write(&mut self, callback: Option<Rc<dyn WriteCallback>>) {
        let ex = SocketError::not_open(
            self.sock
                .with_addr("write() called with socket in invalid state"),
        );
        if matches!(self.sock.state(), SocketState::Closed | SocketState::Error) {
            if let Some(cb) = callback {
                cb.write_error(self, 0, ex);
            }
        } else {
            self.ssl_state = SslState::Error;
            self.sock.start_fail();
            if let Some(cb) = callback {
                cb.write_error(self, 0, ex);
            }
            self.ssl_finish_fail();
        }
    }

    fn sync_from_base(&mut self) {
        match self.sock.state() {
            SocketState::Error => {
                self.ssl_state = SslState::Error;
            }
            SocketState::Closed => {
                if self.ssl_state != SslState::Error {
                    self.ssl_state = SslState::Closed;
                }
            }
            _ => {}
        }
    }
}

impl AsyncTransport for AsyncSslSocket {
    fn write(&mut self, callback: Option<Rc<dyn WriteCallback>>, buf: &[u8], flags: WriteFlags) {
        let ops = if buf.is_empty() {
            Vec::new()
        } else {
            vec![Bytes::copy_from_slice(buf)]
        };
        self.ssl_write_impl(callback, ops, flags);
    }

    fn writev(&mut self, callback: Option<Rc<dyn WriteCallback>>, bufs: &[&[u8]], flags: WriteFlags) {
        let ops = bufs
            .iter()
            .filter(|b| !b.is_empty())
            .map(|b| Bytes::copy_from_slice(b))
            .collect();
        self.ssl_write_impl(callback, ops, flags);
    }

    fn write_chain(
        &mut self,
        callback: Option<Rc<dyn WriteCallback>>,
        chain: BufferChain,
        flags: WriteFlags,
    ) {
        self.ssl_write_impl(callback, chain.into_ops(), flags);
    }

    fn set_read_callback(&mut self, callback: Option<Rc<dyn ReadCallback>>) {
        self.sock.set_read_callback(callback);
        self.sync_from_base();
        if self.ssl_state == SslState::Established && self.sock.read_callback_installed() {
            self.check_for_immediate_read();
        }
    }

    fn close(&mut self) {
        if self.sock.write_queue().is_empty()
            || !matches!(
                self.sock.state(),
                SocketState::Connecting | SocketState::Established
            )
        {
            return self.close_now();
        }

        self.ssl_state = match self.ssl_state {
            SslState::Connecting | SslState::ConnectingClosing => SslState::ConnectingClosing,
            _ => SslState::Closing,
        };
        self.sock.latch_close_pending();
        if self.sock.read_callback_installed() {
            if !self
                .sock
                .update_event_registration(EventFlags::NONE, EventFlags::READ)
            {
                self.sync_from_base();
                return;
            }
            if let Some(cb) = self.sock.take_read_callback() {
                cb.read_eof(self);
            }
        }
    }

    fn close_now(&mut self) {
        match self.ssl_state {
            SslState::Accepting
            | SslState::Connecting
            | SslState::CacheLookup
            | SslState::KeyOpPending => {
                self.handshake_timeout.cancel();
                self.ssl_state = SslState::Closed;
                self.tcp_bridge = None;
                if let Some(cb) = self.handshake_callback.take() {
                    let ex = SocketError::end_of_file(
                        self.sock.with_addr("SSL handshake aborted by local close"),
                    );
                    cb.handshake_error(self, ex);
                }
            }
            SslState::Closed | SslState::Error => {}
            _ => {
                self.ssl_state = SslState::Closed;
            }
        }

        // Base teardown, with callbacks drained here so they observe this
        // socket as their transport.
        let connect_cb = self.sock.take_connect_callback();
        let user_connect_cb = self.user_connect_cb.take();
        let read_cb = self.sock.take_read_callback();
        let mut requests: Vec<WriteRequest> = Vec::new();
        while let Some(req) = self.sock.write_queue_mut().pop() {
            requests.push(req);
        }
        self.sock.close_now();

        let ex = SocketError::end_of_file("socket closed locally");
        if let Some(cb) = connect_cb {
            cb.connect_error(self, ex.clone());
        }
        if let Some(cb) = user_connect_cb {
            cb.connect_error(self, ex.clone());
        }
        for req in requests {
            metrics::WRITES_FAILED.increment();
            let (cb, bytes_written) = req.into_parts();
            if let Some(cb) = cb {
                cb.write_error(self, bytes_written, ex.clone());
            }
        }
        if let Some(cb) = read_cb {
            cb.read_eof(self);
        }
    }

    fn close_with_reset(&mut self) {
        if self.sock.fd() >= 0 {
            let opt = libc::linger {
                l_onoff: 1,
                l_linger: 0,
            };
            unsafe {
                libc::setsockopt(
                    self.sock.fd(),
                    libc::SOL_SOCKET,
                    libc::SO_LINGER,
                    &opt as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::linger>() as libc::socklen_t,
                );
            }
        }
        self.close_now();
    }

    fn shutdown_write(&mut self) {
        if self.sock.write_queue().is_empty() {
            return self.shutdown_write_now();
        }
        self.sock.latch_write_pending();
    }

    fn shutdown_write_now(&mut self) {
        if self
            .sock
            .shutdown_flags()
            .contains(ShutdownFlags::WRITE_SHUT)
        {
            return;
        }
        if self
            .sock
            .shutdown_flags()
            .contains(ShutdownFlags::READ_SHUT)
        {
            return self.close_now();
        }

        // Drain the queue first so the failures observe this socket; no TLS
        // close_notify is sent (plain TCP half-close only).
        let mut requests: Vec<WriteRequest> = Vec::new();
        while let Some(req) = self.sock.write_queue_mut().pop() {
            requests.push(req);
        }
        self.sock.shutdown_write_now();
        self.sync_from_base();

        let ex = SocketError::end_of_file("socket shutdown for writes");
        for req in requests {
            metrics::WRITES_FAILED.increment();
            let (cb, bytes_written) = req.into_parts();
            if let Some(cb) = cb {
                cb.write_error(self, bytes_written, ex.clone());
            }
        }
    }

    fn good(&self) -> bool {
        matches!(
            self.ssl_state,
            SslState::Uninit
                | SslState::Accepting
                | SslState::CacheLookup
                | SslState::KeyOpPending
                | SslState::Connecting
                | SslState::Established
        ) && self.sock.good()
    }

    fn error(&self) -> bool {
        self.ssl_state == SslState::Error || self.sock.error()
    }

    fn connecting(&self) -> bool {
        self.sock.connecting()
            || matches!(
                self.ssl_state,
                SslState::Accepting
                    | SslState::CacheLookup
                    | SslState::KeyOpPending
                    | SslState::Connecting
            )
    }

    fn readable(&self) -> bool {
        // Plaintext already decrypted inside the engine counts as readable
        // even when the kernel buffer is empty.
        let engine_pending = self
            .engine
            .as_ref()
            .map(|e| e.pending_plaintext() > 0)
            .unwrap_or(false);
        engine_pending || self.sock.readable()
    }

    fn hangup(&self) -> bool {
        self.sock.hangup()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.sock.local_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.sock.peer_addr()
    }

    fn app_bytes_written(&self) -> u64 {
        self.sock.app_bytes_written()
    }

    fn app_bytes_received(&self) -> u64 {
        self.sock.app_bytes_received()
    }

    fn set_send_timeout(&mut self, ms: u32) {
        self.sock.set_send_timeout(ms);
    }

    fn attach_reactor(&mut self, reactor: Rc<dyn Reactor>) {
        self.sock.attach_reactor(reactor.clone());
        self.handshake_timeout.attach(reactor);
    }

    fn detach_reactor(&mut self) {
        debug_assert!(self.is_detachable());
        self.sock.detach_reactor();
        self.handshake_timeout.detach();
    }

    fn is_detachable(&self) -> bool {
        self.sock.is_detachable() && !self.handshake_timeout.is_scheduled()
    }
}

/// Split disjoint borrows of the engine and its wire surface out of the
/// socket's fields.
fn borrow_engine_wire<'a>(
    engine: &'a mut Option<Box<dyn TlsEngine>>,
    fd: RawFd,
    raw_bytes_written: &'a mut u64,
    raw_bytes_received: &'a mut u64,
    min_eor_raw_byte_no: Option<u64>,
    monitor: &'a mut RecordMonitor,
) -> (&'a mut dyn TlsEngine, SocketWire<'a>) {
    let engine = engine.as_mut().expect("TLS engine installed").as_mut();
    let wire = SocketWire {
        fd,
        raw_bytes_written,
        raw_bytes_received,
        min_eor_raw_byte_no,
        monitor,
    };
    (engine, wire)
}
