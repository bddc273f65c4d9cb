//! Integration tests for the TLS socket, driven by a scripted engine.
//!
//! The engine speaks a toy null-cipher protocol over real TLS record
//! framing (so the socket's record monitor sees genuine headers): handshake
//! flights and application data travel as type-22/type-23 records with the
//! payload in the clear. The test side of each socketpair writes raw record
//! bytes directly, playing the role of the remote peer.

mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use common::*;
use wireline::{
    AsyncSslSocket, AsyncTransport, EventFlags, HandshakeIo, IoOutcome, Reactor, SocketError,
    SslState, TlsContext, TlsEngine, TlsFault, TlsPoll, TlsResult, TlsSession, VerifyMode,
    VerifyPeer, WireIo, WriteFlags,
};

const RECORD_HANDSHAKE: u8 = 22;
const RECORD_APP_DATA: u8 = 23;

fn record(content_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![content_type, 3, 3];
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// A synthesized ClientHello wrapped in handshake records of at most
/// `record_cap` payload bytes each.
fn client_hello_records(suites: &[u16], record_cap: usize) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0x5A; 32]);
    body.push(0);
    body.extend_from_slice(&((suites.len() * 2) as u16).to_be_bytes());
    for s in suites {
        body.extend_from_slice(&s.to_be_bytes());
    }
    body.push(1);
    body.push(0); // null compression
    body.extend_from_slice(&8u16.to_be_bytes()); // two empty extensions
    body.extend_from_slice(&0x0000u16.to_be_bytes());
    body.extend_from_slice(&0u16.to_be_bytes());
    body.extend_from_slice(&0x0010u16.to_be_bytes());
    body.extend_from_slice(&0u16.to_be_bytes());

    let mut msg = vec![1u8];
    msg.extend_from_slice(&[
        ((body.len() >> 16) & 0xff) as u8,
        ((body.len() >> 8) & 0xff) as u8,
        (body.len() & 0xff) as u8,
    ]);
    msg.extend_from_slice(&body);

    let mut out = Vec::new();
    for chunk in msg.chunks(record_cap) {
        out.extend_from_slice(&record(RECORD_HANDSHAKE, chunk));
    }
    out
}

#[derive(Default)]
struct FakeSession;

impl TlsSession for FakeSession {
    fn as_any(&self) -> &(dyn std::any::Any + Send + Sync) {
        self
    }
}

/// Scripted engine over the toy record protocol.
struct FakeEngine {
    server: bool,
    complete: bool,
    hello_sent: bool,
    hello_buf: Vec<u8>,
    inbuf: Vec<u8>,
    pending: Vec<u8>,
    outbuf: Vec<u8>,
    eof: bool,
    session: Option<Arc<dyn TlsSession>>,
    session_offered: bool,
    pause_for_lookup: bool,
    paused_once: bool,
    verify: Option<VerifyMode>,
}

impl FakeEngine {
    fn new(server: bool, pause_for_lookup: bool) -> Self {
        FakeEngine {
            server,
            complete: false,
            hello_sent: false,
            hello_buf: Vec::new(),
            inbuf: Vec::new(),
            pending: Vec::new(),
            outbuf: Vec::new(),
            eof: false,
            session: None,
            session_offered: false,
            pause_for_lookup,
            paused_once: false,
            verify: None,
        }
    }

    fn drain_wire(&mut self, wire: &mut dyn WireIo) -> Result<(), TlsFault> {
        let mut chunk = [0u8; 4096];
        loop {
            match wire.recv(&mut chunk) {
                IoOutcome::Done(0) => {
                    self.eof = true;
                    return Ok(());
                }
                IoOutcome::Done(n) => self.inbuf.extend_from_slice(&chunk[..n]),
                IoOutcome::WouldBlock => return Ok(()),
                IoOutcome::Err(errno) => {
                    return Err(TlsFault::new(errno, "wire recv failed"));
                }
            }
        }
    }

    fn flush(&mut self, wire: &mut dyn WireIo) -> Result<bool, TlsFault> {
        while !self.outbuf.is_empty() {
            match wire.send(&self.outbuf) {
                IoOutcome::Done(n) => {
                    self.outbuf.drain(..n);
                }
                IoOutcome::WouldBlock => return Ok(false),
                IoOutcome::Err(errno) => return Err(TlsFault::new(errno, "wire send failed")),
            }
        }
        Ok(true)
    }

    fn has_complete_record(&self) -> bool {
        self.inbuf.len() >= 5
            && self.inbuf.len() >= 5 + u16::from_be_bytes([self.inbuf[3], self.inbuf[4]]) as usize
    }

    fn take_record(&mut self) -> (u8, Vec<u8>) {
        let content_type = self.inbuf[0];
        let len = u16::from_be_bytes([self.inbuf[3], self.inbuf[4]]) as usize;
        let payload = self.inbuf[5..5 + len].to_vec();
        self.inbuf.drain(..5 + len);
        (content_type, payload)
    }

    /// Move complete application-data records into the plaintext buffer.
    fn absorb_records(&mut self) {
        while self.has_complete_record() {
            let (content_type, payload) = self.take_record();
            if content_type == RECORD_APP_DATA {
                self.pending.extend_from_slice(&payload);
            }
        }
    }

    /// Bytes needed for the complete hello message (4-byte header + body),
    /// or `usize::MAX` while the header is still incomplete.
    fn hello_bytes_needed(&self) -> usize {
        if self.hello_buf.len() < 4 {
            return usize::MAX;
        }
        4 + (((self.hello_buf[1] as usize) << 16)
            | ((self.hello_buf[2] as usize) << 8)
            | self.hello_buf[3] as usize)
    }
}

impl TlsEngine for FakeEngine {
    fn accept(&mut self, io: &mut HandshakeIo<'_>) -> TlsResult<()> {
        assert!(self.server);
        assert!(self.verify.is_some(), "verify mode installed before accept");
        if self.pause_for_lookup && !self.paused_once && self.session.is_none() {
            self.paused_once = true;
            return Ok(TlsPoll::WantSessionLookup);
        }
        if !self.flush(io.wire)? {
            return Ok(TlsPoll::WantWrite);
        }
        self.drain_wire(io.wire)?;
        // Reassemble the hello message across however many records carry it;
        // later records (e.g. early app data) stay buffered.
        while self.hello_buf.len() < self.hello_bytes_needed() && self.has_complete_record() {
            let (content_type, payload) = self.take_record();
            if content_type != RECORD_HANDSHAKE {
                return Err(TlsFault::new(10, "unexpected record during accept"));
            }
            self.hello_buf.extend_from_slice(&payload);
        }
        if self.hello_buf.len() < self.hello_bytes_needed() {
            return if self.eof {
                Ok(TlsPoll::Closed)
            } else {
                Ok(TlsPoll::WantRead)
            };
        }
        if let Some(verifier) = io.verifier.as_mut() {
            let cert = wireline::PeerCertInfo {
                subject: "CN=test-peer".to_string(),
                depth: 0,
            };
            if !verifier.verify(true, &cert) {
                return Err(TlsFault::new(47, "certificate verify failed"));
            }
        }
        self.outbuf = record(RECORD_HANDSHAKE, b"SERVERHELLO");
        if !self.flush(io.wire)? {
            return Ok(TlsPoll::WantWrite);
        }
        self.complete = true;
        self.absorb_records();
        Ok(TlsPoll::Ready(()))
    }

    fn connect(&mut self, io: &mut HandshakeIo<'_>) -> TlsResult<()> {
        assert!(!self.server);
        if !self.hello_sent {
            self.outbuf = record(RECORD_HANDSHAKE, b"CLIENTHELLO");
            self.hello_sent = true;
        }
        if !self.flush(io.wire)? {
            return Ok(TlsPoll::WantWrite);
        }
        self.drain_wire(io.wire)?;
        if !self.has_complete_record() {
            return if self.eof {
                Ok(TlsPoll::Closed)
            } else {
                Ok(TlsPoll::WantRead)
            };
        }
        let (content_type, _flight) = self.take_record();
        if content_type != RECORD_HANDSHAKE {
            return Err(TlsFault::new(10, "unexpected record during connect"));
        }
        self.complete = true;
        self.absorb_records();
        Ok(TlsPoll::Ready(()))
    }

    fn read(&mut self, wire: &mut dyn WireIo, buf: &mut [u8]) -> TlsResult<usize> {
        self.drain_wire(wire)?;
        self.absorb_records();
        if self.pending.is_empty() {
            return if self.eof {
                Ok(TlsPoll::Closed)
            } else {
                Ok(TlsPoll::WantRead)
            };
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(TlsPoll::Ready(n))
    }

    fn write(&mut self, wire: &mut dyn WireIo, buf: &[u8]) -> TlsResult<usize> {
        if !self.flush(wire)? {
            return Ok(TlsPoll::WantWrite);
        }
        self.outbuf = record(RECORD_APP_DATA, buf);
        self.flush(wire)?;
        Ok(TlsPoll::Ready(buf.len()))
    }

    fn pending_plaintext(&self) -> usize {
        self.pending.len()
    }

    fn wire_size_of_record(&self, plaintext_len: usize) -> usize {
        plaintext_len + 5
    }

    fn set_verify(&mut self, mode: VerifyMode) {
        self.verify = Some(mode);
    }

    fn use_context(&mut self, _ctx: &dyn TlsContext) -> Result<(), TlsFault> {
        Ok(())
    }

    fn session(&self) -> Option<Arc<dyn TlsSession>> {
        if !self.complete {
            return None;
        }
        Some(
            self.session
                .clone()
                .unwrap_or_else(|| Arc::new(FakeSession)),
        )
    }

    fn set_session(&mut self, session: Arc<dyn TlsSession>) -> Result<(), TlsFault> {
        self.session = Some(session);
        self.session_offered = true;
        Ok(())
    }

    fn session_reused(&self) -> bool {
        self.complete && self.session_offered
    }

    fn negotiated_cipher(&self) -> Option<String> {
        self.complete.then(|| "TLS_FAKE_WITH_NULL_NULL".to_string())
    }

    fn server_name(&self) -> Option<String> {
        None
    }

    fn version(&self) -> Option<u16> {
        self.complete.then_some(0x0303)
    }

    fn selected_protocol(&self) -> Option<Vec<u8>> {
        None
    }

    fn peer_cert_size(&self) -> usize {
        0
    }
}

/// Context producing scripted engines; records how many it created.
struct FakeCtx {
    pause_for_lookup: bool,
    default_verify: VerifyMode,
    engines_created: Cell<u32>,
}

impl FakeCtx {
    fn new() -> Rc<Self> {
        Rc::new(FakeCtx {
            pause_for_lookup: false,
            default_verify: VerifyMode::NoVerify,
            engines_created: Cell::new(0),
        })
    }

    fn pausing() -> Rc<Self> {
        Rc::new(FakeCtx {
            pause_for_lookup: true,
            default_verify: VerifyMode::NoVerify,
            engines_created: Cell::new(0),
        })
    }
}

impl TlsContext for FakeCtx {
    fn new_engine(&self, server: bool) -> Box<dyn TlsEngine> {
        self.engines_created.set(self.engines_created.get() + 1);
        Box::new(FakeEngine::new(server, self.pause_for_lookup))
    }

    fn default_verify(&self) -> VerifyMode {
        self.default_verify
    }
}

/// Handshake callback recording outcomes and optionally vetoing the peer.
#[derive(Default)]
struct RecordingHandshake {
    success: Cell<u32>,
    errors: RefCell<Vec<SocketError>>,
    verify_calls: Cell<u32>,
    veto_peer: Cell<bool>,
}

impl RecordingHandshake {
    fn new() -> Rc<Self> {
        Rc::new(RecordingHandshake::default())
    }
}

impl wireline::HandshakeCallback for RecordingHandshake {
    fn handshake_verify(&self, preverify_ok: bool, _cert: &wireline::PeerCertInfo) -> bool {
        self.verify_calls.set(self.verify_calls.get() + 1);
        if self.veto_peer.get() {
            false
        } else {
            preverify_ok
        }
    }

    fn handshake_success(&self, _sock: &mut dyn AsyncTransport) {
        self.success.set(self.success.get() + 1);
    }

    fn handshake_error(&self, _sock: &mut dyn AsyncTransport, err: SocketError) {
        self.errors.borrow_mut().push(err);
    }
}

fn reactor_pair() -> (Rc<SimReactor>, Rc<dyn Reactor>) {
    let sim = SimReactor::new();
    let dynr: Rc<dyn Reactor> = sim.clone();
    (sim, dynr)
}

/// Server socket + raw client fd with the handshake already driven to
/// completion.
fn established_server(
    ctx: Rc<FakeCtx>,
) -> (Rc<SimReactor>, AsyncSslSocket, i32, Rc<RecordingHandshake>) {
    let (sim, reactor) = reactor_pair();
    let (a, b) = socketpair_nonblocking();
    let mut ssl = AsyncSslSocket::from_fd(ctx, Some(reactor), a, true);
    let hs = RecordingHandshake::new();
    ssl.ssl_accept(Some(hs.clone()), 0, VerifyPeer::UseCtx);
    assert_eq!(ssl.ssl_state(), SslState::Accepting);

    write_all_fd(b, &client_hello_records(&[0x009C, 0xC02F], 4096));
    ssl.io_ready(EventFlags::READ);
    assert_eq!(hs.success.get(), 1);
    assert_eq!(ssl.ssl_state(), SslState::Established);
    // The server flight went out on the wire.
    assert_eq!(drain_fd(b), record(RECORD_HANDSHAKE, b"SERVERHELLO"));
    (sim, ssl, b, hs)
}

#[test]
fn server_accept_demands_read_then_completes() {
    let (sim, reactor) = reactor_pair();
    let (a, b) = socketpair_nonblocking();
    let ctx = FakeCtx::new();
    let mut ssl = AsyncSslSocket::from_fd(ctx, Some(reactor), a, true);

    let hs = RecordingHandshake::new();
    ssl.ssl_accept(Some(hs.clone()), 0, VerifyPeer::UseCtx);
    // Nothing on the wire yet: the engine demands a read.
    assert_eq!(ssl.ssl_state(), SslState::Accepting);
    assert!(sim.has_read_interest(a));
    assert!(ssl.connecting());

    write_all_fd(b, &client_hello_records(&[0x1301], 4096));
    ssl.io_ready(EventFlags::READ);

    assert_eq!(hs.success.get(), 1);
    assert!(hs.errors.borrow().is_empty());
    assert_eq!(ssl.ssl_state(), SslState::Established);
    assert_eq!(
        ssl.negotiated_cipher_name().as_deref(),
        Some("TLS_FAKE_WITH_NULL_NULL")
    );
    assert_eq!(ssl.ssl_version(), Some(0x0303));
    assert!(ssl.raw_bytes_received() > 0);
    assert!(ssl.raw_bytes_written() > 0);

    ssl.close_now();
    close_fd(b);
}

#[test]
fn client_hello_capture_renders_ciphers_and_extensions() {
    let (_sim, reactor) = reactor_pair();
    let (a, b) = socketpair_nonblocking();
    let ctx = FakeCtx::new();
    let mut ssl = AsyncSslSocket::from_fd(ctx, Some(reactor), a, true);
    ssl.enable_client_hello_parsing();

    let hs = RecordingHandshake::new();
    ssl.ssl_accept(Some(hs.clone()), 0, VerifyPeer::UseCtx);

    // Deliver the hello fragmented into tiny records, split across two
    // readiness events.
    let wire = client_hello_records(&[0x009C, 0xC02F, 0xABCD], 9);
    let split = wire.len() / 2;
    write_all_fd(b, &wire[..split]);
    ssl.io_ready(EventFlags::READ);
    assert_eq!(hs.success.get(), 0);
    write_all_fd(b, &wire[split..]);
    ssl.io_ready(EventFlags::READ);
    assert_eq!(hs.success.get(), 1);

    let rendered = ssl.ssl_client_ciphers();
    assert!(rendered.ends_with(":ABCD"), "got: {rendered}");
    assert!(rendered.starts_with("TLS_RSA_WITH_AES_128_GCM_SHA256:"));
    assert_eq!(ssl.ssl_client_compression_methods(), "0");
    assert_eq!(ssl.ssl_client_extensions(), "0:16");

    let info = ssl.client_hello_info().expect("captured");
    assert_eq!(info.cipher_suites, vec![0x009C, 0xC02F, 0xABCD]);

    ssl.close_now();
    close_fd(b);
}

#[test]
fn established_data_flows_both_ways() {
    let (_sim, mut ssl, b, _hs) = established_server(FakeCtx::new());

    let rcb = RecordingRead::new(4096);
    ssl.set_read_callback(Some(rcb.clone()));

    write_all_fd(b, &record(RECORD_APP_DATA, b"ping"));
    ssl.io_ready(EventFlags::READ);
    assert_eq!(rcb.data_concat(), b"ping");
    assert_eq!(ssl.app_bytes_received(), 4);

    let wcb = RecordingWrite::new();
    ssl.write(Some(wcb.clone()), b"pong", WriteFlags::NONE);
    assert_eq!(wcb.successes.get(), 1);
    assert_eq!(drain_fd(b), record(RECORD_APP_DATA, b"pong"));
    assert_eq!(ssl.app_bytes_written(), 4);

    ssl.close_now();
    close_fd(b);
}

#[test]
fn plaintext_buffered_with_the_handshake_is_delivered_immediately() {
    let (_sim, reactor) = reactor_pair();
    let (a, b) = socketpair_nonblocking();
    let mut ssl = AsyncSslSocket::from_fd(FakeCtx::new(), Some(reactor), a, true);

    let hs = RecordingHandshake::new();
    ssl.ssl_accept(Some(hs.clone()), 0, VerifyPeer::UseCtx);

    // Hello and early app data arrive glued in one read.
    let mut wire = client_hello_records(&[0x1301], 4096);
    wire.extend_from_slice(&record(RECORD_APP_DATA, b"early"));
    write_all_fd(b, &wire);
    ssl.io_ready(EventFlags::READ);
    assert_eq!(hs.success.get(), 1);

    // Installing the read callback drains the engine's buffered plaintext
    // without another readiness event.
    let rcb = RecordingRead::new(4096);
    ssl.set_read_callback(Some(rcb.clone()));
    assert_eq!(rcb.data_concat(), b"early");

    ssl.close_now();
    close_fd(b);
}

#[test]
fn renegotiation_attempt_fails_reads_with_code_900() {
    let (_sim, mut ssl, b, _hs) = established_server(FakeCtx::new());

    let rcb = RecordingRead::new(4096);
    ssl.set_read_callback(Some(rcb.clone()));

    // Normal traffic first.
    write_all_fd(b, &record(RECORD_APP_DATA, b"fine"));
    ssl.io_ready(EventFlags::READ);
    assert_eq!(rcb.data_concat(), b"fine");

    // A handshake-class record after completion is a renegotiation attempt.
    write_all_fd(b, &record(RECORD_HANDSHAKE, b"REHANDSHAKE"));
    ssl.io_ready(EventFlags::READ);

    let text = rcb.error_text().expect("read must fail");
    assert!(text.contains("900"), "got: {text}");
    assert!(text.contains("renegotiation"), "got: {text}");
    assert!(ssl.error());
    assert_eq!(ssl.ssl_state(), SslState::Error);

    close_fd(b);
}

#[test]
fn write_before_handshake_fails_with_code_902() {
    let (_sim, reactor) = reactor_pair();
    let (a, b) = socketpair_nonblocking();
    let mut ssl = AsyncSslSocket::from_fd(FakeCtx::new(), Some(reactor), a, true);

    let hs = RecordingHandshake::new();
    ssl.ssl_accept(Some(hs.clone()), 0, VerifyPeer::UseCtx);
    assert_eq!(ssl.ssl_state(), SslState::Accepting);

    let wcb = RecordingWrite::new();
    ssl.write(Some(wcb.clone()), b"too soon", WriteFlags::NONE);

    assert_eq!(wcb.error_count(), 1);
    let errors = wcb.errors.borrow();
    let (_, err) = &errors[0];
    assert_eq!(err.ssl_error_code(), Some(902));
    assert!(ssl.error());

    close_fd(b);
}

#[test]
fn handshake_timeout_reports_timed_out() {
    let (sim, reactor) = reactor_pair();
    let (a, b) = socketpair_nonblocking();
    let mut ssl = AsyncSslSocket::from_fd(FakeCtx::new(), Some(reactor), a, true);

    let hs = RecordingHandshake::new();
    ssl.ssl_accept(Some(hs.clone()), 50, VerifyPeer::UseCtx);
    assert_eq!(sim.live_timer_count(), 1);

    ssl.handshake_timeout_expired();

    let errors = hs.errors.borrow();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].to_string().contains("SSL accept timed out"));
    drop(errors);
    assert_eq!(ssl.ssl_state(), SslState::Error);

    close_fd(b);
}

#[test]
fn session_cache_lookup_pauses_and_restart_resumes() {
    let (sim, reactor) = reactor_pair();
    let (a, b) = socketpair_nonblocking();
    let mut ssl = AsyncSslSocket::from_fd(FakeCtx::pausing(), Some(reactor), a, true);

    let hs = RecordingHandshake::new();
    ssl.ssl_accept(Some(hs.clone()), 0, VerifyPeer::UseCtx);

    // The engine paused for an out-of-band session lookup; all interest is
    // dropped until the application restarts the accept.
    assert_eq!(ssl.ssl_state(), SslState::CacheLookup);
    assert!(!sim.has_read_interest(a));
    assert!(!sim.has_write_interest(a));

    write_all_fd(b, &client_hello_records(&[0x1301], 4096));
    ssl.set_ssl_session(Arc::new(FakeSession));
    ssl.restart_ssl_accept();

    assert_eq!(hs.success.get(), 1);
    assert_eq!(ssl.ssl_state(), SslState::Established);
    assert!(ssl.ssl_session_reused());
    assert!(ssl.ssl_session().is_some());

    ssl.close_now();
    close_fd(b);
}

#[test]
fn verify_hook_runs_and_can_veto_the_peer() {
    // Accepting with verification on: the callback's verdict is consulted.
    let (_sim, reactor) = reactor_pair();
    let (a, b) = socketpair_nonblocking();
    let mut ssl = AsyncSslSocket::from_fd(FakeCtx::new(), Some(reactor), a, true);

    let hs = RecordingHandshake::new();
    ssl.ssl_accept(Some(hs.clone()), 0, VerifyPeer::Verify);
    write_all_fd(b, &client_hello_records(&[0x1301], 4096));
    ssl.io_ready(EventFlags::READ);
    assert_eq!(hs.verify_calls.get(), 1);
    assert_eq!(hs.success.get(), 1);
    ssl.close_now();
    close_fd(b);

    // Same flow with a vetoing callback: the handshake fails.
    let (_sim, reactor) = reactor_pair();
    let (a, b) = socketpair_nonblocking();
    let mut ssl = AsyncSslSocket::from_fd(FakeCtx::new(), Some(reactor), a, true);

    let hs = RecordingHandshake::new();
    hs.veto_peer.set(true);
    ssl.ssl_accept(Some(hs.clone()), 0, VerifyPeer::Verify);
    write_all_fd(b, &client_hello_records(&[0x1301], 4096));
    ssl.io_ready(EventFlags::READ);

    assert_eq!(hs.success.get(), 0);
    let errors = hs.errors.borrow();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].to_string().contains("certificate verify failed"));
    drop(errors);
    assert!(ssl.error());

    close_fd(b);
}

#[test]
fn combined_connect_bridges_tcp_into_the_handshake() {
    let (sim, reactor) = reactor_pair();
    let (listener, addr) = loopback_listener();
    let mut ssl = AsyncSslSocket::new_client(FakeCtx::new(), Some(reactor));

    let ccb = RecordingConnect::new();
    ssl.connect(Some(ccb.clone()), addr, 5_000, &[], None);
    assert_eq!(ssl.ssl_state(), SslState::Connecting);
    assert!(ssl.connecting());
    // One combined timer covers TCP + TLS.
    assert_eq!(sim.live_timer_count(), 1);

    // TCP completes; the socket rolls straight into the TLS connect and
    // sends its hello.
    let peer = accept_one(listener);
    await_writable(ssl.plain_socket().fd());
    ssl.io_ready(EventFlags::WRITE);
    assert!(!ccb.succeeded(), "connect must wait for the handshake");

    await_readable(peer);
    assert_eq!(drain_fd(peer), record(RECORD_HANDSHAKE, b"CLIENTHELLO"));

    // Server flight arrives; handshake and the user's connect complete.
    write_all_fd(peer, &record(RECORD_HANDSHAKE, b"SERVERHELLO"));
    ssl.io_ready(EventFlags::READ);

    assert!(ccb.succeeded());
    assert_eq!(ssl.ssl_state(), SslState::Established);

    ssl.close_now();
    close_fd(peer);
    close_fd(listener);
}

#[test]
fn combined_connect_timeout_fails_the_connect_callback() {
    let (_sim, reactor) = reactor_pair();
    let (listener, addr) = loopback_listener();
    let mut ssl = AsyncSslSocket::new_client(FakeCtx::new(), Some(reactor));

    let ccb = RecordingConnect::new();
    ssl.connect(Some(ccb.clone()), addr, 50, &[], None);

    ssl.handshake_timeout_expired();

    let text = ccb.error_text().expect("connect must fail");
    assert!(text.contains("connect timed out"), "got: {text}");
    assert_eq!(ssl.ssl_state(), SslState::Error);

    close_fd(listener);
}

#[test]
fn ssl_connect_on_adopted_fd_completes() {
    let (_sim, reactor) = reactor_pair();
    let (a, b) = socketpair_nonblocking();
    let mut ssl = AsyncSslSocket::from_fd(FakeCtx::new(), Some(reactor), a, false);

    let hs = RecordingHandshake::new();
    ssl.ssl_connect(Some(hs.clone()), 0, VerifyPeer::NoVerify);
    // The client hello went out; the engine now waits for the reply.
    assert_eq!(ssl.ssl_state(), SslState::Connecting);
    assert_eq!(drain_fd(b), record(RECORD_HANDSHAKE, b"CLIENTHELLO"));

    write_all_fd(b, &record(RECORD_HANDSHAKE, b"SERVERHELLO"));
    ssl.io_ready(EventFlags::READ);

    assert_eq!(hs.success.get(), 1);
    assert_eq!(ssl.ssl_state(), SslState::Established);
    assert!(!ssl.ssl_session_reused());

    ssl.close_now();
    close_fd(b);
}

#[test]
fn eor_flagged_write_tracks_and_clears_cursors() {
    let (_sim, mut ssl, b, _hs) = established_server(FakeCtx::new());
    ssl.set_eor_tracking(true);

    let wcb = RecordingWrite::new();
    ssl.write(Some(wcb.clone()), b"final record", WriteFlags::EOR);

    assert_eq!(wcb.successes.get(), 1);
    // The record went out whole, so the EOR cursors are already cleared.
    assert_eq!(ssl.app_eor_byte_no(), None);
    assert_eq!(drain_fd(b), record(RECORD_APP_DATA, b"final record"));

    ssl.close_now();
    close_fd(b);
}

#[test]
fn peer_close_maps_to_remote_closed_then_eof() {
    let (_sim, mut ssl, b, _hs) = established_server(FakeCtx::new());

    let rcb = RecordingRead::new(4096);
    ssl.set_read_callback(Some(rcb.clone()));

    close_fd(b);
    ssl.io_ready(EventFlags::READ);

    assert!(rcb.saw_eof());
    assert_eq!(ssl.ssl_state(), SslState::RemoteClosed);
}

#[test]
fn ssl_accept_twice_is_an_invalid_state() {
    let (_sim, reactor) = reactor_pair();
    let (a, b) = socketpair_nonblocking();
    let mut ssl = AsyncSslSocket::from_fd(FakeCtx::new(), Some(reactor), a, true);

    let hs1 = RecordingHandshake::new();
    ssl.ssl_accept(Some(hs1), 0, VerifyPeer::UseCtx);

    let hs2 = RecordingHandshake::new();
    ssl.ssl_accept(Some(hs2.clone()), 0, VerifyPeer::UseCtx);
    assert_eq!(hs2.errors.borrow().len(), 1);

    close_fd(b);
}
