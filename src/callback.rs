//! User-facing callback traits.
//!
//! All methods take `&self`: implementations keep their mutable state behind
//! interior mutability. This is what makes re-entrant notification safe —
//! e.g. `close()` called from inside `read_data_available` delivers
//! `read_eof` to the very same callback object before the outer call
//! returns.
//!
//! Every notification hands the transport back in as
//! `&mut dyn AsyncTransport`, so callbacks can issue follow-up operations
//! (write a response, uninstall themselves, close) without holding their own
//! aliasing reference to the socket.

use bytes::BytesMut;

use crate::error::SocketError;
use crate::socket::AsyncTransport;
use crate::tls::PeerCertInfo;

/// Installed with `set_read_callback`; notified persistently until
/// uninstalled.
pub trait ReadCallback {
    /// Hand the engine a buffer to read into: empty, with spare capacity.
    /// Returning a buffer with no capacity fails the socket with `BadArgs`.
    fn read_buffer(&self) -> BytesMut;

    /// `data` is the buffer from [`ReadCallback::read_buffer`], now holding
    /// the received bytes.
    fn read_data_available(&self, sock: &mut dyn AsyncTransport, data: BytesMut);

    /// The peer shut down its write side; no more data will arrive.
    fn read_eof(&self, sock: &mut dyn AsyncTransport);

    /// The socket failed; it has moved to the error state.
    fn read_error(&self, sock: &mut dyn AsyncTransport, err: SocketError);
}

/// Completion callback for one write submission. Exactly one of the two
/// methods fires per submission.
pub trait WriteCallback {
    /// Every byte of the submission reached the kernel.
    fn write_success(&self, sock: &mut dyn AsyncTransport);

    /// The write failed after `bytes_written` bytes reached the kernel.
    fn write_error(&self, sock: &mut dyn AsyncTransport, bytes_written: u64, err: SocketError);
}

/// Completion callback for `connect`.
pub trait ConnectCallback {
    /// The connection is established. For a TLS socket this fires only once
    /// the handshake has also completed.
    fn connect_success(&self, sock: &mut dyn AsyncTransport);

    /// The connection attempt failed.
    fn connect_error(&self, sock: &mut dyn AsyncTransport, err: SocketError);
}

/// Completion callback for `ssl_accept` / `ssl_connect`. Uninstalled before
/// either completion method is invoked.
pub trait HandshakeCallback {
    /// Invoked during the handshake to let the application judge the peer
    /// certificate beyond the engine's own checks. The default mimics an
    /// engine with no verification callback installed.
    fn handshake_verify(&self, preverify_ok: bool, _cert: &PeerCertInfo) -> bool {
        preverify_ok
    }

    /// The TLS connection is established.
    fn handshake_success(&self, sock: &mut dyn AsyncTransport);

    /// Establishing the TLS connection failed.
    fn handshake_error(&self, sock: &mut dyn AsyncTransport, err: SocketError);
}
