//! TLS collaborator contract.
//!
//! The cryptographic engine is out of scope for this crate: the socket
//! drives a [`TlsEngine`] through the demand-based protocol below and owns
//! the engine outright. The engine never stores a pointer back into the
//! socket — its wire surface ([`WireIo`]) and verification hook
//! ([`PeerVerifier`]) arrive as explicit parameters on every call.

use std::any::Any;
use std::sync::{Arc, OnceLock};

use thiserror::Error;

/// A fatal engine failure.
#[derive(Debug, Clone, Error)]
#[error("TLS engine error {code}: {msg}")]
pub struct TlsFault {
    /// Engine-defined error code.
    pub code: i32,
    /// Failure description.
    pub msg: String,
}

impl TlsFault {
    /// Build a fault from a code and message.
    pub fn new(code: i32, msg: impl Into<String>) -> Self {
        TlsFault {
            code,
            msg: msg.into(),
        }
    }
}

/// Outcome of one engine call: either progress, or a demand the socket must
/// satisfy before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsPoll<T> {
    /// The call made progress.
    Ready(T),
    /// The engine needs more wire input; retry after readable.
    WantRead,
    /// The engine has pending wire output; retry after writable.
    WantWrite,
    /// A session-cache lookup must be resolved out-of-band; retry via
    /// `restart_ssl_accept` once the session has been injected.
    WantSessionLookup,
    /// An asynchronous private-key operation is in flight; retry via
    /// `restart_ssl_accept` when it completes.
    WantAsyncKey,
    /// The peer closed the TLS connection.
    Closed,
}

/// Result type for engine calls.
pub type TlsResult<T> = Result<TlsPoll<T>, TlsFault>;

/// Outcome of one wire-level transfer attempted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// `n` bytes transferred; `Done(0)` on recv means orderly EOF.
    Done(usize),
    /// The fd is not ready; retry after the next readiness event.
    WouldBlock,
    /// The transfer failed with this errno.
    Err(i32),
}

/// The engine's wire surface: the socket hands this in on every engine call
/// and performs the actual non-blocking fd I/O (plus record observation and
/// end-of-record flagging) inside it.
pub trait WireIo {
    /// Read raw wire bytes.
    fn recv(&mut self, buf: &mut [u8]) -> IoOutcome;

    /// Write raw wire bytes.
    fn send(&mut self, buf: &[u8]) -> IoOutcome;
}

/// Peer certificate summary handed to verification hooks.
#[derive(Debug, Clone, Default)]
pub struct PeerCertInfo {
    /// Subject of the certificate under inspection.
    pub subject: String,
    /// Chain depth of the certificate under inspection (0 = leaf).
    pub depth: u32,
}

/// Application hook for judging the peer certificate during a handshake.
pub trait PeerVerifier {
    /// `preverify_ok` is the engine's own verdict; the return value
    /// replaces it.
    fn verify(&mut self, preverify_ok: bool, cert: &PeerCertInfo) -> bool;
}

/// Wire + verification surface for `accept`/`connect` calls.
pub struct HandshakeIo<'a> {
    /// Raw wire transfer surface.
    pub wire: &'a mut dyn WireIo,
    /// Present when peer verification is in effect for this handshake.
    pub verifier: Option<&'a mut dyn PeerVerifier>,
}

/// Verification policy requested on `ssl_accept` / `ssl_connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyPeer {
    /// Inherit the policy configured on the context.
    #[default]
    UseCtx,
    /// Verify the peer certificate if presented.
    Verify,
    /// Server side: verify and require a client certificate.
    VerifyRequireClientCert,
    /// Skip verification.
    NoVerify,
}

/// A resolved verification policy (no `UseCtx` indirection left).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Verify the peer certificate.
    Verify {
        /// Fail the handshake when the client presents no certificate.
        require_client_cert: bool,
    },
    /// Skip verification.
    NoVerify,
}

impl VerifyMode {
    /// Whether this mode runs peer verification at all.
    pub fn verifies(self) -> bool {
        matches!(self, VerifyMode::Verify { .. })
    }
}

/// Resolve a requested policy against the context default.
pub(crate) fn resolve_verify(requested: VerifyPeer, ctx: &dyn TlsContext) -> VerifyMode {
    match requested {
        VerifyPeer::UseCtx => ctx.default_verify(),
        VerifyPeer::Verify => VerifyMode::Verify {
            require_client_cert: false,
        },
        VerifyPeer::VerifyRequireClientCert => VerifyMode::Verify {
            require_client_cert: true,
        },
        VerifyPeer::NoVerify => VerifyMode::NoVerify,
    }
}

/// An established-session handle usable for resumption. Reference-counted;
/// the socket and the engine share ownership through the `Arc`.
pub trait TlsSession: Send + Sync {
    /// Downcast support for engine implementations.
    fn as_any(&self) -> &(dyn Any + Send + Sync);
}

/// The TLS engine for one connection.
///
/// Calls are non-blocking and may be repeated: a `Want*` outcome means "make
/// the demand true, then call again". The engine performs all wire transfer
/// through the [`WireIo`] it is handed — never through an fd of its own.
pub trait TlsEngine {
    /// Drive the server side of the handshake.
    fn accept(&mut self, io: &mut HandshakeIo<'_>) -> TlsResult<()>;

    /// Drive the client side of the handshake.
    fn connect(&mut self, io: &mut HandshakeIo<'_>) -> TlsResult<()>;

    /// Decrypt application data into `buf`.
    fn read(&mut self, wire: &mut dyn WireIo, buf: &mut [u8]) -> TlsResult<usize>;

    /// Encrypt and send application data; `Ready(n)` is the count of
    /// application bytes consumed.
    fn write(&mut self, wire: &mut dyn WireIo, buf: &[u8]) -> TlsResult<usize>;

    /// Decrypted bytes already buffered inside the engine.
    fn pending_plaintext(&self) -> usize;

    /// Wire size (framing plus payload) of the record that would carry a
    /// `plaintext_len`-byte write. Used to place `MSG_EOR` on the record's
    /// final wire bytes.
    fn wire_size_of_record(&self, plaintext_len: usize) -> usize;

    /// Install the verification policy for the coming handshake.
    fn set_verify(&mut self, mode: VerifyMode);

    /// Rebind the engine to a different context mid-handshake (SNI).
    fn use_context(&mut self, ctx: &dyn TlsContext) -> Result<(), TlsFault>;

    /// The negotiated session, for caching; `None` before completion.
    fn session(&self) -> Option<Arc<dyn TlsSession>>;

    /// Offer a cached session for resumption.
    fn set_session(&mut self, session: Arc<dyn TlsSession>) -> Result<(), TlsFault>;

    /// Whether the peer accepted the offered session.
    fn session_reused(&self) -> bool;

    /// Negotiated cipher name; `None` before completion.
    fn negotiated_cipher(&self) -> Option<String>;

    /// SNI server name seen (server) or sent (client).
    fn server_name(&self) -> Option<String>;

    /// Negotiated protocol version code (e.g. `0x0303`); `None` before
    /// completion.
    fn version(&self) -> Option<u16>;

    /// Application protocol selected by NPN/ALPN, if any.
    fn selected_protocol(&self) -> Option<Vec<u8>>;

    /// DER size of the peer certificate, 0 when none was presented.
    fn peer_cert_size(&self) -> usize;
}

/// Certificate/key configuration; the factory for per-connection engines.
pub trait TlsContext {
    /// Create an engine for one connection in the given role.
    fn new_engine(&self, server: bool) -> Box<dyn TlsEngine>;

    /// Verification policy applied when a handshake requests `UseCtx`.
    fn default_verify(&self) -> VerifyMode;
}

/// Run process-wide engine-library initialisation exactly once.
///
/// Context implementations whose underlying library needs one-time global
/// setup call this from their constructors; subsequent calls are no-ops.
pub fn engine_init(init: impl FnOnce()) {
    static ONCE: OnceLock<()> = OnceLock::new();
    ONCE.get_or_init(init);
}
