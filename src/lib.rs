//! wireline — event-driven, non-blocking TCP/TLS socket engine.
//!
//! wireline provides two layered transports for embedding inside a
//! single-threaded reactor (one I/O loop per thread): [`AsyncSocket`] for
//! plain TCP and [`AsyncSslSocket`] for TLS over the same machinery. Callers
//! install callbacks and submit work; the engine performs partial I/O
//! against a non-blocking fd, multiplexes readiness through the embedder's
//! [`Reactor`], drives the TLS handshake, applies back-pressure through
//! write queueing, and honours connect/write/handshake timeouts.
//!
//! The reactor and the TLS cryptographic engine are collaborators, not
//! dependencies: the embedder implements [`Reactor`] and hands TLS sockets a
//! [`TlsContext`] whose engines speak the [`TlsEngine`] demand protocol.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::rc::Rc;
//! use wireline::{AsyncSocket, EventFlags, Reactor, TimerId, WriteFlags};
//!
//! struct LoopStub;
//!
//! impl Reactor for LoopStub {
//!     fn register_io(&self, _fd: i32, _flags: EventFlags) -> std::io::Result<()> {
//!         Ok(())
//!     }
//!     fn unregister_io(&self, _fd: i32) {}
//!     fn schedule_timer(&self, _delay_ms: u32) -> TimerId {
//!         TimerId(0)
//!     }
//!     fn cancel_timer(&self, _id: TimerId) {}
//! }
//!
//! let reactor: Rc<dyn Reactor> = Rc::new(LoopStub);
//! let mut sock = AsyncSocket::new(Some(reactor));
//! sock.connect_addr(None, "127.0.0.1:7878".parse().unwrap(), 5_000);
//! sock.write(None, b"hello", WriteFlags::NONE);
//! // The embedding loop then delivers readiness via sock.io_ready(..) and
//! // timer expiry via sock.timeout_expired().
//! ```
//!
//! # Threading
//!
//! A socket is affine to one reactor at a time. The only cross-thread
//! hand-off is `detach_reactor()` → (external synchronisation) →
//! `attach_reactor()` on another loop; while detached the socket is inert.

// ── Internal modules ────────────────────────────────────────────────────
mod callback;
mod chain;
mod client_hello;
mod reactor;
mod shutdown_set;
mod socket;
mod ssl_socket;
mod write_queue;

// ── Public modules ──────────────────────────────────────────────────────
pub mod error;
pub mod metrics;
pub mod tls;

// ── Re-exports: transports ─────────────────────────────────────────────

/// Plain-TCP async socket.
pub use socket::AsyncSocket;
/// Operations surface shared by the plain and TLS transports.
pub use socket::AsyncTransport;
/// Monotone shutdown bit-set (`READ_SHUT`/`WRITE_SHUT`/`WRITE_PENDING`).
pub use socket::ShutdownFlags;
/// One socket option applied during `connect`.
pub use socket::SocketOption;
/// Transport lifecycle state.
pub use socket::SocketState;
/// TLS socket layered over [`AsyncSocket`].
pub use ssl_socket::AsyncSslSocket;
/// TLS-layer lifecycle state.
pub use ssl_socket::SslState;

// ── Re-exports: reactor contract ───────────────────────────────────────

/// Interest/readiness bit-set for reactor registration.
pub use reactor::EventFlags;
/// The event loop the socket is embedded in.
pub use reactor::Reactor;
/// Identifier for a scheduled one-shot timer.
pub use reactor::TimerId;

// ── Re-exports: callbacks and submissions ──────────────────────────────

/// Completion callback for `connect`.
pub use callback::ConnectCallback;
/// Completion callback for `ssl_accept`/`ssl_connect`.
pub use callback::HandshakeCallback;
/// Persistent read-side callback.
pub use callback::ReadCallback;
/// Per-submission write completion callback.
pub use callback::WriteCallback;
/// Owned chain of buffers for `write_chain`.
pub use chain::BufferChain;
/// Per-write option bits (`CORK`/`EOR`).
pub use write_queue::WriteFlags;

// ── Re-exports: TLS collaborator contract ──────────────────────────────

/// Fields parsed from an inbound ClientHello.
pub use client_hello::ClientHelloInfo;
/// Errors surfaced to socket callbacks.
pub use error::SocketError;
/// Wire + verification surface for handshake calls.
pub use tls::HandshakeIo;
/// Outcome of one wire-level transfer attempted by the engine.
pub use tls::IoOutcome;
/// Peer certificate summary handed to verification hooks.
pub use tls::PeerCertInfo;
/// Application hook for judging the peer certificate.
pub use tls::PeerVerifier;
/// Certificate/key configuration; factory for per-connection engines.
pub use tls::TlsContext;
/// The TLS engine for one connection.
pub use tls::TlsEngine;
/// A fatal engine failure.
pub use tls::TlsFault;
/// Outcome of one engine call: progress or a demand.
pub use tls::TlsPoll;
/// Result type for engine calls.
pub use tls::TlsResult;
/// An established-session handle usable for resumption.
pub use tls::TlsSession;
/// A resolved verification policy.
pub use tls::VerifyMode;
/// Verification policy requested on `ssl_accept`/`ssl_connect`.
pub use tls::VerifyPeer;
/// The engine's wire surface.
pub use tls::WireIo;
/// Process-wide one-time engine-library initialisation.
pub use tls::engine_init;

// ── Re-exports: shared infrastructure ──────────────────────────────────

/// Process-wide forced-shutdown registry.
pub use shutdown_set::ShutdownSocketSet;
/// Pin the calling thread to a metrics shard.
pub use metrics::set_thread_shard;
