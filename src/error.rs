use thiserror::Error;

/// Extended TLS error codes surfaced at the socket boundary.
///
/// These are outside the valid errno range and unique against the codes the
/// TLS engine itself produces.
pub mod ssl_code {
    /// The peer attempted to renegotiate after the handshake completed.
    pub const CLIENT_RENEGOTIATION_ATTEMPT: i32 = 900;
    /// The engine demanded a read mid-write, i.e. a renegotiation.
    pub const INVALID_RENEGOTIATION: i32 = 901;
    /// A write was submitted before the handshake completed.
    pub const EARLY_WRITE: i32 = 902;
}

/// Errors surfaced to socket callbacks.
///
/// Messages are augmented with the socket's peer and local addresses where
/// the failure site had them available.
#[derive(Debug, Clone, Error)]
pub enum SocketError {
    /// An operation that requires a fresh socket found one already in use.
    #[error("{0}")]
    AlreadyOpen(String),
    /// An operation that requires an open socket found none.
    #[error("{0}")]
    NotOpen(String),
    /// The connection ended; locally initiated closes report this too.
    #[error("{0}")]
    EndOfFile(String),
    /// A connect or write timeout expired.
    #[error("{0}")]
    TimedOut(String),
    /// A callback handed the engine unusable arguments.
    #[error("{0}")]
    BadArgs(String),
    /// A syscall or internal step failed.
    #[error("{msg} (errno {errno})")]
    Internal {
        /// Failure description.
        msg: String,
        /// Raw errno, or 0 when the failure was not a syscall.
        errno: i32,
    },
    /// A TLS-layer failure, carrying an engine code or one of [`ssl_code`].
    #[error("SSL error {code}: {msg}")]
    Ssl {
        /// Engine error code or an [`ssl_code`] constant.
        code: i32,
        /// Failure description.
        msg: String,
    },
}

impl SocketError {
    pub(crate) fn already_open(msg: impl Into<String>) -> Self {
        SocketError::AlreadyOpen(msg.into())
    }

    pub(crate) fn not_open(msg: impl Into<String>) -> Self {
        SocketError::NotOpen(msg.into())
    }

    pub(crate) fn end_of_file(msg: impl Into<String>) -> Self {
        SocketError::EndOfFile(msg.into())
    }

    pub(crate) fn timed_out(msg: impl Into<String>) -> Self {
        SocketError::TimedOut(msg.into())
    }

    pub(crate) fn bad_args(msg: impl Into<String>) -> Self {
        SocketError::BadArgs(msg.into())
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        SocketError::Internal {
            msg: msg.into(),
            errno: 0,
        }
    }

    pub(crate) fn internal_errno(msg: impl Into<String>, errno: i32) -> Self {
        SocketError::Internal {
            msg: msg.into(),
            errno,
        }
    }

    pub(crate) fn ssl(code: i32, msg: impl Into<String>) -> Self {
        SocketError::Ssl {
            code,
            msg: msg.into(),
        }
    }

    /// The TLS code carried by an [`SocketError::Ssl`], if any.
    pub fn ssl_error_code(&self) -> Option<i32> {
        match self {
            SocketError::Ssl { code, .. } => Some(*code),
            _ => None,
        }
    }
}
