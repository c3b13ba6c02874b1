//! Error and result types for the operation engine.

use std::fmt;
use std::io;

/// Stable error codes surfaced by the engine, independent of the underlying
/// handler implementation's own error numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqErrno {
    /// A `Done` handler verb produced a connection with no usable socket.
    InitializationFailed,
    /// A per-attempt or TCP-handshake timeout fired under normal load.
    ConnTimeout,
    /// A timeout fired while the event loop's callback-delay average was at
    /// or above the stall threshold; the elapsed time is not solely
    /// attributable to the remote server.
    ConnTimeoutLoopStalled,
    /// The server closed the connection out from under us (`CR_SERVER_LOST`
    /// equivalent).
    ServerLost,
    /// A server-supplied error number, passed through verbatim.
    Server(u16),
}

impl fmt::Display for SqErrno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqErrno::InitializationFailed => f.write_str("SQ_INITIALIZATION_FAILED"),
            SqErrno::ConnTimeout => f.write_str("SQ_ERRNO_CONN_TIMEOUT"),
            SqErrno::ConnTimeoutLoopStalled => f.write_str("SQ_ERRNO_CONN_TIMEOUT_LOOP_STALLED"),
            SqErrno::ServerLost => f.write_str("CR_SERVER_LOST"),
            SqErrno::Server(code) => write!(f, "{code}"),
        }
    }
}

/// A snapshot of an error surfaced by a [`MysqlHandler`][crate::handler::MysqlHandler]
/// verb, taken before any further state changes so that completion always
/// reports the root cause.
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub errno: SqErrno,
    pub message: String,
}

impl HandlerError {
    pub fn new(errno: SqErrno, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.errno, self.message)
    }
}

impl std::error::Error for HandlerError {}

/// The error type for this crate.
///
/// Mirrors the shape of `sqlx_core::error::Error`: one flat enum covering
/// every failure mode an [`Operation`][crate::operation::Operation] can
/// report, with `#[from]` conversions at the I/O boundary only.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A setter or accessor was called outside the state window that
    /// permits it (e.g. a connect-option setter called after `run()`, or a
    /// fetch accessor called before the operation started).
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A handler verb reported a non-zero MySQL error.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// A per-attempt, total, or TCP-handshake timeout fired. The message is
    /// pre-formatted per the stable timeout message format.
    #[error("{0}")]
    Timeout(String),

    /// The operation was cancelled by the caller; this result can never be
    /// overridden by a later error.
    #[error("operation was cancelled")]
    Cancelled,

    /// Fatal initialization failure, e.g. a `Done` verb produced an invalid
    /// socket descriptor.
    #[error("[{0}] {1}")]
    Initialization(SqErrno, String),

    /// Lower-level I/O failure from the event loop or socket layer.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// [`Operation::must_succeed`][crate::operation::Operation::must_succeed]
    /// was called and the operation's result was not `Succeeded`.
    #[error("operation did not complete successfully")]
    RequiredOperationFailed,
}

impl Error {
    /// `true` for errors that a caller may reasonably retry (matches the
    /// handler-level failures a connect attempt loop treats as retryable).
    pub fn is_retryable_connect_error(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Handler(_) | Error::Timeout(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
