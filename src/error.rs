//! Contains the `Error` and `Result` types that this crate uses.

use std::{net::SocketAddr, sync::Arc};

use thiserror::Error;

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur while discovering backends, maintaining the connection pool, or
/// dispatching a request.
///
/// The inner [`ErrorKind`] is wrapped in a `Box` to keep `Error` small and cheap to move through
/// channels.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
pub struct Error {
    /// The kind of error that occurred.
    pub kind: Box<ErrorKind>,

    #[source]
    pub(crate) source: Option<Box<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
            source: None,
        }
    }

    /// Wrap this error as the cause of a new, outer error. Used by [`BackendConnection`] to add
    /// `address:port` context to errors surfaced by the socket or the transport.
    ///
    /// [`BackendConnection`]: crate::connection::BackendConnection
    pub(crate) fn wrap(self, kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
            source: Some(Box::new(self)),
        }
    }

    /// Strip wrapping layers added by this crate (e.g. the `address:port` context added by
    /// [`BackendConnection`]) down to the innermost cause, for callers that set `unwrapErrors`.
    ///
    /// [`BackendConnection`]: crate::connection::BackendConnection
    pub fn unwrap_to_root_cause(mut self) -> Self {
        while let Some(source) = self.source {
            self = *source;
        }
        self
    }

    pub(crate) fn no_backends() -> Self {
        Self::new(ErrorKind::NoBackends)
    }

    pub(crate) fn client_closed() -> Self {
        Self::new(ErrorKind::ClientClosed)
    }

    pub(crate) fn transport(message: impl Into<String>, address: SocketAddr) -> Self {
        Self::new(ErrorKind::Transport {
            message: message.into(),
            address,
        })
    }

    pub(crate) fn resolver(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resolver {
            message: message.into(),
        })
    }

    pub(crate) fn io(address: SocketAddr, source: Arc<std::io::Error>) -> Self {
        Self::new(ErrorKind::Io { address, source })
    }

    /// Whether this error (at any layer) is a [`ErrorKind::NoBackends`].
    pub fn is_no_backends(&self) -> bool {
        matches!(*self.kind, ErrorKind::NoBackends)
    }
}

/// The specific kind of error produced by this crate.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// `allocate()` found no `AVAIL` entry and no usable fallback entry.
    #[error("no backends are currently available")]
    NoBackends,

    /// `allocate()` was attempted while the client's state was not `OPEN`.
    #[error("client is closing or closed")]
    ClientClosed,

    /// An error surfaced by the [`Transport`](crate::transport::Transport) while an RPC was
    /// in flight.
    #[error("transport error talking to {address}: {message}")]
    Transport {
        message: String,
        address: SocketAddr,
    },

    /// An `io::Error` from the underlying socket, wrapped with the peer address.
    #[error("io error talking to {address}: {source}")]
    Io {
        address: SocketAddr,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The resolver's retry budget was exhausted with no usable backend set.
    #[error("DNS resolution failed: {message}")]
    Resolver { message: String },

    /// `failFast` was configured and the initial connection attempt did not reach `running`
    /// before failing.
    #[error("failed to establish an initial connection: {message}")]
    InitialConnect { message: String },
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}
