//! `BackendConnection` — one logical connection: owns one TCP socket plus one [`Transport`]
//! instance. Enables TCP keepalive once the socket reaches the connected state and coalesces
//! socket/transport errors into a single first-error emission.

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use socket2::SockRef;
use tokio::net::TcpStream;
use tracing::warn;

use crate::{
    error::{Error, Result},
    transport::Transport,
};

/// Local and remote socket addresses captured once a connection reaches the connected state.
#[derive(Clone, Copy, Debug)]
pub struct PeerAddrs {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

/// One logical connection to a backend. Immutable after construction except for the fields
/// explicitly called out below.
pub struct BackendConnection {
    address: SocketAddr,
    keepalive_idle: Duration,
    peer_addrs: Option<PeerAddrs>,
    /// Append-only log of every error seen on this connection, for diagnosis; never read by
    /// control flow.
    all_errors: std::sync::Mutex<Vec<Error>>,
    destroyed: AtomicBool,
    /// Latches once the first socket/transport error has been emitted, so that a socket error and
    /// a transport error caused by the same underlying failure don't both reach the consumer.
    error_emitted: AtomicBool,
    transport: Box<dyn Transport>,
}

impl BackendConnection {
    /// Connect to `address`, enable TCP keepalive once the socket is connected, and wrap it with
    /// `transport`. Capturing local/remote addresses and enabling keepalive both require the
    /// connected state, hence they happen here rather than at construction of some pre-connect
    /// value.
    pub async fn connect(
        address: SocketAddr,
        keepalive_idle: Duration,
        make_transport: impl FnOnce(TcpStream) -> Box<dyn Transport>,
    ) -> Result<Self> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| Error::io(address, std::sync::Arc::new(e)))?;

        let local = stream
            .local_addr()
            .map_err(|e| Error::io(address, std::sync::Arc::new(e)))?;
        let remote = stream
            .peer_addr()
            .map_err(|e| Error::io(address, std::sync::Arc::new(e)))?;

        let sock_ref = SockRef::from(&stream);
        if let Err(e) = sock_ref.set_tcp_keepalive(
            &socket2::TcpKeepalive::new().with_time(keepalive_idle),
        ) {
            warn!(%address, error = %e, "failed to enable tcp keepalive");
        }

        let transport = make_transport(stream);

        Ok(Self {
            address,
            keepalive_idle,
            peer_addrs: Some(PeerAddrs { local, remote }),
            all_errors: std::sync::Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            error_emitted: AtomicBool::new(false),
            transport,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn keepalive_idle(&self) -> Duration {
        self.keepalive_idle
    }

    pub fn peer_addrs(&self) -> Option<PeerAddrs> {
        self.peer_addrs
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Idempotently tear down the transport. Safe to call more than once; only the first call
    /// has any effect.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transport.detach();
    }

    /// Wrap a socket- or transport-level error with `address:port` context, append it to the
    /// diagnostic log, and return `Some` only the first time this is called (and only if the
    /// connection is not yet destroyed). Both the socket and the transport can surface an error
    /// for the same underlying failure; this latch is what keeps a consumer from seeing the
    /// event twice.
    pub(crate) fn record_error(&self, message: impl Into<String>) -> Option<Error> {
        let err = Error::transport(message, self.address);
        self.all_errors.lock().unwrap().push(err.clone());

        if self.is_destroyed() {
            return None;
        }
        if self.error_emitted.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(err)
    }
}
