//! `Client` — the public façade: drives `init`/`close` lifecycle, surfaces `connected`, and
//! exposes the single generic call surface that business-verb wrappers would build on.
//!
//! A cloneable, `Arc`-backed façade driving an async lifecycle; `close()` broadcasts a shutdown
//! by detaching every active connection. This `Client` holds no lock over pool or connection-set
//! state: pool state lives in the pool worker, connection-set state lives in its own worker, and
//! the only mutable state here (the active-request map, used solely so `close()` can detach live
//! connections) is guarded by a plain `std::sync::Mutex` since it is only ever touched for the
//! duration of a map insert/remove, never across an `await` point.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::Instant,
};

use futures_core::Stream;
use tokio::{net::TcpStream, sync::watch};
use tracing::{debug, error, info};

use crate::{
    connection::BackendConnection,
    connection_set::{self, ConnectionSetHandle},
    error::{Error, Result},
    options::ClientOptions,
    pool::ConnectionPool,
    request::{ReleaseGuard, ReleasingStream, RequestAllocation},
    resolver::{DnsResolver, Resolver, TopologyState},
    transport::{RpcArgs, RpcValue, Transport},
};

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Builds a [`Transport`] over a freshly connected socket. Supplied by whatever RPC protocol this
/// core is wired up to serve (Non-goals §1: no wire format is specified here).
pub type TransportFactory = Arc<dyn Fn(TcpStream) -> Box<dyn Transport> + Send + Sync>;

/// Façade over the connection pool and connection set. Cheaply cloneable (an `Arc` inside);
/// clones share the same underlying lifecycle.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    pool: ConnectionPool,
    connection_set: ConnectionSetHandle,
    state: AtomicU8,
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, Arc<BackendConnection>>>,
    active_count: watch::Sender<usize>,
    unwrap_errors: bool,
    first_connected_at: OnceLock<Instant>,
    first_connect_failed_at: OnceLock<Instant>,
}

impl Client {
    /// Construct and start a `Client`: validates `options`, starts the connection pool and the
    /// connection set, and spawns the resolver configured by `options.discovery`.
    pub async fn init(options: ClientOptions, make_transport: TransportFactory) -> Result<Self> {
        options.validate()?;

        let pool = ConnectionPool::start(options.fallback_max);
        let resolver: Box<dyn Resolver> = Box::new(DnsResolver::from_options(&options));

        let connection_set = connection_set::start(
            options.target,
            options.maximum,
            options.fail_fast,
            options.recovery_default.clone(),
            options.keepalive_idle,
            make_transport,
            resolver,
            pool.manager(),
        );

        let (active_count, _) = watch::channel(0);

        let inner = Arc::new(Inner {
            pool,
            connection_set,
            state: AtomicU8::new(OPEN),
            next_id: AtomicU64::new(0),
            active: Mutex::new(HashMap::new()),
            active_count,
            unwrap_errors: options.unwrap_errors,
            first_connected_at: OnceLock::new(),
            first_connect_failed_at: OnceLock::new(),
        });

        let topology = inner.connection_set.subscribe();
        tokio::spawn(Inner::watch_topology(inner.clone(), topology));

        Ok(Self { inner })
    }

    /// Whether the client has ever reached a usable state and has not since closed. Does not
    /// reflect momentary unavailability (e.g. a fallback-expiry gap) — callers should attempt
    /// requests and handle [`Error::is_no_backends`] rather than poll this first.
    pub fn connected(&self) -> bool {
        self.inner.first_connected_at.get().is_some() && self.inner.state() == OPEN
    }

    /// Issue a unary-style RPC: collects every record from the transport before returning,
    /// releasing the pool allocation before the result is handed back.
    pub async fn call_unary(&self, args: RpcArgs) -> Result<Vec<RpcValue>> {
        let (id, guard) = self.inner.begin_request().await?;
        let result = guard.call_unary(args).await;
        self.inner.end_request(id);
        self.unwrap_if_configured(result)
    }

    /// Issue a streaming RPC: the allocation releases the moment the returned stream reaches its
    /// first terminal item.
    pub async fn call_stream(
        &self,
        args: RpcArgs,
    ) -> Result<impl Stream<Item = Result<RpcValue>> + Send> {
        let (id, guard) = self.inner.begin_request().await?;
        let stream = guard.call_stream(args);
        Ok(ActiveRequestStream {
            id,
            client: self.inner.clone(),
            inner: stream,
            finished: false,
        })
    }

    fn unwrap_if_configured<T>(&self, result: Result<T>) -> Result<T> {
        if self.inner.unwrap_errors {
            result.map_err(Error::unwrap_to_root_cause)
        } else {
            result
        }
    }

    /// Begin an orderly shutdown. Idempotent: a second call logs and returns immediately.
    pub async fn close(&self) {
        if self
            .inner
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("close() called while not open, ignoring");
            return;
        }

        self.inner.pool.fallback_disable();
        self.inner.connection_set.close();

        let conns: Vec<Arc<BackendConnection>> = {
            let active = self.inner.active.lock().unwrap();
            active.values().cloned().collect()
        };
        for conn in conns {
            conn.destroy();
        }

        let mut count_rx = self.inner.active_count.subscribe();
        loop {
            if *count_rx.borrow() == 0 {
                break;
            }
            if count_rx.changed().await.is_err() {
                break;
            }
        }

        let mut topology = self.inner.connection_set.subscribe();
        topology.wait_for(|s| *s == TopologyState::Stopped).await.ok();

        self.inner.state.store(CLOSED, Ordering::SeqCst);
        info!("client closed");
    }
}

impl Inner {
    fn state(&self) -> u8 {
        self.state.load(Ordering::SeqCst)
    }

    async fn watch_topology(inner: Arc<Inner>, mut topology: watch::Receiver<TopologyState>) {
        loop {
            match *topology.borrow() {
                TopologyState::Running => {
                    inner.first_connected_at.get_or_init(Instant::now);
                    return;
                }
                TopologyState::Failed => {
                    inner.first_connect_failed_at.get_or_init(Instant::now);
                    error!("connection set reported failed before reaching its target");
                    return;
                }
                TopologyState::Starting | TopologyState::Stopped => {}
            }
            if topology.changed().await.is_err() {
                return;
            }
        }
    }

    /// Allocate a connection, assign a request id, and register it as active. Fails with
    /// `ClientClosedError` if the client is not `OPEN`.
    async fn begin_request(&self) -> Result<(u64, ReleaseGuard)> {
        if self.state() != OPEN {
            return Err(Error::client_closed());
        }

        let allocated = self.pool.allocate().await?;
        let conn = allocated.conn.clone();
        let allocation = RequestAllocation::new(allocated, self.pool.manager());
        let guard = ReleaseGuard::new(allocation);

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut active = self.active.lock().unwrap();
        active.insert(id, conn);
        let _ = self.active_count.send(active.len());

        Ok((id, guard))
    }

    fn end_request(&self, id: u64) {
        let remaining = {
            let mut active = self.active.lock().unwrap();
            active.remove(&id);
            active.len()
        };
        let _ = self.active_count.send(remaining);
    }
}

/// Wraps a [`ReleasingStream`] so that reaching its first terminal item also removes the request
/// from [`Inner::active`], letting `close()` observe `nactive == 0`.
struct ActiveRequestStream {
    id: u64,
    client: Arc<Inner>,
    inner: ReleasingStream,
    finished: bool,
}

impl Stream for ActiveRequestStream {
    type Item = Result<RpcValue>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;

        let this = self.get_mut();
        let poll = std::pin::Pin::new(&mut this.inner).poll_next(cx);

        if !this.finished && matches!(poll, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            this.finished = true;
            this.client.end_request(this.id);
        }

        poll
    }
}
