//! `ConnectionSet` — consumes [`Resolver`] events and turns them into connected
//! [`BackendConnection`]s, reported to the pool as `added`/`removed`.
//!
//! Like the pool worker, all mutable state (`connected`, in-flight connect attempts) lives on one
//! task, which turns each discovery event into a connect attempt (with retry/backoff) and a pool
//! notification.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
};
use tracing::{debug, warn};

use crate::{
    connection::BackendConnection,
    options::RecoveryPolicy,
    pool::PoolManager,
    resolver::{self, Backend, Resolver, ResolverEvent, TopologyState},
    transport::Transport,
};

/// Opaque token a [`PoolEntry`](crate::pool) owes back to the `ConnectionSet` once a connection
/// has finished draining. Fire-and-forget: dropping a `Handle` without calling [`release`] leaks
/// the backend's bookkeeping entry, which is why the pool worker always calls it from the DRAIN →
/// DELETED transition.
///
/// [`release`]: Handle::release
pub(crate) struct Handle {
    key: String,
    drained: mpsc::UnboundedSender<String>,
}

impl Handle {
    pub(crate) fn release(self) {
        let _ = self.drained.send(self.key);
    }
}

#[cfg(test)]
impl Handle {
    /// Build a standalone `Handle` for unit tests that exercise the pool worker directly, without
    /// a running `ConnectionSet`. `release()` calls are observable on the returned receiver.
    pub(crate) fn for_test(key: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (drained, rx) = mpsc::unbounded_channel();
        (
            Self {
                key: key.into(),
                drained,
            },
            rx,
        )
    }
}

type TransportFactory = Arc<dyn Fn(TcpStream) -> Box<dyn Transport> + Send + Sync>;

/// A running `ConnectionSet`. Cloneable handle to its background task: `close()` tells the task
/// to stop connecting and drain everything it owns.
#[derive(Clone)]
pub(crate) struct ConnectionSetHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<TopologyState>,
}

impl ConnectionSetHandle {
    pub(crate) fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    pub(crate) fn state(&self) -> TopologyState {
        *self.state.borrow()
    }

    /// A fresh receiver for observing every transition, not just a single target.
    pub(crate) fn subscribe(&self) -> watch::Receiver<TopologyState> {
        self.state.clone()
    }

    /// Wait until the published state equals `target` (or has moved past it; `Stopped` satisfies
    /// any wait once reached, since it is terminal).
    pub(crate) async fn wait_for(&mut self, target: TopologyState) {
        loop {
            if *self.state.borrow() == target {
                return;
            }
            if self.state.changed().await.is_err() {
                return;
            }
        }
    }
}

enum Command {
    Close,
}

/// A successful connect attempt reported back from a spawned per-backend task.
enum ConnectOutcome {
    Connected {
        backend: Backend,
        conn: Arc<BackendConnection>,
    },
    GaveUp {
        key: String,
    },
}

pub(crate) fn start(
    target: u32,
    maximum: u32,
    fail_fast: bool,
    recovery_default: RecoveryPolicy,
    keepalive_idle: Duration,
    make_transport: TransportFactory,
    resolver: Box<dyn Resolver>,
    pool: PoolManager,
) -> ConnectionSetHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (resolver_tx, resolver_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(TopologyState::Starting);
    let (drained_tx, drained_rx) = mpsc::unbounded_channel();
    let (connect_tx, connect_rx) = mpsc::unbounded_channel();

    resolver.spawn(resolver_tx);

    let worker = Worker {
        target,
        maximum,
        fail_fast,
        recovery_default,
        keepalive_idle,
        make_transport,
        pool,
        state_tx,
        connected: HashSet::new(),
        removing: HashSet::new(),
        reached_target: false,
        closing: false,
        commands: command_rx,
        resolver_events: resolver_rx,
        drained_rx,
        drained_tx,
        connect_rx,
        connect_tx,
    };
    tokio::spawn(worker.execute());

    ConnectionSetHandle {
        commands: command_tx,
        state: state_rx,
    }
}

struct Worker {
    target: u32,
    maximum: u32,
    fail_fast: bool,
    recovery_default: RecoveryPolicy,
    keepalive_idle: Duration,
    make_transport: TransportFactory,
    pool: PoolManager,
    state_tx: watch::Sender<TopologyState>,

    /// Keys currently connected and known to the pool.
    connected: HashSet<String>,
    /// Keys the resolver has told us to remove, awaiting the pool's `handle.release()`.
    removing: HashSet<String>,
    reached_target: bool,
    closing: bool,

    commands: mpsc::UnboundedReceiver<Command>,
    resolver_events: mpsc::UnboundedReceiver<ResolverEvent>,
    drained_tx: mpsc::UnboundedSender<String>,
    drained_rx: mpsc::UnboundedReceiver<String>,
    connect_tx: mpsc::UnboundedSender<ConnectOutcome>,
    connect_rx: mpsc::UnboundedReceiver<ConnectOutcome>,
}

impl Worker {
    async fn execute(mut self) {
        loop {
            tokio::select! {
                biased;

                Some(command) = self.commands.recv(), if !self.closing => {
                    match command {
                        Command::Close => {
                            self.closing = true;
                            self.pool.fallback_disable();
                            for key in self.connected.drain().collect::<Vec<_>>() {
                                self.removing.insert(key.clone());
                                self.pool.removed(key);
                            }
                        }
                    }
                }
                Some(key) = self.drained_rx.recv() => {
                    self.removing.remove(&key);
                    debug!(%key, "backend fully drained");
                }
                Some(event) = self.resolver_events.recv(), if !self.closing => {
                    self.handle_resolver_event(event);
                }
                Some(outcome) = self.connect_rx.recv() => {
                    self.handle_connect_outcome(outcome);
                }
                else => {}
            }

            if self.closing && self.connected.is_empty() && self.removing.is_empty() {
                let _ = self.state_tx.send(TopologyState::Stopped);
                break;
            }
        }
    }

    fn handle_resolver_event(&mut self, event: ResolverEvent) {
        match event {
            ResolverEvent::Added(backend) => self.handle_added(backend),
            ResolverEvent::Removed(key) => self.handle_removed(key),
            ResolverEvent::StateChanged(_) => {
                // The resolver's own starting/running/stopped is distinct from this
                // ConnectionSet's; only the count of actually-connected backends drives ours.
            }
        }
    }

    fn handle_added(&mut self, backend: Backend) {
        let connected_count = self.connected.len() as u32;
        if connected_count >= self.maximum {
            debug!(key = %backend.key, "discovered backend ignored, at maximum");
            return;
        }

        let address = backend.socket_addr();
        let recovery = self.recovery_default.clone();
        let keepalive_idle = self.keepalive_idle;
        let make_transport = self.make_transport.clone();
        let connect_tx = self.connect_tx.clone();
        let key_for_failure = backend.key.clone();

        tokio::spawn(async move {
            let result = resolver::retry(&recovery, || {
                let make_transport = make_transport.clone();
                async move { connect_once(address, keepalive_idle, make_transport).await }
            })
            .await;

            match result {
                Ok(conn) => {
                    let _ = connect_tx.send(ConnectOutcome::Connected {
                        backend,
                        conn: Arc::new(conn),
                    });
                }
                Err(e) => {
                    warn!(key = %key_for_failure, %address, error = %e, "giving up on backend after exhausting retries");
                    let _ = connect_tx.send(ConnectOutcome::GaveUp { key: key_for_failure });
                }
            }
        });
    }

    fn handle_connect_outcome(&mut self, outcome: ConnectOutcome) {
        match outcome {
            ConnectOutcome::Connected { backend, conn } => {
                if self.closing {
                    debug!(key = %backend.key, "connect completed after close, discarding");
                    conn.destroy();
                    return;
                }
                if self.connected.len() as u32 >= self.maximum {
                    debug!(key = %backend.key, "connected after maximum was reached, discarding");
                    conn.destroy();
                    return;
                }
                let handle = Handle {
                    key: backend.key.clone(),
                    drained: self.drained_tx.clone(),
                };
                self.connected.insert(backend.key.clone());
                self.pool.added(backend.key, conn, handle);

                if !self.reached_target && self.connected.len() as u32 >= self.target {
                    self.reached_target = true;
                    let _ = self.state_tx.send(TopologyState::Running);
                }
            }
            ConnectOutcome::GaveUp { key } => {
                if !self.reached_target && self.fail_fast {
                    let _ = self.state_tx.send(TopologyState::Failed);
                }
                debug!(%key, "dropped discovered backend that never connected");
            }
        }
    }

    fn handle_removed(&mut self, key: String) {
        if self.connected.remove(&key) {
            self.removing.insert(key.clone());
            self.pool.removed(key);
        }
    }
}

async fn connect_once(
    address: SocketAddr,
    keepalive_idle: Duration,
    make_transport: TransportFactory,
) -> crate::error::Result<BackendConnection> {
    BackendConnection::connect(address, keepalive_idle, move |stream| make_transport(stream)).await
}
