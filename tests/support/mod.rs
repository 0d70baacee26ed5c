//! Test doubles shared across the integration test binaries. Exercises `Client` only through its
//! public surface, the way a caller supplying its own RPC wire format would.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use fleet_rpc::{
    error::{Error, Result},
    transport::{RecordStream, RpcArgs, RpcValue, Transport},
};
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Replies to every `rpc()` call with a single canned record, unless `detach()` has been called,
/// in which case it replies with a terminal transport error instead.
pub struct RecordingTransport {
    detached: Arc<AtomicBool>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            detached: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Transport for RecordingTransport {
    fn rpc(&self, _args: RpcArgs) -> RecordStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let detached = self.detached.clone();
        tokio::spawn(async move {
            if detached.load(Ordering::SeqCst) {
                let _ = tx.send(Err(Error::transport("detached", "0.0.0.0:0".parse().unwrap())));
                return;
            }
            let _ = tx.send(Ok(RpcValue::Raw(b"ok".to_vec())));
        });
        Box::pin(UnboundedReceiverStream::new(rx))
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }
}

/// An `rpc()` call that never completes on its own; it only resolves, with a terminal error, once
/// `detach()` is called. Used to exercise `Client::close()` against an in-flight call.
pub struct HangingTransport {
    detached: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl HangingTransport {
    pub fn new() -> Self {
        Self {
            detached: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }
}

impl Transport for HangingTransport {
    fn rpc(&self, _args: RpcArgs) -> RecordStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let detached = self.detached.clone();
        let notify = self.notify.clone();
        tokio::spawn(async move {
            if !detached.load(Ordering::SeqCst) {
                notify.notified().await;
            }
            let _ = tx.send(Err(Error::transport("detached", "0.0.0.0:0".parse().unwrap())));
        });
        Box::pin(UnboundedReceiverStream::new(rx))
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Bind a local listener and accept connections for as long as the test runs. `BackendConnection`
/// makes a real TCP connection; only the RPC framing above it is faked.
pub async fn local_listener() -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind local listener");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        loop {
            if listener.accept().await.is_err() {
                break;
            }
        }
    });
    addr
}

pub fn args(method: &str) -> RpcArgs {
    RpcArgs {
        method: method.to_string(),
        args: vec![],
        ignore_null_values: false,
        timeout: None,
    }
}

pub async fn wait_connected(client: &fleet_rpc::Client) {
    for _ in 0..200 {
        if client.connected() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("client never reported connected within the test timeout");
}
