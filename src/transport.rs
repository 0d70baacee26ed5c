//! The external `Transport` contract. This crate does not define the bytes on the wire of any
//! particular RPC protocol; it only needs a multiplexed, framed channel that can issue a call and
//! stream back records. `BackendConnection` owns the socket and hands out a `Transport` for the
//! multiplexed call surface above it.

use std::{pin::Pin, time::Duration};

use futures_core::Stream;

use crate::error::Result;

/// Arguments to a single RPC.
#[derive(Clone, Debug)]
pub struct RpcArgs {
    pub method: String,
    pub args: Vec<RpcValue>,
    pub ignore_null_values: bool,
    pub timeout: Option<Duration>,
}

/// A value passed to or received from an RPC. Left deliberately opaque (`Raw`) since the wire
/// encoding is outside this core's scope; higher-level verb shims are expected to convert to and
/// from their own value types.
#[derive(Clone, Debug)]
pub enum RpcValue {
    Raw(Vec<u8>),
}

/// A lazy, finite stream of records terminated by `Ok(None)` or an error. Implementations poll
/// the underlying multiplexed channel for the next record or terminal status.
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<RpcValue>> + Send>>;

/// The multiplexed RPC channel exposed by one connected [`BackendConnection`].
///
/// [`BackendConnection`]: crate::connection::BackendConnection
pub trait Transport: Send + Sync {
    /// Issue an RPC, returning a stream of data records terminated by the end of the call.
    fn rpc(&self, args: RpcArgs) -> RecordStream;

    /// Tear this transport off its socket. Every `Request` returned by a prior `rpc()` call that
    /// has not yet reached a terminal state must subsequently yield a terminal error. Called
    /// exactly once, from [`Client::close`](crate::client::Client::close).
    fn detach(&self);
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use super::*;
    use crate::error::Error;

    /// A `Transport` double that replays a canned script of records and can be `detach()`ed to
    /// simulate a forced shutdown, used to exercise real pool/client logic without a real wire
    /// protocol.
    pub(crate) struct FakeTransport {
        detached: Arc<AtomicBool>,
        script: Vec<Result<RpcValue>>,
    }

    impl FakeTransport {
        pub(crate) fn new() -> Self {
            Self::with_script(vec![Ok(RpcValue::Raw(vec![]))])
        }

        pub(crate) fn with_script(script: Vec<Result<RpcValue>>) -> Self {
            Self {
                detached: Arc::new(AtomicBool::new(false)),
                script,
            }
        }
    }

    impl Transport for FakeTransport {
        fn rpc(&self, _args: RpcArgs) -> RecordStream {
            let (tx, rx) = mpsc::unbounded_channel();
            let detached = self.detached.clone();
            let script = self.script.clone();
            tokio::spawn(async move {
                if detached.load(Ordering::SeqCst) {
                    let _ = tx.send(Err(Error::transport(
                        "detached",
                        "0.0.0.0:0".parse().unwrap(),
                    )));
                    return;
                }
                for item in script {
                    if tx.send(item).is_err() {
                        return;
                    }
                }
            });
            Box::pin(UnboundedReceiverStream::new(rx))
        }

        fn detach(&self) {
            self.detached.store(true, Ordering::SeqCst);
        }
    }
}
