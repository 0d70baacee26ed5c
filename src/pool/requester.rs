//! Requesting an allocation from the pool worker: a cloneable requester that keeps the worker
//! alive (by holding a [`WorkerHandle`]), paired with a receiver the worker polls in its event
//! loop.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::worker_handle::WorkerHandle;
use crate::{connection::BackendConnection, error::Result};

pub(super) fn channel(handle: WorkerHandle) -> (AllocateRequester, AllocateReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        AllocateRequester {
            sender,
            _handle: handle,
        },
        AllocateReceiver { receiver },
    )
}

/// An allocated connection: the key of the `PoolEntry` it was drawn from, and the connection
/// itself. Carries no `released` flag of its own — that lives on
/// [`RequestAllocation`](crate::request::RequestAllocation), which wraps this.
#[derive(Clone)]
pub(crate) struct Allocated {
    pub(crate) key: String,
    pub(crate) conn: Arc<BackendConnection>,
}

#[derive(Clone, Debug)]
pub(crate) struct AllocateRequester {
    sender: mpsc::UnboundedSender<oneshot::Sender<Result<Allocated>>>,
    _handle: WorkerHandle,
}

impl AllocateRequester {
    /// Ask the pool worker for a connection. Round-trips through the worker's event loop, so the
    /// result is never observed "inline" relative to other pool state changes the worker is
    /// concurrently processing.
    pub(crate) async fn allocate(&self) -> Result<Allocated> {
        let (sender, receiver) = oneshot::channel();
        if self.sender.send(sender).is_err() {
            return Err(crate::error::Error::client_closed());
        }
        receiver
            .await
            .unwrap_or_else(|_| Err(crate::error::Error::client_closed()))
    }
}

pub(super) struct AllocateReceiver {
    receiver: mpsc::UnboundedReceiver<oneshot::Sender<Result<Allocated>>>,
}

impl AllocateReceiver {
    pub(super) async fn recv(&mut self) -> Option<oneshot::Sender<Result<Allocated>>> {
        self.receiver.recv().await
    }
}
