//! Management requests sent to the pool worker: connection add/remove notifications from the
//! [`ConnectionSet`](crate::connection_set::ConnectionSet), allocation releases, and the
//! fallback-disable command issued at client shutdown.
//!
//! A cloneable sender that does *not* keep the worker alive (unlike [`AllocateRequester`], which
//! does), paired with an enum of the requests the worker's event loop prioritizes over new
//! checkouts.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{connection::BackendConnection, connection_set::Handle};

pub(super) fn channel() -> (PoolManager, ManagementReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (PoolManager { sender }, ManagementReceiver { receiver })
}

#[derive(Clone, Debug)]
pub(crate) struct PoolManager {
    sender: mpsc::UnboundedSender<PoolManagementRequest>,
}

impl PoolManager {
    pub(crate) fn added(&self, key: String, conn: Arc<BackendConnection>, handle: Handle) {
        let _ = self
            .sender
            .send(PoolManagementRequest::Added { key, conn, handle });
    }

    pub(crate) fn removed(&self, key: String) {
        let _ = self.sender.send(PoolManagementRequest::Removed { key });
    }

    /// Release the allocation identified by `key`. Idempotency/"exactly once" is enforced by the
    /// caller ([`RequestAllocation`](crate::request::RequestAllocation)), not here: by the time
    /// this is called, it is assumed to be the single authoritative release for that allocation.
    pub(crate) fn release(&self, key: String) {
        let _ = self.sender.send(PoolManagementRequest::Release { key });
    }

    pub(crate) fn fallback_disable(&self) {
        let _ = self.sender.send(PoolManagementRequest::FallbackDisable);
    }
}

pub(super) enum PoolManagementRequest {
    Added {
        key: String,
        conn: Arc<BackendConnection>,
        handle: Handle,
    },
    Removed {
        key: String,
    },
    Release {
        key: String,
    },
    FallbackDisable,
}

pub(super) struct ManagementReceiver {
    receiver: mpsc::UnboundedReceiver<PoolManagementRequest>,
}

impl ManagementReceiver {
    pub(super) async fn recv(&mut self) -> Option<PoolManagementRequest> {
        self.receiver.recv().await
    }
}
