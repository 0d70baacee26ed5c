//! The connection pool: the heart of this crate. Public surface is
//! deliberately thin — `allocate`, `release` (via the [`PoolManager`] a [`RequestAllocation`]
//! holds), `fallback_disable`, plus the `added`/`removed` notifications the
//! [`ConnectionSet`](crate::connection_set) drives it with. All state lives inside the worker
//! task spawned by [`ConnectionPool::start`]; nothing here takes a lock.

mod manager;
mod requester;
mod worker;
mod worker_handle;

use std::time::Duration;

pub(crate) use manager::PoolManager;
pub(crate) use requester::Allocated;
use requester::AllocateRequester;

use crate::error::Result;

pub(crate) struct ConnectionPool {
    requester: AllocateRequester,
    manager: PoolManager,
}

impl ConnectionPool {
    pub(crate) fn start(fallback_max: Duration) -> Self {
        let (requester, manager) = worker::PoolWorker::start(fallback_max);
        Self { requester, manager }
    }

    pub(crate) async fn allocate(&self) -> Result<Allocated> {
        self.requester.allocate().await
    }

    /// A cloneable handle the [`ConnectionSet`](crate::connection_set) uses to report discovered
    /// backends and drive lifecycle commands. Does not keep the pool worker alive.
    pub(crate) fn manager(&self) -> PoolManager {
        self.manager.clone()
    }

    pub(crate) fn fallback_disable(&self) {
        self.manager.fallback_disable();
    }
}
