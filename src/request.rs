//! `RequestAllocation` and `RequestContext` — per-request bookkeeping wrapping one pool
//! allocation.
//!
//! A `RequestContext` could otherwise form a reference cycle back through the pool to its own
//! entry; that's avoided here by ownership instead: a context holds only its allocation's key and
//! a [`PoolManager`] handle, re-resolving the entry through the pool worker at release time.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures_core::Stream;
use futures_util::StreamExt;

use crate::{
    connection::BackendConnection,
    error::Result,
    pool::{Allocated, PoolManager},
    transport::{RecordStream, RpcArgs, RpcValue, Transport},
};

/// One allocation drawn from the pool. Single-use: [`release`](Self::release) must be called
/// exactly once over its lifetime; a second explicit call is a programmer-integrity failure, not
/// a recoverable error. A [`Drop`] safety net releases an allocation that was never explicitly
/// released, without panicking — this only happens if a caller drops a `RequestAllocation`
/// without going through [`ReleaseGuard`], which the rest of this crate never does.
pub(crate) struct RequestAllocation {
    key: String,
    conn: Arc<BackendConnection>,
    manager: PoolManager,
    released: AtomicBool,
}

impl RequestAllocation {
    pub(crate) fn new(allocated: Allocated, manager: PoolManager) -> Self {
        Self {
            key: allocated.key,
            conn: allocated.conn,
            manager,
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.conn.transport()
    }

    /// Release this allocation back to the pool. Panics if called more than once.
    pub(crate) fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            panic!(
                "RequestAllocation for key {:?} released more than once",
                self.key
            );
        }
        self.manager.release(self.key.clone());
    }
}

impl Drop for RequestAllocation {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.manager.release(self.key.clone());
        }
    }
}

/// Funnels both release disciplines (release-before-callback for unary calls,
/// release-on-first-terminal-event for streaming calls) through one path: release fires on
/// whichever of "unary result ready" or "stream reached a terminal item" happens first, and only
/// once, because both consume `self`. See DESIGN.md for why this crate picked one discipline
/// uniformly instead of the two separate ones.
pub(crate) struct ReleaseGuard {
    allocation: RequestAllocation,
}

impl ReleaseGuard {
    pub(crate) fn new(allocation: RequestAllocation) -> Self {
        Self { allocation }
    }

    /// Issue `args` on this allocation's transport, collecting every record before releasing.
    /// Matches "wrap the user callback so release runs before it" for unary-style callers.
    pub(crate) async fn call_unary(self, args: RpcArgs) -> Result<Vec<RpcValue>> {
        let mut stream = self.allocation.transport().rpc(args);
        let mut records = Vec::new();
        let result = loop {
            match stream.next().await {
                Some(Ok(value)) => records.push(value),
                Some(Err(e)) => break Err(e),
                None => break Ok(records),
            }
        };
        self.allocation.release();
        result
    }

    /// Issue `args`, returning a stream that releases this allocation the moment it yields its
    /// first terminal item (`None` or `Some(Err(_))`), per the streaming release discipline.
    pub(crate) fn call_stream(self, args: RpcArgs) -> ReleasingStream {
        let inner = self.allocation.transport().rpc(args);
        ReleasingStream {
            inner,
            allocation: Some(self.allocation),
        }
    }
}

/// A [`RecordStream`] wrapper that releases its allocation exactly once, at the first terminal
/// item. Further polls after release return `None` immediately (it is fused).
pub(crate) struct ReleasingStream {
    inner: RecordStream,
    allocation: Option<RequestAllocation>,
}

impl Stream for ReleasingStream {
    type Item = Result<RpcValue>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;

        let this = self.get_mut();
        if this.allocation.is_none() {
            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(value))) => Poll::Ready(Some(Ok(value))),
            Poll::Ready(Some(Err(e))) => {
                if let Some(allocation) = this.allocation.take() {
                    allocation.release();
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let Some(allocation) = this.allocation.take() {
                    allocation.release();
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{connection_set::Handle, pool::ConnectionPool, test_support};

    fn args(method: &str) -> RpcArgs {
        RpcArgs {
            method: method.to_string(),
            args: vec![],
            ignore_null_values: false,
            timeout: None,
        }
    }

    async fn single_allocation(script: Vec<Result<RpcValue>>) -> (ConnectionPool, RequestAllocation) {
        let pool = ConnectionPool::start(Duration::from_secs(1));
        let (handle, _drained) = Handle::for_test("a");
        pool.manager()
            .added("a".to_string(), test_support::fake_connection_with(script).await, handle);
        tokio::task::yield_now().await;
        let allocated = pool.allocate().await.unwrap();
        let manager = pool.manager();
        (pool, RequestAllocation::new(allocated, manager))
    }

    #[tokio::test]
    async fn call_unary_collects_every_record_then_releases() {
        let (pool, allocation) = single_allocation(vec![
            Ok(RpcValue::Raw(vec![1])),
            Ok(RpcValue::Raw(vec![2])),
        ])
        .await;
        let guard = ReleaseGuard::new(allocation);

        let records = guard.call_unary(args("get")).await.unwrap();
        assert_eq!(records.len(), 2);

        // released back to the pool: a fresh allocate() finds "a" available again.
        let reallocated = pool.allocate().await.unwrap();
        assert_eq!(reallocated.key, "a");
    }

    #[tokio::test]
    async fn call_unary_surfaces_a_transport_error_and_still_releases() {
        let (pool, allocation) = single_allocation(vec![Err(crate::error::Error::transport(
            "boom",
            "127.0.0.1:1".parse().unwrap(),
        ))])
        .await;
        let guard = ReleaseGuard::new(allocation);

        let result = guard.call_unary(args("get")).await;
        assert!(result.is_err());

        let reallocated = pool.allocate().await.unwrap();
        assert_eq!(reallocated.key, "a");
    }

    #[tokio::test]
    async fn call_stream_releases_on_first_terminal_item() {
        use futures_util::StreamExt;

        let (pool, allocation) = single_allocation(vec![Ok(RpcValue::Raw(vec![9]))]).await;
        let guard = ReleaseGuard::new(allocation);

        let mut stream = guard.call_stream(args("watch"));
        assert!(matches!(stream.next().await, Some(Ok(_))));
        assert!(stream.next().await.is_none());

        let reallocated = pool.allocate().await.unwrap();
        assert_eq!(reallocated.key, "a");
    }

    #[tokio::test]
    #[should_panic(expected = "released more than once")]
    async fn releasing_an_allocation_twice_panics() {
        let (_pool, allocation) = single_allocation(vec![Ok(RpcValue::Raw(vec![]))]).await;
        allocation.release();
        allocation.release();
    }
}
