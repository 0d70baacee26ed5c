//! The pool worker: a single task owning all pool state, driven by an event loop. This is the
//! heart of the crate. A `tokio::select! { biased; ... }` loop services management requests
//! (add, remove, release, fallback-disable) ahead of new checkout requests, and exits once every
//! handle to the pool has been dropped.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use tokio::time::Instant;
use tracing::debug;

use super::{
    manager::{self, PoolManagementRequest},
    requester::{self, Allocated},
    worker_handle,
};
use crate::{connection::BackendConnection, connection_set::Handle, error::Error};

/// State an entry can be in while still reachable from the pool. `Deleted` is not represented as
/// a variant: a deleted entry is simply removed from every collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntryState {
    Avail,
    Drain,
}

struct PoolEntry {
    key: String,
    conn: Arc<BackendConnection>,
    handle: Handle,
    outstanding: u32,
    state: EntryState,
}

/// A `(outstanding, key)` pair ordered so that `BinaryHeap::pop` returns the *smallest*
/// outstanding count first (a max-heap over `Reverse` order). Entries are never mutated in
/// place or removed early; staleness is handled lazily at pop time by checking `avail`.
struct PqItem {
    outstanding: u32,
    key: String,
}

impl PartialEq for PqItem {
    fn eq(&self, other: &Self) -> bool {
        self.outstanding == other.outstanding && self.key == other.key
    }
}
impl Eq for PqItem {}
impl PartialOrd for PqItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PqItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, and we want the minimum outstanding count on top.
        other
            .outstanding
            .cmp(&self.outstanding)
            .then_with(|| other.key.cmp(&self.key))
    }
}

pub(crate) struct PoolWorker {
    entries: HashMap<String, PoolEntry>,
    /// Exactly the keys whose entry is `Avail`.
    avail: HashSet<String>,
    pq: BinaryHeap<PqItem>,
    /// Entries that are `Drain`ing, kept reachable only so `release` can find them and finish the
    /// drain once `outstanding` reaches zero. Not part of `avail` or `pq`.
    draining: HashMap<String, PoolEntry>,
    fallback: Option<PoolEntry>,
    fallback_since: Option<Instant>,
    fallback_enabled: bool,
    fallback_max: Duration,

    allocate_receiver: requester::AllocateReceiver,
    management_receiver: manager::ManagementReceiver,
    handle_listener: worker_handle::WorkerHandleListener,
}

impl PoolWorker {
    pub(crate) fn start(
        fallback_max: Duration,
    ) -> (requester::AllocateRequester, manager::PoolManager) {
        let (handle, handle_listener) = worker_handle::channel();
        let (allocate_requester, allocate_receiver) = requester::channel(handle);
        let (manager, management_receiver) = manager::channel();

        let worker = PoolWorker {
            entries: HashMap::new(),
            avail: HashSet::new(),
            pq: BinaryHeap::new(),
            draining: HashMap::new(),
            fallback: None,
            fallback_since: None,
            fallback_enabled: true,
            fallback_max,
            allocate_receiver,
            management_receiver,
            handle_listener,
        };

        tokio::spawn(worker.execute());

        (allocate_requester, manager)
    }

    async fn execute(mut self) {
        loop {
            tokio::select! {
                biased;

                Some(request) = self.management_receiver.recv() => {
                    self.handle_management(request);
                }
                _ = self.handle_listener.wait_for_all_handle_drops() => {
                    break;
                }
                Some(reply) = self.allocate_receiver.recv() => {
                    let result = self.allocate();
                    let _ = reply.send(result);
                }
                else => break,
            }
        }
    }

    fn handle_management(&mut self, request: PoolManagementRequest) {
        match request {
            PoolManagementRequest::Added { key, conn, handle } => self.on_added(key, conn, handle),
            PoolManagementRequest::Removed { key } => self.on_removed(key),
            PoolManagementRequest::Release { key } => self.on_release(key),
            PoolManagementRequest::FallbackDisable => self.on_fallback_disable(),
        }
    }

    /// A new connection becomes `Avail`, displacing any existing fallback.
    fn on_added(&mut self, key: String, conn: Arc<BackendConnection>, handle: Handle) {
        if let Some(fallback) = self.fallback.take() {
            self.fallback_since = None;
            debug!(key = %fallback.key, "fallback superseded by new connection");
            self.drain_or_delete(fallback, EntryState::Drain);
        }

        debug!(%key, "connection added");
        self.avail.insert(key.clone());
        self.pq.push(PqItem {
            outstanding: 0,
            key: key.clone(),
        });
        self.entries.insert(
            key.clone(),
            PoolEntry {
                key,
                conn,
                handle,
                outstanding: 0,
                state: EntryState::Avail,
            },
        );
    }

    /// A connection leaves `Avail`, either into `Drain` or, if it would leave `avail` empty, into
    /// the fallback slot.
    fn on_removed(&mut self, key: String) {
        let Some(mut entry) = self.entries.remove(&key) else {
            return;
        };
        self.avail.remove(&key);

        let other_avail_exists = !self.avail.is_empty();
        let destroyed = entry.conn.is_destroyed();

        if other_avail_exists || !self.fallback_enabled || destroyed {
            entry.state = EntryState::Drain;
            self.drain_or_delete(entry, EntryState::Drain);
        } else {
            debug_assert!(self.fallback.is_none(), "rule 1 guarantees no pre-existing fallback");
            entry.state = EntryState::Drain; // irrelevant once stored as fallback, kept for Debug clarity
            debug!(key = %entry.key, "connection entering fallback");
            self.fallback_since = Some(Instant::now());
            self.fallback = Some(entry);
        }
    }

    /// Transition 3: move an entry to `Drain`, deleting it immediately if nothing is outstanding.
    fn drain_or_delete(&mut self, entry: PoolEntry, _state: EntryState) {
        if entry.outstanding == 0 {
            debug!(key = %entry.key, "connection deleted");
            entry.handle.release();
        } else {
            debug!(key = %entry.key, outstanding = entry.outstanding, "connection draining");
            self.draining.insert(entry.key.clone(), entry);
        }
    }

    /// Release one allocation, wherever its entry currently lives.
    fn on_release(&mut self, key: String) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.outstanding -= 1;
            if entry.state == EntryState::Avail {
                self.pq.push(PqItem {
                    outstanding: entry.outstanding,
                    key,
                });
            }
            return;
        }

        if let Some(fallback) = &mut self.fallback {
            if fallback.key == key {
                fallback.outstanding -= 1;
                // Rule 5: releasing a fallback allocation does nothing further — it stays
                // fallback until displaced or expired.
                return;
            }
        }

        if let Some(entry) = self.draining.get_mut(&key) {
            entry.outstanding -= 1;
            if entry.outstanding == 0 {
                let entry = self.draining.remove(&key).expect("just checked above");
                debug!(key = %entry.key, "connection deleted (drain complete)");
                entry.handle.release();
            }
            return;
        }

        tracing::error!(%key, "release for a key with no matching pool entry");
    }

    fn on_fallback_disable(&mut self) {
        self.fallback_enabled = false;
        if let Some(fallback) = self.fallback.take() {
            self.fallback_since = None;
            debug!(key = %fallback.key, "fallback disabled at shutdown");
            self.drain_or_delete(fallback, EntryState::Drain);
        }
    }

    /// Choose a connection for a new request.
    fn allocate(&mut self) -> crate::error::Result<Allocated> {
        if !self.avail.is_empty() {
            while let Some(item) = self.pq.pop() {
                if !self.avail.contains(&item.key) {
                    continue; // stale: popped key is no longer Avail, skip it.
                }
                let entry = self
                    .entries
                    .get_mut(&item.key)
                    .expect("avail set and entries map stay in sync");
                entry.outstanding += 1;
                self.pq.push(PqItem {
                    outstanding: entry.outstanding,
                    key: entry.key.clone(),
                });
                return Ok(Allocated {
                    key: entry.key.clone(),
                    conn: entry.conn.clone(),
                });
            }
            unreachable!("avail is non-empty but pq held no matching entry; added() always pushes one");
        }

        if let Some(fallback) = &mut self.fallback {
            let since = self
                .fallback_since
                .expect("fallback present implies fallback_since present (invariant)");
            if since.elapsed() > self.fallback_max {
                let fallback = self.fallback.take().expect("just matched Some");
                self.fallback_since = None;
                debug!(key = %fallback.key, "fallback expired");
                self.drain_or_delete(fallback, EntryState::Drain);
                return Err(Error::no_backends());
            }
            fallback.outstanding += 1;
            return Ok(Allocated {
                key: fallback.key.clone(),
                conn: fallback.conn.clone(),
            });
        }

        Err(Error::no_backends())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{connection_set::Handle, test_support::fake_connection};

    #[tokio::test]
    async fn allocate_fails_with_no_backends_when_empty() {
        let (requester, _manager) = PoolWorker::start(Duration::from_secs(1));
        let err = requester.allocate().await.unwrap_err();
        assert!(err.is_no_backends());
    }

    #[tokio::test]
    async fn least_outstanding_routing_alternates_between_idle_connections() {
        let (requester, manager) = PoolWorker::start(Duration::from_secs(1));
        let (handle_a, _drain_a) = Handle::for_test("a");
        let (handle_b, _drain_b) = Handle::for_test("b");
        manager.added("a".to_string(), fake_connection().await, handle_a);
        manager.added("b".to_string(), fake_connection().await, handle_b);
        tokio::task::yield_now().await;

        // both start at outstanding=0; ties break by key, so "a" is handed out first.
        let first = requester.allocate().await.unwrap();
        assert_eq!(first.key, "a");
        let second = requester.allocate().await.unwrap();
        assert_eq!(second.key, "b");
        // both now have outstanding=1; the next request again goes to whichever key sorts first.
        let third = requester.allocate().await.unwrap();
        assert_eq!(third.key, "a");
    }

    #[tokio::test]
    async fn fallback_serves_requests_until_the_window_expires() {
        tokio::time::pause();
        let (requester, manager) = PoolWorker::start(Duration::from_millis(100));
        let (handle, mut drained) = Handle::for_test("only");
        manager.added("only".to_string(), fake_connection().await, handle);
        tokio::task::yield_now().await;

        manager.removed("only".to_string());
        tokio::task::yield_now().await;

        // no longer AVAIL, but still within the fallback window.
        let allocated = requester.allocate().await.unwrap();
        assert_eq!(allocated.key, "only");
        manager.release(allocated.key.clone());

        tokio::time::advance(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;

        let err = requester.allocate().await.unwrap_err();
        assert!(err.is_no_backends());

        // the expired fallback entry had nothing outstanding, so it deletes (and releases)
        // immediately rather than sitting in `draining`.
        let released_key = drained.recv().await;
        assert_eq!(released_key.as_deref(), Some("only"));
    }

    #[tokio::test]
    async fn removing_the_only_avail_connection_with_fallback_disabled_drains_immediately() {
        let (requester, manager) = PoolWorker::start(Duration::from_secs(1));
        let (handle, mut drained) = Handle::for_test("only");
        manager.added("only".to_string(), fake_connection().await, handle);
        tokio::task::yield_now().await;

        manager.fallback_disable();
        manager.removed("only".to_string());
        tokio::task::yield_now().await;

        let released_key = drained.recv().await;
        assert_eq!(released_key.as_deref(), Some("only"));

        let err = requester.allocate().await.unwrap_err();
        assert!(err.is_no_backends());
    }

    #[tokio::test]
    async fn a_draining_connection_deletes_only_once_outstanding_reaches_zero() {
        let (requester, manager) = PoolWorker::start(Duration::from_secs(1));
        let (handle_a, mut drained_a) = Handle::for_test("a");
        let (handle_b, _drain_b) = Handle::for_test("b");
        manager.added("a".to_string(), fake_connection().await, handle_a);
        tokio::task::yield_now().await;

        let allocated = requester.allocate().await.unwrap();
        assert_eq!(allocated.key, "a");

        // with another AVAIL entry present, removing "a" drains it instead of making it fallback.
        manager.added("b".to_string(), fake_connection().await, handle_b);
        tokio::task::yield_now().await;
        manager.removed("a".to_string());
        tokio::task::yield_now().await;

        // still outstanding: not yet released.
        assert!(drained_a.try_recv().is_err());

        manager.release(allocated.key.clone());
        let released_key = drained_a.recv().await;
        assert_eq!(released_key.as_deref(), Some("a"));
    }
}
