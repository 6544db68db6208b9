//! Ledger of forwarded DNS queries awaiting an upstream answer.
//!
//! Entries are indexed two ways: a binary min-heap ordered by expiry
//! drives timeout eviction, and a transaction-id map gives O(log n)
//! removal when the answer arrives. Both structures live behind one
//! mutex and are updated together on every heap move.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// How long an unanswered upstream query stays correlatable.
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// One forwarded DNS request: who asked, under which transaction id, and
/// for which name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub txid: u16,
    pub client: SocketAddr,
    pub host: String,
}

struct Slot {
    txid: u16,
    expires: Instant,
    query: DnsQuery,
}

#[derive(Default)]
struct Inner {
    heap: Vec<Slot>,
    index: HashMap<u16, usize>,
}

impl Inner {
    fn swap_slots(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].txid, i);
        self.index.insert(self.heap[j].txid, j);
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.heap[pos].expires >= self.heap[parent].expires {
                break;
            }
            self.swap_slots(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;
            if left < self.heap.len() && self.heap[left].expires < self.heap[smallest].expires {
                smallest = left;
            }
            if right < self.heap.len() && self.heap[right].expires < self.heap[smallest].expires {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.swap_slots(pos, smallest);
            pos = smallest;
        }
    }

    fn push(&mut self, slot: Slot) {
        let pos = self.heap.len();
        self.index.insert(slot.txid, pos);
        self.heap.push(slot);
        self.sift_up(pos);
    }

    /// Removes the slot at an arbitrary heap position, keeping both the
    /// heap order and the transaction-id index intact.
    fn remove_at(&mut self, pos: usize) -> Slot {
        let last = self.heap.len() - 1;
        if pos != last {
            self.swap_slots(pos, last);
        }
        let slot = self.heap.pop().expect("heap position out of range");
        self.index.remove(&slot.txid);
        if pos < self.heap.len() {
            // The displaced slot may need to move either way.
            self.sift_down(pos);
            self.sift_up(pos);
        }
        slot
    }
}

/// Shared ledger of in-flight queries with background timeout eviction.
pub struct QueryLedger {
    inner: Mutex<Inner>,
    wake: Notify,
    timeout: Duration,
}

impl QueryLedger {
    pub fn new() -> Self {
        Self::with_timeout(QUERY_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            wake: Notify::new(),
            timeout,
        }
    }

    /// Registers a forwarded query and wakes the eviction task so it can
    /// re-arm its timer. A colliding transaction id silently replaces the
    /// older entry, which can no longer be answered anyway.
    pub fn insert(&self, query: DnsQuery) {
        let expires = Instant::now() + self.timeout;
        {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            if let Some(&pos) = inner.index.get(&query.txid) {
                let evicted = inner.remove_at(pos);
                debug!(
                    "transaction id {} reused, dropping older query for {}",
                    evicted.txid, evicted.query.host
                );
            }
            inner.push(Slot {
                txid: query.txid,
                expires,
                query,
            });
        }
        self.wake.notify_one();
    }

    /// Claims and removes the query registered under a transaction id.
    pub fn remove(&self, txid: u16) -> Option<DnsQuery> {
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };
        let pos = *inner.index.get(&txid)?;
        Some(inner.remove_at(pos).query)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.heap.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pops every expired entry off the heap root and reports the expiry
    /// of the earliest surviving entry, if any.
    fn evict_expired(&self, now: Instant) -> Option<Instant> {
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };
        while let Some(root) = inner.heap.first() {
            if root.expires > now {
                break;
            }
            let slot = inner.remove_at(0);
            warn!(
                "upstream DNS timeout for {} (txid {})",
                slot.query.host, slot.txid
            );
        }
        inner.heap.first().map(|slot| slot.expires)
    }

    /// Timeout eviction loop. Sleeps until the earliest expiry when one is
    /// known, otherwise parks until an insert wakes it. Wakeups coalesce:
    /// any number of inserts while the task is busy produce at most one
    /// extra pass.
    pub async fn run_eviction(self: std::sync::Arc<Self>) {
        let mut deadline: Option<Instant> = None;
        loop {
            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = sleep_until(at) => {}
                        _ = self.wake.notified() => {}
                    }
                }
                None => self.wake.notified().await,
            }
            deadline = self.evict_expired(Instant::now());
        }
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let inner = self.inner.lock().unwrap();
        assert_eq!(inner.index.len(), inner.heap.len());
        for (pos, slot) in inner.heap.iter().enumerate() {
            assert_eq!(inner.index[&slot.txid], pos);
            if pos > 0 {
                let parent = (pos - 1) / 2;
                assert!(inner.heap[parent].expires <= slot.expires);
            }
        }
    }
}

impl Default for QueryLedger {
    fn default() -> Self {
        Self::new()
    }
}
