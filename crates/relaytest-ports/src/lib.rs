//! Port leasing for concurrent test tasks.
//!
//! The manager owns a half-open range `[start, end)` of candidate inbound
//! ports and hands out exclusive leases. A port is leased before the OS
//! bind is attempted; if the core later fails to bind, the task records
//! `port_conflict` and the lease flows back into the pool.
//!
//! `acquire` waits (cancellation-bound) while every port is leased, so a
//! range smaller than the worker count simply serializes tasks instead of
//! failing them. Leases release exactly once: explicitly, or on drop.

use parking_lot::Mutex;
use relaytest_common::{Result, TesterError};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct PortState {
    leased: HashSet<u16>,
    /// Next port to try; rotates through the range so selection stays
    /// amortized O(1) even with a mostly-leased range.
    cursor: u16,
}

/// Thread-safe allocator over an ordered port range.
pub struct PortManager {
    start: u16,
    end: u16,
    state: Mutex<PortState>,
    freed: Notify,
}

impl PortManager {
    pub fn new(start: u16, end: u16) -> Arc<Self> {
        Arc::new(Self {
            start,
            end,
            state: Mutex::new(PortState {
                leased: HashSet::new(),
                cursor: start,
            }),
            freed: Notify::new(),
        })
    }

    /// Number of ports in the range.
    pub fn capacity(&self) -> usize {
        (self.end as usize).saturating_sub(self.start as usize)
    }

    /// Number of leases currently outstanding.
    pub fn outstanding(&self) -> usize {
        self.state.lock().leased.len()
    }

    /// Lease any free port, waiting while the range is fully leased.
    ///
    /// Returns `PortExhausted` only for a range that contains no ports at
    /// all; `Cancelled` when the token fires while waiting.
    pub async fn acquire(self: &Arc<Self>, token: &CancellationToken) -> Result<PortLease> {
        if self.capacity() == 0 {
            return Err(TesterError::PortExhausted {
                start: self.start,
                end: self.end,
            });
        }

        loop {
            if let Some(lease) = self.try_acquire() {
                return Ok(lease);
            }

            tokio::select! {
                _ = token.cancelled() => return Err(TesterError::Cancelled),
                _ = self.freed.notified() => {}
            }
        }
    }

    /// Lease any free port without waiting.
    pub fn try_acquire(self: &Arc<Self>) -> Option<PortLease> {
        let mut state = self.state.lock();
        let span = self.capacity();

        for _ in 0..span {
            let candidate = state.cursor;
            state.cursor = if candidate + 1 >= self.end {
                self.start
            } else {
                candidate + 1
            };

            if state.leased.insert(candidate) {
                debug!(port = candidate, outstanding = state.leased.len(), "port leased");
                return Some(PortLease {
                    port: candidate,
                    manager: Arc::downgrade(self),
                    released: AtomicBool::new(false),
                });
            }
        }

        None
    }

    /// Drop every outstanding lease. Shutdown-time reset; leases released
    /// afterwards become silent no-ops.
    pub fn release_all(&self) {
        let mut state = self.state.lock();
        let count = state.leased.len();
        state.leased.clear();
        state.cursor = self.start;
        drop(state);

        if count > 0 {
            debug!(count, "released all outstanding port leases");
            self.freed.notify_waiters();
        }
    }

    fn release(&self, port: u16) {
        let mut state = self.state.lock();
        if state.leased.remove(&port) {
            drop(state);
            self.freed.notify_one();
        }
    }
}

/// Exclusive claim on one port number.
///
/// Released at most once; both explicit `release` and drop are safe, in
/// any combination.
pub struct PortLease {
    port: u16,
    manager: Weak<PortManager>,
    released: AtomicBool,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Return the port to the pool. Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.release(self.port);
        }
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for PortLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortLease").field("port", &self.port).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_and_release_cycles_ports() {
        let mgr = PortManager::new(30000, 30010);
        let token = CancellationToken::new();

        let lease = mgr.acquire(&token).await.unwrap();
        assert!(lease.port() >= 30000 && lease.port() < 30010);
        assert_eq!(mgr.outstanding(), 1);

        lease.release();
        assert_eq!(mgr.outstanding(), 0);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let mgr = PortManager::new(30020, 30022);
        let token = CancellationToken::new();

        let a = mgr.acquire(&token).await.unwrap();
        let b = mgr.acquire(&token).await.unwrap();
        assert_ne!(a.port(), b.port());

        a.release();
        a.release();
        drop(a);
        assert_eq!(mgr.outstanding(), 1);
        drop(b);
        assert_eq!(mgr.outstanding(), 0);
    }

    #[tokio::test]
    async fn empty_range_is_exhausted_immediately() {
        let mgr = PortManager::new(30030, 30030);
        let token = CancellationToken::new();

        match mgr.acquire(&token).await {
            Err(TesterError::PortExhausted { .. }) => {}
            other => panic!("expected PortExhausted, got {:?}", other.map(|l| l.port())),
        }
    }

    #[tokio::test]
    async fn full_range_waits_for_a_release() {
        let mgr = PortManager::new(30040, 30041);
        let token = CancellationToken::new();

        let held = mgr.acquire(&token).await.unwrap();
        let waiter = {
            let mgr = mgr.clone();
            let token = token.clone();
            tokio::spawn(async move { mgr.acquire(&token).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        held.release();
        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(lease.port(), 30040);
    }

    #[tokio::test]
    async fn waiting_acquire_observes_cancellation() {
        let mgr = PortManager::new(30050, 30051);
        let token = CancellationToken::new();
        let _held = mgr.acquire(&token).await.unwrap();

        let waiter = {
            let mgr = mgr.clone();
            let token = token.clone();
            tokio::spawn(async move { mgr.acquire(&token).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        match waiter.await.unwrap() {
            Err(TesterError::Cancelled) => {}
            other => panic!("expected Cancelled, got {:?}", other.map(|l| l.port())),
        }
    }

    #[tokio::test]
    async fn no_port_is_ever_double_leased() {
        let mgr = PortManager::new(30060, 30065);
        let token = CancellationToken::new();
        let live = Arc::new(Mutex::new(HashSet::new()));

        let mut tasks = Vec::new();
        for _ in 0..40 {
            let mgr = mgr.clone();
            let token = token.clone();
            let live = live.clone();
            tasks.push(tokio::spawn(async move {
                let lease = mgr.acquire(&token).await.unwrap();
                assert!(
                    live.lock().insert(lease.port()),
                    "port {} leased twice",
                    lease.port()
                );
                tokio::time::sleep(Duration::from_millis(5)).await;
                live.lock().remove(&lease.port());
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(mgr.outstanding(), 0);
    }

    #[tokio::test]
    async fn release_all_resets_state() {
        let mgr = PortManager::new(30070, 30075);
        let token = CancellationToken::new();

        let a = mgr.acquire(&token).await.unwrap();
        let b = mgr.acquire(&token).await.unwrap();
        assert_eq!(mgr.outstanding(), 2);

        mgr.release_all();
        assert_eq!(mgr.outstanding(), 0);

        // Late releases from the pre-reset leases stay silent.
        a.release();
        b.release();
        assert_eq!(mgr.outstanding(), 0);
    }
}
