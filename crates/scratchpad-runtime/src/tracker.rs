//! Process-scoped registry of listeners opened by guest code.
//!
//! Every guest server (`net.createServer`, `new net.Server`,
//! `http.createServer`, `new http.Server`) binds through
//! [`ServerTracker::listen`], so nothing can open a port without being
//! tracked. The tracker can force-close everything it knows about before
//! the next run binds the same ports again.

use crate::error::EngineError;
use crate::net::NetResult;
use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub type ListenerId = u32;

/// Upper bound on waiting for one listener to report closed.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

const LISTEN_BACKLOG: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerKind {
    Tcp,
    Http,
}

/// How an accept loop should wind down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Stop accepting, let open connections finish (guest `server.close()`).
    Graceful,
    /// Stop accepting and abort open connections (pre-run cleanup).
    Force,
}

struct TrackedListener {
    local_addr: SocketAddr,
    kind: ListenerKind,
    shutdown: Option<oneshot::Sender<CloseMode>>,
    closed: watch::Receiver<bool>,
}

type ListenerMap = Arc<DashMap<ListenerId, TrackedListener>>;

/// A freshly bound listener, handed to the accept loop that serves it.
pub struct BoundListener {
    pub id: ListenerId,
    pub kind: ListenerKind,
    pub local_addr: SocketAddr,
    pub listener: TcpListener,
    /// Fires when the tracker (or the guest) asks the loop to stop.
    pub shutdown: oneshot::Receiver<CloseMode>,
    /// Drop this once the loop has stopped.
    pub closed: ClosedGuard,
}

/// Untracks its listener and signals "closed" when dropped.
///
/// Held by the accept loop, so the entry disappears whichever side closed
/// the listener, including when the loop's task is aborted.
pub struct ClosedGuard {
    id: ListenerId,
    listeners: ListenerMap,
    signal: watch::Sender<bool>,
}

impl Drop for ClosedGuard {
    fn drop(&mut self) {
        self.listeners.remove(&self.id);
        let _ = self.signal.send(true);
        debug!(listener_id = self.id, "Listener closed");
    }
}

/// Outcome of [`ServerTracker::close_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub closed: usize,
    pub failed: usize,
}

/// The single factory and registry for guest listeners.
pub struct ServerTracker {
    listeners: ListenerMap,
    next_id: AtomicU32,
}

impl Default for ServerTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerTracker {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(DashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Bind a TCP listener and start tracking it.
    ///
    /// Binding is synchronous so the entry exists before the guest call
    /// returns. Must be called within a Tokio runtime context.
    pub fn listen(&self, kind: ListenerKind, addr: SocketAddr) -> NetResult<BoundListener> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        #[cfg(not(windows))]
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;
        let local_addr = listener.local_addr()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        self.listeners.insert(
            id,
            TrackedListener {
                local_addr,
                kind,
                shutdown: Some(shutdown_tx),
                closed: closed_rx,
            },
        );

        info!(
            listener_id = id,
            kind = ?kind,
            addr = %local_addr,
            total = self.listeners.len(),
            "Listener tracked"
        );

        Ok(BoundListener {
            id,
            kind,
            local_addr,
            listener,
            shutdown: shutdown_rx,
            closed: ClosedGuard {
                id,
                listeners: self.listeners.clone(),
                signal: closed_tx,
            },
        })
    }

    pub fn listen_tcp(&self, addr: SocketAddr) -> NetResult<BoundListener> {
        self.listen(ListenerKind::Tcp, addr)
    }

    pub fn listen_http(&self, addr: SocketAddr) -> NetResult<BoundListener> {
        self.listen(ListenerKind::Http, addr)
    }

    /// Ask one listener to stop. Returns `false` if it is unknown or already closing.
    pub fn close(&self, id: ListenerId, mode: CloseMode) -> bool {
        let Some(mut entry) = self.listeners.get_mut(&id) else {
            return false;
        };
        match entry.shutdown.take() {
            Some(tx) => tx.send(mode).is_ok(),
            None => false,
        }
    }

    /// Force-close every tracked listener and wait for each to report closed.
    ///
    /// Close requests go out concurrently. Each wait is bounded by
    /// [`CLOSE_TIMEOUT`]; a listener that misses it is logged and forgotten.
    /// Returns immediately when nothing is tracked.
    pub async fn close_all(&self) -> CleanupReport {
        let pending: Vec<(ListenerId, watch::Receiver<bool>)> = self
            .listeners
            .iter_mut()
            .map(|mut entry| {
                if let Some(tx) = entry.shutdown.take() {
                    let _ = tx.send(CloseMode::Force);
                }
                (*entry.key(), entry.closed.clone())
            })
            .collect();

        if pending.is_empty() {
            return CleanupReport::default();
        }

        info!(count = pending.len(), "Closing tracked listeners");

        let mut waits = JoinSet::new();
        for (id, mut closed) in pending {
            waits.spawn(async move {
                let result = tokio::time::timeout(CLOSE_TIMEOUT, closed.wait_for(|done| *done)).await;
                // A dropped sender means the guard is gone, which is also closed.
                (id, result.is_ok())
            });
        }

        let mut report = CleanupReport::default();
        while let Some(joined) = waits.join_next().await {
            match joined {
                Ok((_, true)) => report.closed += 1,
                Ok((id, false)) => {
                    report.failed += 1;
                    let err = EngineError::ListenerCleanup(format!(
                        "listener {id} did not close within {}s",
                        CLOSE_TIMEOUT.as_secs()
                    ));
                    warn!(listener_id = id, error = %err, "Listener cleanup failed");
                    self.listeners.remove(&id);
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(error = %e, "Listener cleanup task failed");
                }
            }
        }

        info!(
            closed = report.closed,
            failed = report.failed,
            "Tracked listeners cleaned up"
        );
        report
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        self.listeners.contains_key(&id)
    }

    /// Local addresses of every tracked listener.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|entry| entry.local_addr).collect()
    }

    /// Local addresses of tracked listeners of one kind.
    pub fn addresses_of(&self, kind: ListenerKind) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| entry.local_addr)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    /// Accept loop stand-in: waits for shutdown, then drops the guard.
    fn serve(bound: BoundListener) {
        tokio::spawn(async move {
            let BoundListener {
                shutdown, closed, listener, ..
            } = bound;
            let _ = shutdown.await;
            drop(listener);
            drop(closed);
        });
    }

    #[tokio::test]
    async fn test_close_all_on_empty_set_is_noop() {
        let tracker = ServerTracker::new();
        assert_eq!(tracker.close_all().await, CleanupReport::default());
        assert_eq!(tracker.close_all().await, CleanupReport::default());
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_listen_tracks_and_close_all_clears() {
        let tracker = ServerTracker::new();
        let a = tracker.listen(ListenerKind::Tcp, loopback()).unwrap();
        let b = tracker.listen(ListenerKind::Http, loopback()).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.addresses_of(ListenerKind::Http), vec![b.local_addr]);

        serve(a);
        serve(b);

        let report = tracker.close_all().await;
        assert_eq!(report, CleanupReport { closed: 2, failed: 0 });
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_port_is_reusable_after_close_all() {
        let tracker = ServerTracker::new();
        let first = tracker.listen(ListenerKind::Tcp, loopback()).unwrap();
        let addr = first.local_addr;
        serve(first);

        tracker.close_all().await;

        let again = tracker.listen(ListenerKind::Tcp, addr).unwrap();
        assert_eq!(again.local_addr, addr);
    }

    #[tokio::test]
    async fn test_guard_drop_untracks() {
        let tracker = ServerTracker::new();
        let bound = tracker.listen(ListenerKind::Tcp, loopback()).unwrap();
        let id = bound.id;
        assert!(tracker.contains(id));
        drop(bound);
        assert!(!tracker.contains(id));
        assert!(!tracker.close(id, CloseMode::Graceful));
    }

    #[tokio::test]
    async fn test_close_single_listener() {
        let tracker = ServerTracker::new();
        let bound = tracker.listen(ListenerKind::Tcp, loopback()).unwrap();
        let id = bound.id;
        let BoundListener {
            shutdown, closed, ..
        } = bound;

        assert!(tracker.close(id, CloseMode::Graceful));
        assert!(!tracker.close(id, CloseMode::Graceful));
        assert_eq!(shutdown.await.unwrap(), CloseMode::Graceful);
        drop(closed);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_an_error() {
        let tracker = ServerTracker::new();
        let first = tracker.listen(ListenerKind::Tcp, loopback()).unwrap();
        let err = tracker.listen(ListenerKind::Tcp, first.local_addr);
        assert!(err.is_err());
        assert_eq!(tracker.len(), 1);
    }
}
