//! Pending request table - maps correlation IDs to waiting clients.
//!
//! Flow:
//! 1. The multiplexer calls `register()` and gets a oneshot receiver.
//! 2. It frames the request and hands it to the host link.
//! 3. The link's read loop routes the reply through `complete()`.
//! 4. The multiplexer awaits the receiver, bounded by the resolved timeout.
//!
//! Every entry is completed, cancelled, failed on disconnect, or reaped
//! after its client abandoned it; nothing leaks.

use crate::domain::correlation::{RequestId, RequestIdCounter};
use crate::domain::error::ApiError;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

struct PendingRequest {
    sender: oneshot::Sender<Result<Value, ApiError>>,
    endpoint: String,
    created_at: Instant,
}

/// Counters kept for logging and tests.
#[derive(Debug, Default)]
pub struct PendingStats {
    pub registered: AtomicU64,
    pub completed: AtomicU64,
    pub dropped: AtomicU64,
}

/// In-memory registry of requests awaiting a host reply.
pub struct PendingStore {
    pending: DashMap<RequestId, PendingRequest>,
    ids: RequestIdCounter,
    stats: PendingStats,
}

impl PendingStore {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            ids: RequestIdCounter::new(),
            stats: PendingStats::default(),
        }
    }

    /// Register a new pending request, returning its correlation id and the
    /// receiver the reply will arrive on.
    pub fn register(
        &self,
        endpoint: &str,
    ) -> (RequestId, oneshot::Receiver<Result<Value, ApiError>>) {
        let id = self.ids.next();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingRequest {
                sender: tx,
                endpoint: endpoint.to_string(),
                created_at: Instant::now(),
            },
        );
        self.stats.registered.fetch_add(1, Ordering::Relaxed);
        debug!(id = %id, endpoint, "registered pending request");
        (id, rx)
    }

    /// Complete a pending request. Returns false when the id is unknown or
    /// the client already went away; the reply is dropped either way.
    pub fn complete(&self, id: RequestId, result: Result<Value, ApiError>) -> bool {
        let Some((_, entry)) = self.pending.remove(&id) else {
            warn!(id = %id, "reply for unknown or expired correlation id, dropping");
            return false;
        };
        let elapsed = entry.created_at.elapsed();
        match entry.sender.send(result) {
            Ok(()) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    id = %id,
                    endpoint = %entry.endpoint,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "completed pending request"
                );
                true
            }
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(id = %id, endpoint = %entry.endpoint, "client abandoned request, reply dropped");
                false
            }
        }
    }

    /// Remove an entry without completing it (send failure, local timeout).
    pub fn cancel(&self, id: &RequestId) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Fail every outstanding request. Used when the host link drops.
    pub fn fail_all(&self, error: ApiError) -> usize {
        let ids: Vec<RequestId> = self.pending.iter().map(|e| *e.key()).collect();
        let count = ids.len();
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                let _ = entry.sender.send(Err(error.clone()));
            }
        }
        count
    }

    /// Drop entries whose client stopped waiting (HTTP disconnect, WS close
    /// on a request with no deadline). The host reply, if it ever arrives,
    /// is discarded by `complete`.
    pub fn sweep_abandoned(&self) -> usize {
        let mut removed = 0;
        self.pending.retain(|id, entry| {
            if entry.sender.is_closed() {
                debug!(id = %id, endpoint = %entry.endpoint, "reaping abandoned request");
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            self.stats.dropped.fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }
}

impl Default for PendingStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Background task that periodically reaps abandoned entries.
pub async fn reaper_task(store: Arc<PendingStore>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        store.sweep_abandoned();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_complete() {
        let store = PendingStore::new();
        let (id, rx) = store.register("/printer/gcode");
        assert_eq!(store.len(), 1);

        assert!(store.complete(id, Ok(json!("ok"))));
        assert_eq!(rx.await.unwrap().unwrap(), json!("ok"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_reply_routed_at_most_once() {
        let store = PendingStore::new();
        let (id, _rx) = store.register("/printer/endstops");
        assert!(store.complete(id, Ok(json!(null))));
        assert!(!store.complete(id, Ok(json!(null))));
    }

    #[tokio::test]
    async fn test_unknown_id_dropped() {
        let store = PendingStore::new();
        assert!(!store.complete(RequestId::from_raw(999), Ok(json!(null))));
    }

    #[tokio::test]
    async fn test_fail_all_on_disconnect() {
        let store = PendingStore::new();
        let (_, rx1) = store.register("/printer/gcode");
        let (_, rx2) = store.register("/printer/endstops");

        assert_eq!(store.fail_all(ApiError::HostDisconnected), 2);
        assert!(store.is_empty());
        assert!(matches!(
            rx1.await.unwrap(),
            Err(ApiError::HostDisconnected)
        ));
        assert!(matches!(
            rx2.await.unwrap(),
            Err(ApiError::HostDisconnected)
        ));
    }

    #[tokio::test]
    async fn test_sweep_abandoned() {
        let store = PendingStore::new();
        let (_, rx) = store.register("/printer/gcode");
        let (_, _live) = store.register("/printer/endstops");
        drop(rx);

        assert_eq!(store.sweep_abandoned(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_correlation_ids_unique() {
        let store = PendingStore::new();
        let (a, _rx_a) = store.register("/a");
        let (b, _rx_b) = store.register("/b");
        assert_ne!(a, b);
    }
}
