//! Pending-request correlation.
//!
//! Outgoing request ids are a monotonically increasing integer counter local
//! to one client. Each in-flight request parks a oneshot sender here; the
//! dispatch loop resolves it exactly once when the matching response id
//! arrives. Responses for unknown ids are discarded with a warning at the
//! call site.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use mcpmux_protocol::{JsonRpcResponse, RequestId};
use tokio::sync::oneshot;

use crate::error::ClientError;

type Resolver = oneshot::Sender<Result<JsonRpcResponse, ClientError>>;

/// Correlation table for one upstream client.
#[derive(Debug, Default)]
pub(crate) struct PendingMap {
    next_id: AtomicI64,
    waiters: Mutex<HashMap<i64, Resolver>>,
}

impl PendingMap {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next request id and park a resolver for it.
    pub(crate) fn register(
        &self,
    ) -> (i64, oneshot::Receiver<Result<JsonRpcResponse, ClientError>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("pending map poisoned")
            .insert(id, tx);
        (id, rx)
    }

    /// Resolve the waiter for `id` with `response`. Returns false when no
    /// waiter exists (already resolved, cancelled, or never ours).
    pub(crate) fn resolve(&self, id: &RequestId, response: JsonRpcResponse) -> bool {
        let RequestId::Number(id) = id else {
            return false;
        };
        let resolver = self.waiters.lock().expect("pending map poisoned").remove(id);
        match resolver {
            Some(tx) => tx.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    /// Drop the waiter for `id` without resolving it. The receiver observes
    /// a closed channel, which callers map to cancellation.
    pub(crate) fn discard(&self, id: i64) -> bool {
        self.waiters
            .lock()
            .expect("pending map poisoned")
            .remove(&id)
            .is_some()
    }

    /// Fail every in-flight request. `error` is invoked once per waiter.
    pub(crate) fn fail_all(&self, error: impl Fn() -> ClientError) {
        let waiters: Vec<Resolver> = {
            let mut guard = self.waiters.lock().expect("pending map poisoned");
            guard.drain().map(|(_, tx)| tx).collect()
        };
        for tx in waiters {
            let _ = tx.send(Err(error()));
        }
    }

    /// Number of requests currently awaiting a response.
    pub(crate) fn len(&self) -> usize {
        self.waiters.lock().expect("pending map poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpmux_protocol::RequestId;
    use serde_json::json;

    #[tokio::test]
    async fn resolves_exactly_once() {
        let pending = PendingMap::new();
        let (id, rx) = pending.register();
        let response = JsonRpcResponse::success(RequestId::Number(id), json!({"ok": true}));

        assert!(pending.resolve(&RequestId::Number(id), response.clone()));
        // Second resolution finds no waiter.
        assert!(!pending.resolve(&RequestId::Number(id), response));

        let received = rx.await.unwrap().unwrap();
        assert_eq!(received.result(), Some(&json!({"ok": true})));
    }

    #[test]
    fn unknown_ids_are_reported() {
        let pending = PendingMap::new();
        let response = JsonRpcResponse::success(RequestId::Number(99), json!(null));
        assert!(!pending.resolve(&RequestId::Number(99), response));

        let stringy = JsonRpcResponse::success(RequestId::from("abc"), json!(null));
        assert!(!pending.resolve(&RequestId::from("abc"), stringy));
    }

    #[tokio::test]
    async fn fail_all_delivers_an_error_to_every_waiter() {
        let pending = PendingMap::new();
        let (_, rx1) = pending.register();
        let (_, rx2) = pending.register();
        assert_eq!(pending.len(), 2);

        pending.fail_all(|| ClientError::Cancelled);
        assert_eq!(pending.len(), 0);
        assert!(matches!(rx1.await.unwrap(), Err(ClientError::Cancelled)));
        assert!(matches!(rx2.await.unwrap(), Err(ClientError::Cancelled)));
    }

    #[tokio::test]
    async fn discard_closes_the_channel() {
        let pending = PendingMap::new();
        let (id, rx) = pending.register();
        assert!(pending.discard(id));
        assert!(rx.await.is_err());
    }

    #[test]
    fn ids_increase_monotonically() {
        let pending = PendingMap::new();
        let (a, _rx_a) = pending.register();
        let (b, _rx_b) = pending.register();
        assert!(b > a);
    }
}
