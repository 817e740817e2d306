//! Request/response correlation.
//!
//! Each outgoing request gets a fresh [`RequestId`] and a pending entry
//! holding a oneshot sender. The entry is removed exactly once: by the
//! matching response, by the timeout, by a send failure, or by the
//! connection it was routed through going away.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde_json::Value;
use tether_core::protocol::{ProtocolRequest, ProtocolResponse};
use tether_core::{BridgeError, ClientId, RequestId};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::connection::ClientConnection;
use crate::metrics::{
    BRIDGE_REQUEST_DURATION_SECONDS, BRIDGE_REQUEST_ERRORS_TOTAL, BRIDGE_REQUESTS_TOTAL,
    BRIDGE_UNMATCHED_RESPONSES_TOTAL,
};

type Reply = Result<Value, BridgeError>;

struct PendingRequest {
    action: String,
    client_id: ClientId,
    tx: oneshot::Sender<Reply>,
}

type PendingMap = Arc<Mutex<HashMap<RequestId, PendingRequest>>>;

/// Removes the pending entry when the awaiting future finishes or is dropped.
struct PendingGuard {
    pending: PendingMap,
    id: RequestId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let _ = self.pending.lock().remove(&self.id);
    }
}

/// Correlates requests sent to clients with the responses they send back.
#[derive(Default)]
pub struct RequestRouter {
    pending: PendingMap,
}

impl RequestRouter {
    /// Create a router with no outstanding requests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `action` to `target` and wait for its response.
    pub async fn send_request(
        &self,
        target: &ClientConnection,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let request = ProtocolRequest {
            id: RequestId::new(),
            action: action.to_owned(),
            payload,
        };
        let frame = request
            .to_json()
            .map_err(|e| BridgeError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        let _ = self.pending.lock().insert(
            request.id.clone(),
            PendingRequest {
                action: request.action.clone(),
                client_id: target.id.clone(),
                tx,
            },
        );
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            id: request.id.clone(),
        };

        counter!(BRIDGE_REQUESTS_TOTAL, "action" => request.action.clone()).increment(1);
        let started = Instant::now();

        if !target.send(Arc::new(frame)) {
            let err = BridgeError::Send(format!("connection {} is not accepting frames", target.id));
            record_error(&err);
            return Err(err);
        }
        debug!(request_id = %request.id, action, client_id = %target.id, "request sent");

        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            // Sender dropped without a reply: the entry was cleared underneath us.
            Ok(Err(_)) => Err(BridgeError::ConnectionClosed),
            Err(_) => {
                #[allow(clippy::cast_possible_truncation)]
                let timeout_ms = timeout.as_millis() as u64;
                warn!(request_id = %request.id, action, timeout_ms, "request timed out");
                Err(BridgeError::Timeout {
                    action: request.action.clone(),
                    timeout_ms,
                })
            }
        };

        histogram!(BRIDGE_REQUEST_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        if let Err(err) = &result {
            record_error(err);
        }
        result
    }

    /// Resolve the pending request matching `response.id`.
    ///
    /// Returns `false` (and logs) when no request is waiting for this id.
    pub fn handle_response(&self, response: ProtocolResponse) -> bool {
        let Some(pending) = self.pending.lock().remove(&response.id) else {
            warn!(request_id = %response.id, "response for unknown request dropped");
            counter!(BRIDGE_UNMATCHED_RESPONSES_TOTAL).increment(1);
            return false;
        };
        let reply = if response.ok {
            Ok(response.data.unwrap_or(Value::Null))
        } else {
            Err(BridgeError::action(response.error))
        };
        debug!(
            request_id = %response.id,
            action = %pending.action,
            ok = response.ok,
            "response matched"
        );
        let _ = pending.tx.send(reply);
        true
    }

    /// Reject every request routed through `client_id` with `err`.
    pub fn fail_client(&self, client_id: &ClientId, err: &BridgeError) -> usize {
        let failed: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let ids: Vec<RequestId> = pending
                .iter()
                .filter(|(_, p)| &p.client_id == client_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        let count = failed.len();
        for request in failed {
            let _ = request.tx.send(Err(err.clone()));
        }
        if count > 0 {
            warn!(client_id = %client_id, count, error = %err, "rejected in-flight requests");
        }
        count
    }

    /// Reject every outstanding request with `err`.
    pub fn fail_all(&self, err: &BridgeError) -> usize {
        let drained: Vec<PendingRequest> = self.pending.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for request in drained {
            let _ = request.tx.send(Err(err.clone()));
        }
        count
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

fn record_error(err: &BridgeError) {
    let kind = match err.kind() {
        tether_core::ErrorKind::Connection => "connection",
        tether_core::ErrorKind::Routing => "routing",
        tether_core::ErrorKind::Timeout => "timeout",
        tether_core::ErrorKind::Capacity => "capacity",
        tether_core::ErrorKind::Protocol => "protocol",
        tether_core::ErrorKind::Action => "action",
    };
    counter!(BRIDGE_REQUEST_ERRORS_TOTAL, "kind" => kind).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn make_target() -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(16);
        (Arc::new(ClientConnection::new(ClientId::new(), tx)), rx)
    }

    async fn next_request(rx: &mut mpsc::Receiver<Arc<String>>) -> ProtocolRequest {
        let frame = rx.recv().await.unwrap();
        serde_json::from_str(&frame).unwrap()
    }

    #[tokio::test]
    async fn response_resolves_request() {
        let router = Arc::new(RequestRouter::new());
        let (target, mut rx) = make_target();

        let r = Arc::clone(&router);
        let t = Arc::clone(&target);
        let call = tokio::spawn(async move {
            r.send_request(&t, "getTabs", json!({"windowId": 1}), Duration::from_secs(5))
                .await
        });

        let request = next_request(&mut rx).await;
        assert_eq!(request.action, "getTabs");
        assert_eq!(request.payload["windowId"], 1);
        assert!(router.handle_response(ProtocolResponse::success(
            request.id,
            Some(json!({"tabs": []}))
        )));

        assert_eq!(call.await.unwrap().unwrap(), json!({"tabs": []}));
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn failed_response_rejects_with_action_error() {
        let router = Arc::new(RequestRouter::new());
        let (target, mut rx) = make_target();

        let r = Arc::clone(&router);
        let t = Arc::clone(&target);
        let call = tokio::spawn(async move {
            r.send_request(&t, "click", Value::Null, Duration::from_secs(5)).await
        });

        let request = next_request(&mut rx).await;
        let _ = router.handle_response(ProtocolResponse::failure(request.id, "no such element"));
        assert_matches!(call.await.unwrap(), Err(BridgeError::Action(msg)) if msg == "no such element");
    }

    #[tokio::test]
    async fn missing_data_resolves_to_null() {
        let router = Arc::new(RequestRouter::new());
        let (target, mut rx) = make_target();

        let r = Arc::clone(&router);
        let t = Arc::clone(&target);
        let call = tokio::spawn(async move {
            r.send_request(&t, "noop", Value::Null, Duration::from_secs(5)).await
        });
        let request = next_request(&mut rx).await;
        let _ = router.handle_response(ProtocolResponse::success(request.id, None));
        assert_eq!(call.await.unwrap().unwrap(), Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_and_cleans_up() {
        let router = RequestRouter::new();
        let (target, _rx) = make_target();

        let result = router
            .send_request(&target, "navigate", Value::Null, Duration::from_millis(250))
            .await;
        assert_matches!(
            &result,
            Err(BridgeError::Timeout { action, timeout_ms: 250 }) if action == "navigate"
        );
        assert_eq!(
            result.unwrap_err().to_string(),
            "Request navigate timed out after 250ms"
        );
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn send_failure_rejects_immediately() {
        let router = RequestRouter::new();
        let (target, rx) = make_target();
        drop(rx);

        let result = router
            .send_request(&target, "click", Value::Null, Duration::from_secs(30))
            .await;
        assert_matches!(result, Err(BridgeError::Send(_)));
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_after_timeout_is_dropped() {
        let router = Arc::new(RequestRouter::new());
        let (target, mut rx) = make_target();

        let result = router
            .send_request(&target, "slow", Value::Null, Duration::from_millis(10))
            .await;
        assert_matches!(result, Err(BridgeError::Timeout { .. }));

        let request = next_request(&mut rx).await;
        assert!(!router.handle_response(ProtocolResponse::success(request.id, None)));
    }

    #[test]
    fn unknown_response_is_ignored() {
        let router = RequestRouter::new();
        assert!(!router.handle_response(ProtocolResponse::success(RequestId::new(), None)));
    }

    #[tokio::test]
    async fn duplicate_response_matches_once() {
        let router = Arc::new(RequestRouter::new());
        let (target, mut rx) = make_target();

        let r = Arc::clone(&router);
        let t = Arc::clone(&target);
        let call = tokio::spawn(async move {
            r.send_request(&t, "ping", Value::Null, Duration::from_secs(5)).await
        });
        let request = next_request(&mut rx).await;
        let response = ProtocolResponse::success(request.id, Some(json!(1)));
        assert!(router.handle_response(response.clone()));
        assert!(!router.handle_response(response));
        assert_eq!(call.await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test(start_paused = true)]
    async fn fail_client_rejects_only_its_requests_without_waiting() {
        let router = Arc::new(RequestRouter::new());
        let (a, mut rx_a) = make_target();
        let (b, mut rx_b) = make_target();

        let mut calls = Vec::new();
        for _ in 0..3 {
            let r = Arc::clone(&router);
            let t = Arc::clone(&a);
            calls.push(tokio::spawn(async move {
                r.send_request(&t, "work", Value::Null, Duration::from_secs(3600)).await
            }));
        }
        let r = Arc::clone(&router);
        let t = Arc::clone(&b);
        let other = tokio::spawn(async move {
            r.send_request(&t, "work", Value::Null, Duration::from_secs(3600)).await
        });
        for _ in 0..3 {
            let _ = next_request(&mut rx_a).await;
        }
        let other_request = next_request(&mut rx_b).await;

        assert_eq!(router.fail_client(&a.id, &BridgeError::PrimaryClosed), 3);
        for call in calls {
            assert_matches!(call.await.unwrap(), Err(BridgeError::PrimaryClosed));
        }

        assert_eq!(router.pending_count(), 1);
        let _ = router.handle_response(ProtocolResponse::success(other_request.id, None));
        assert!(other.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn fail_all_rejects_everything() {
        let router = Arc::new(RequestRouter::new());
        let (target, mut rx) = make_target();

        let r = Arc::clone(&router);
        let t = Arc::clone(&target);
        let call = tokio::spawn(async move {
            r.send_request(&t, "work", Value::Null, Duration::from_secs(60)).await
        });
        let _ = next_request(&mut rx).await;
        assert_eq!(router.fail_all(&BridgeError::Shutdown), 1);
        assert_matches!(call.await.unwrap(), Err(BridgeError::Shutdown));
    }

    #[tokio::test]
    async fn dropped_caller_clears_pending_entry() {
        let router = Arc::new(RequestRouter::new());
        let (target, mut rx) = make_target();

        let r = Arc::clone(&router);
        let t = Arc::clone(&target);
        let call = tokio::spawn(async move {
            r.send_request(&t, "work", Value::Null, Duration::from_secs(60)).await
        });
        let _ = next_request(&mut rx).await;
        assert_eq!(router.pending_count(), 1);
        call.abort();
        let _ = call.await;
        assert_eq!(router.pending_count(), 0);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn each_response_resolves_its_own_request(order in Just((0usize..6).collect::<Vec<_>>()).prop_shuffle()) {
                let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
                rt.block_on(async {
                    let router = Arc::new(RequestRouter::new());
                    let (target, mut rx) = make_target();

                    let mut calls = Vec::new();
                    for i in 0..6 {
                        let r = Arc::clone(&router);
                        let t = Arc::clone(&target);
                        calls.push(tokio::spawn(async move {
                            r.send_request(&t, "echo", json!({"n": i}), Duration::from_secs(60)).await
                        }));
                    }
                    let mut requests = Vec::new();
                    for _ in 0..6 {
                        requests.push(next_request(&mut rx).await);
                    }

                    let stray = ProtocolResponse::success(RequestId::new(), Some(json!("stray")));
                    assert!(!router.handle_response(stray));

                    for &i in &order {
                        let req = &requests[i];
                        let echoed = req.payload.clone();
                        assert!(router.handle_response(ProtocolResponse::success(req.id.clone(), Some(echoed))));
                    }
                    for (i, call) in calls.into_iter().enumerate() {
                        assert_eq!(call.await.unwrap().unwrap(), json!({"n": i}));
                    }
                    assert_eq!(router.pending_count(), 0);
                });
            }
        }
    }
}
