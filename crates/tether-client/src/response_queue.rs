//! Responses that could not be delivered because the link was down.
//!
//! Strict FIFO, bounded, drop-oldest. A flush stops at the first send
//! failure and keeps that entry and everything after it.

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tether_core::protocol::ProtocolResponse;
use tracing::{debug, info, warn};

/// Bounded buffer of undelivered responses.
pub struct ResponseDeliveryQueue {
    entries: Mutex<VecDeque<ProtocolResponse>>,
    max_size: usize,
    dropped: AtomicU64,
}

impl ResponseDeliveryQueue {
    /// Create an empty queue holding at most `max_size` responses.
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_size,
            dropped: AtomicU64::new(0),
        }
    }

    /// Append a response, evicting the oldest when full.
    ///
    /// Returns the evicted response, if any.
    pub fn enqueue(&self, response: ProtocolResponse) -> Option<ProtocolResponse> {
        let mut entries = self.entries.lock();
        self.push_locked(&mut entries, response)
    }

    fn push_locked(
        &self,
        entries: &mut VecDeque<ProtocolResponse>,
        response: ProtocolResponse,
    ) -> Option<ProtocolResponse> {
        if self.max_size == 0 {
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(request_id = %response.id, "response queue has no capacity, dropping");
            return Some(response);
        }
        let evicted = if entries.len() >= self.max_size {
            let oldest = entries.pop_front();
            if let Some(oldest) = &oldest {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(request_id = %oldest.id, "response queue full, dropped oldest");
            }
            oldest
        } else {
            None
        };
        debug!(request_id = %response.id, queued = entries.len() + 1, "response queued");
        entries.push_back(response);
        evicted
    }

    /// Send queued responses in order through `send`.
    ///
    /// Stops at the first error, keeping the failed entry at the head.
    /// Returns how many were sent.
    pub fn flush<F, E>(&self, mut send: F) -> usize
    where
        F: FnMut(&ProtocolResponse) -> Result<(), E>,
        E: Display,
    {
        let mut entries = self.entries.lock();
        if entries.is_empty() {
            return 0;
        }
        let total = entries.len();
        let sent = drain(&mut entries, &mut send);
        info!(sent, total, "flushed queued responses");
        sent
    }

    /// Send `response` after everything already queued, keeping FIFO order.
    ///
    /// Earlier entries are flushed first under the same lock. If any send
    /// fails, `response` is queued behind whatever is left. Returns an
    /// entry evicted to make room, if any.
    pub fn deliver<F, E>(
        &self,
        response: ProtocolResponse,
        mut send: F,
    ) -> Option<ProtocolResponse>
    where
        F: FnMut(&ProtocolResponse) -> Result<(), E>,
        E: Display,
    {
        let mut entries = self.entries.lock();
        if !entries.is_empty() {
            let total = entries.len();
            let sent = drain(&mut entries, &mut send);
            debug!(sent, total, "flushed backlog before fresh response");
        }
        if entries.is_empty() {
            match send(&response) {
                Ok(()) => return None,
                Err(err) => {
                    warn!(request_id = %response.id, error = %err, "send failed, queueing response");
                }
            }
        }
        self.push_locked(&mut entries, response)
    }

    /// Number of queued responses.
    pub fn size(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Discard everything queued. Returns how many were discarded.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let n = entries.len();
        entries.clear();
        n
    }

    /// Responses evicted since creation.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Configured capacity.
    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

/// Send from the head until one fails; the failed entry stays at the head.
fn drain<F, E>(entries: &mut VecDeque<ProtocolResponse>, send: &mut F) -> usize
where
    F: FnMut(&ProtocolResponse) -> Result<(), E>,
    E: Display,
{
    let mut sent = 0;
    while let Some(response) = entries.pop_front() {
        if let Err(err) = send(&response) {
            warn!(
                request_id = %response.id,
                error = %err,
                remaining = entries.len() + 1,
                "flush interrupted"
            );
            entries.push_front(response);
            break;
        }
        sent += 1;
    }
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::RequestId;

    fn response(n: usize) -> ProtocolResponse {
        ProtocolResponse::success(RequestId::from(format!("req_{n}").as_str()), Some(json!(n)))
    }

    fn ids(sent: &[ProtocolResponse]) -> Vec<String> {
        sent.iter().map(|r| r.id.as_str().to_owned()).collect()
    }

    #[test]
    fn overflow_drops_oldest_and_flushes_rest_in_order() {
        let queue = ResponseDeliveryQueue::new(3);
        for n in 0..4 {
            let evicted = queue.enqueue(response(n));
            assert_eq!(evicted.is_some(), n == 3);
        }
        assert_eq!(queue.size(), 3);
        assert_eq!(queue.dropped_count(), 1);

        let mut sent = Vec::new();
        let count = queue.flush(|r| {
            sent.push(r.clone());
            Ok::<(), String>(())
        });
        assert_eq!(count, 3);
        assert_eq!(ids(&sent), ["req_1", "req_2", "req_3"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn deliver_sends_backlog_before_fresh_response() {
        let queue = ResponseDeliveryQueue::new(10);
        let _ = queue.enqueue(response(0));
        let _ = queue.enqueue(response(1));

        let mut sent = Vec::new();
        let evicted = queue.deliver(response(2), |r| {
            sent.push(r.clone());
            Ok::<(), String>(())
        });
        assert!(evicted.is_none());
        assert_eq!(ids(&sent), ["req_0", "req_1", "req_2"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn deliver_queues_behind_unsent_backlog() {
        let queue = ResponseDeliveryQueue::new(10);
        let _ = queue.enqueue(response(0));
        let _ = queue.enqueue(response(1));

        let mut attempts = 0;
        let _ = queue.deliver(response(2), |_| {
            attempts += 1;
            if attempts == 2 { Err("socket closed") } else { Ok(()) }
        });
        assert_eq!(attempts, 2);

        let mut sent = Vec::new();
        let _ = queue.flush(|r| {
            sent.push(r.clone());
            Ok::<(), String>(())
        });
        assert_eq!(ids(&sent), ["req_1", "req_2"]);
    }

    #[test]
    fn deliver_queues_fresh_response_when_send_fails() {
        let queue = ResponseDeliveryQueue::new(10);
        let evicted = queue.deliver(response(0), |_| Err("not connected"));
        assert!(evicted.is_none());
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn partial_flush_keeps_failed_entry_and_rest() {
        let queue = ResponseDeliveryQueue::new(10);
        for n in 0..4 {
            let _ = queue.enqueue(response(n));
        }

        let mut calls = 0;
        let sent = queue.flush(|_| {
            calls += 1;
            if calls == 3 { Err("link down") } else { Ok(()) }
        });
        assert_eq!(sent, 2);
        assert_eq!(queue.size(), 2);

        let mut rest = Vec::new();
        let _ = queue.flush(|r| {
            rest.push(r.clone());
            Ok::<(), String>(())
        });
        assert_eq!(ids(&rest), ["req_2", "req_3"]);
    }

    #[test]
    fn flush_on_empty_queue_sends_nothing() {
        let queue = ResponseDeliveryQueue::new(4);
        let sent = queue.flush(|_| -> Result<(), String> { panic!("nothing to send") });
        assert_eq!(sent, 0);
    }

    #[test]
    fn clear_discards_everything() {
        let queue = ResponseDeliveryQueue::new(4);
        let _ = queue.enqueue(response(1));
        let _ = queue.enqueue(response(2));
        assert_eq!(queue.clear(), 2);
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn zero_capacity_drops_immediately() {
        let queue = ResponseDeliveryQueue::new(0);
        assert!(queue.enqueue(response(1)).is_some());
        assert!(queue.is_empty());
        assert_eq!(queue.dropped_count(), 1);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn keeps_newest_in_order(max in 1usize..16, n in 0usize..64) {
                let queue = ResponseDeliveryQueue::new(max);
                for i in 0..n {
                    let _ = queue.enqueue(response(i));
                }
                let mut sent = Vec::new();
                let _ = queue.flush(|r| {
                    sent.push(r.clone());
                    Ok::<(), String>(())
                });
                let expected: Vec<String> =
                    (n.saturating_sub(max)..n).map(|i| format!("req_{i}")).collect();
                prop_assert_eq!(ids(&sent), expected);
            }
        }
    }
}
